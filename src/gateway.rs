//! Settings shared with the token-refreshing gateway.
//!
//! Only the configuration contract lives here: read `gateway.json`, lay it
//! over the defaults and clamp every value into its valid range.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::{paths, registry};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub bind_address: String,
    pub port: u16,
    pub base_url: String,
    pub oauth_client_id: String,
    pub cooldown_seconds: u64,
    pub max_retry_passes: u64,
    pub request_timeout_ms: u64,
    pub upstream_max_retries: u64,
    pub upstream_retry_base_ms: u64,
    pub upstream_retry_max_ms: u64,
    pub upstream_retry_jitter_ms: u64,
    pub override_auth: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".into(),
            port: 4319,
            base_url: "https://chatgpt.com/backend-api/codex".into(),
            oauth_client_id: "app_EMoamEEZ73f0CkXaXp7hrann".into(),
            cooldown_seconds: 900,
            max_retry_passes: 1,
            request_timeout_ms: 120_000,
            upstream_max_retries: 2,
            upstream_retry_base_ms: 200,
            upstream_retry_max_ms: 2_000,
            upstream_retry_jitter_ms: 120,
            override_auth: true,
        }
    }
}

impl GatewayConfig {
    /// Lay `overrides` (any JSON, usually a partial object) over the
    /// defaults. Wrong types and blank strings fall back to the default;
    /// out-of-range numbers are clamped.
    pub fn resolve(overrides: &Value) -> Self {
        let d = Self::default();
        let get = |key: &str| overrides.get(key);
        let num = |key: &str, fallback: u64, min: u64, max: Option<u64>| {
            clamp_int(get(key), fallback, min, max)
        };

        let upstream_retry_base_ms = num("upstreamRetryBaseMs", d.upstream_retry_base_ms, 0, None);

        Self {
            bind_address: non_blank(get("bindAddress"), &d.bind_address),
            // clamped into 1..=65535 so the narrowing cannot fail
            port: u16::try_from(num("port", d.port.into(), 1, Some(65_535))).unwrap_or(d.port),
            base_url: non_blank(get("baseUrl"), &d.base_url),
            oauth_client_id: non_blank(get("oauthClientId"), &d.oauth_client_id),
            cooldown_seconds: num("cooldownSeconds", d.cooldown_seconds, 0, None),
            max_retry_passes: num("maxRetryPasses", d.max_retry_passes, 0, None),
            request_timeout_ms: num("requestTimeoutMs", d.request_timeout_ms, 1_000, None),
            upstream_max_retries: num("upstreamMaxRetries", d.upstream_max_retries, 0, None),
            upstream_retry_base_ms,
            upstream_retry_max_ms: num(
                "upstreamRetryMaxMs",
                d.upstream_retry_max_ms.max(upstream_retry_base_ms),
                upstream_retry_base_ms,
                None,
            ),
            upstream_retry_jitter_ms: num("upstreamRetryJitterMs", d.upstream_retry_jitter_ms, 0, None),
            override_auth: get("overrideAuth")
                .and_then(Value::as_bool)
                .unwrap_or(d.override_auth),
        }
    }

    pub fn cooldown_ms(&self) -> i64 {
        i64::try_from(self.cooldown_seconds.saturating_mul(1_000)).unwrap_or(i64::MAX)
    }
}

/// Raw overrides from `<base>/gateway.json`; missing or corrupt is `{}`.
pub fn load_overrides(base: &Path) -> Result<Value> {
    Ok(registry::read_json_document(&paths::gateway_path(base))?
        .unwrap_or_else(|| Value::Object(Default::default())))
}

pub fn load(base: &Path) -> Result<GatewayConfig> {
    Ok(GatewayConfig::resolve(&load_overrides(base)?))
}

fn non_blank(value: Option<&Value>, fallback: &str) -> String {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn clamp_int(value: Option<&Value>, fallback: u64, min: u64, max: Option<u64>) -> u64 {
    let Some(n) = value.and_then(Value::as_f64).filter(|n| n.is_finite()) else {
        return fallback;
    };
    let floored = n.floor();
    // float-to-int `as` saturates, negatives land on 0 before the min clamp
    let clamped = (floored as u64).max(min);
    match max {
        Some(max) => clamped.min(max),
        None => clamped,
    }
}
