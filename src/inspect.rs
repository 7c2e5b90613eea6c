use anyhow::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Serialize;
use serde_json::Value;
use std::{fs, path::Path};
use tracing::debug;

use crate::{paths, status};

pub use crate::status::AccountStatus;

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    pub expires_at_ms: Option<i64>,
}

/// Point-in-time view of one account's credentials and run history.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountInspection {
    pub name: String,
    pub logged_in: bool,
    pub token_details: TokenDetails,
    pub status: AccountStatus,
}

pub fn inspect(base: &Path, name: &str) -> Result<AccountInspection> {
    let dir = paths::account_dir(base, name);
    let auth = paths::auth_path(&dir);

    let logged_in = auth.is_file();
    let expires_at_ms = if logged_in {
        fs::read_to_string(&auth)
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .and_then(|v| token_expiry_ms(&v))
    } else {
        None
    };

    Ok(AccountInspection {
        name: name.to_string(),
        logged_in,
        token_details: TokenDetails { expires_at_ms },
        status: status::load(&dir)?,
    })
}

/// Expiry of the access token in auth.json, read from its JWT `exp` claim.
pub fn token_expiry_ms(auth: &Value) -> Option<i64> {
    let tokens = auth.get("tokens")?;
    ["access_token", "id_token"]
        .iter()
        .filter_map(|key| tokens.get(*key)?.as_str())
        .find_map(jwt_expiry_ms)
}

fn jwt_expiry_ms(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_f64()?;
    if !exp.is_finite() || exp <= 0.0 {
        debug!("ignoring non-positive exp claim");
        return None;
    }
    Some((exp * 1000.0) as i64)
}
