use regex::RegexSet;
use std::sync::LazyLock;

static QUOTA_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)usage\s*limit",
        r"(?i)quota",
        r"(?i)exceeded",
        r"(?i)insufficient\s+credits",
        r"(?i)insufficient\s+quota",
        r"(?i)credits?\s+exhausted",
    ])
    .expect("valid quota patterns")
});

/// Heuristic: does this output look like the account ran out of quota?
pub fn is_quota_signal(text: &str) -> bool {
    QUOTA_PATTERNS.is_match(text)
}
