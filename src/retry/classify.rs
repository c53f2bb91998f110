use std::sync::OnceLock;

use regex::Regex;

use super::reasons;

fn patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                r"(?i)(being used by another process|resource busy|text file busy|sharing violation|\.lock['\x22]?: file exists|unable to create .*\.lock|EBUSY|EAGAIN|temporarily unavailable|locked)",
                reasons::TRANSIENT_LOCK,
            ),
            (
                r"(?i)(permission denied|access is denied|operation not permitted|EACCES|EPERM)",
                reasons::PERMISSION_DENIED,
            ),
            (
                r"(?i)(already exists|file exists|EEXIST|destination .* exists|cannot create .*: exists)",
                reasons::DETERMINISTIC_COLLISION,
            ),
            (r"(?i)(timed out|timeout|deadline exceeded)", reasons::EXECUTOR_TIMEOUT),
            (r"(?i)protected path", reasons::PROTECTED_PATH),
        ]
        .into_iter()
        .filter_map(|(pattern, reason)| Regex::new(pattern).ok().map(|re| (re, reason)))
        .collect()
    })
}

/// Map raw executor or OS error text onto a retry policy key.
///
/// The first matching pattern wins; text matching nothing is `unknown`.
pub fn classify_failure(message: &str) -> &'static str {
    patterns()
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, reason)| *reason)
        .unwrap_or(reasons::UNKNOWN)
}
