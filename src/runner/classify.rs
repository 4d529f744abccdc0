//! Transient network error classification

/// Substrings, lowercase, that mark a failure as caused by the network path
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection reset",
    "econnreset",
    "socket hang up",
    "timeout",
    "timed out",
    "tunnel",
    "enotfound",
    "eai_again",
    "name not resolved",
    "dns",
    "net::",
];

/// Whether an error message looks like a proxy or network failure that is
/// worth one retry on a different egress path
pub fn is_transient_message(message: &str) -> bool {
    let message = message.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| message.contains(p))
}
