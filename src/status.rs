//! Status code registry.
//!
//! Every decision the response state machine makes about a status code goes
//! through here: whether it is a registered code at all, which reason phrase
//! an [`Error`](crate::Error) tag derives from it, whether it is a redirect,
//! and whether it must carry an empty body.
//!
//! The registry itself is the one `http` ships: `StatusCode::canonical_reason`.

use http::StatusCode;

/// Returned as the final status when a response is flushed without any valid
/// outcome and without a body. Signals a handler bug, never a client error.
pub const MISDIRECTED: u16 = 421;

/// Reason phrase for a registered status code, `None` otherwise.
///
/// ```rust
/// assert_eq!(cog::status::text(404), Some("Not Found"));
/// assert_eq!(cog::status::text(299), None);
/// ```
pub fn text(code: u16) -> Option<&'static str> {
    StatusCode::from_u16(code).ok()?.canonical_reason()
}

/// `true` when `code` is in the registry.
pub fn is_valid(code: u16) -> bool {
    text(code).is_some()
}

/// Codes `Context::redirect` keeps instead of falling back to 302.
pub fn is_redirect(code: u16) -> bool {
    matches!(code, 300..=303 | 305 | 307 | 308)
}

/// Codes that must never carry a body.
pub fn is_empty(code: u16) -> bool {
    matches!(code, 204 | 205 | 304)
}

/// Client and server failure codes, the only ones an error may adopt.
pub(crate) fn is_error(code: u16) -> bool {
    (400..600).contains(&code) && is_valid(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        assert_eq!(text(200), Some("OK"));
        assert_eq!(text(504), Some("Gateway Timeout"));
        assert_eq!(text(0), None);
        assert_eq!(text(1000), None);
        assert!(!is_valid(299));
    }

    #[test]
    fn test_predicates() {
        assert!(is_redirect(301));
        assert!(is_redirect(307));
        assert!(!is_redirect(304));
        assert!(is_empty(204));
        assert!(is_empty(304));
        assert!(!is_empty(200));
        assert!(is_error(404));
        assert!(!is_error(302));
    }
}
