//! Strategy selection and the tagged interception result.

use serde_json::json;

use crate::types::CachedResponse;

/// How one outbound request is answered, selected purely by request shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Mutating or non-allow-listed cross-origin request; not intercepted.
    Bypass,
    /// Shell/static resources: cache wins, network fills misses.
    CacheFirst,
    /// API reads: network wins, cache is the fallback.
    NetworkFirst,
    /// Everything else: serve stale, refresh in the background.
    StaleWhileRevalidate,
}

/// Outcome of an intercepted request. Callers branch on the variant instead
/// of sniffing a magic status code out of the response.
#[derive(Debug)]
pub enum ProxyResult {
    /// Not intercepted; the caller performs the request itself.
    Bypass,
    /// A real response, from cache or network.
    Served(CachedResponse),
    /// Network and cache both came up empty; carries the synthetic offline
    /// notice so the body is still well-formed JSON.
    Unavailable(CachedResponse),
}

impl ProxyResult {
    pub fn response(&self) -> Option<&CachedResponse> {
        match self {
            ProxyResult::Bypass => None,
            ProxyResult::Served(r) | ProxyResult::Unavailable(r) => Some(r),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ProxyResult::Unavailable(_))
    }
}

/// The synthetic 503 returned when neither network nor cache can answer.
pub fn offline_notice() -> CachedResponse {
    let body = json!({
        "error": "offline",
        "message": "This request requires a network connection",
    });
    CachedResponse::new(
        503,
        Some("application/json".to_string()),
        body.to_string().into_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_notice_is_structured_json() {
        let notice = offline_notice();
        assert_eq!(notice.status, 503);
        let body: serde_json::Value = serde_json::from_slice(&notice.body).unwrap();
        assert_eq!(body["error"], "offline");
    }
}
