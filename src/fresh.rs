//! Conditional-GET freshness.

use http::HeaderMap;
use http::header::{CACHE_CONTROL, ETAG, HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};

/// Whether a response described by `res` is still fresh for a request with
/// `req` headers, i.e. whether a 304 may be sent instead.
///
/// Without `If-None-Match` or `If-Modified-Since` nothing is fresh, and
/// `Cache-Control: no-cache` always forces a full response. When both
/// validators are present both must match.
pub fn is_fresh(req: &HeaderMap, res: &HeaderMap) -> bool {
    let modified_since = text(req, IF_MODIFIED_SINCE);
    let none_match = text(req, IF_NONE_MATCH);
    if modified_since.is_none() && none_match.is_none() {
        return false;
    }

    if text(req, CACHE_CONTROL).is_some_and(has_no_cache) {
        return false;
    }

    if let Some(none_match) = none_match.filter(|v| v.trim() != "*") {
        let Some(etag) = text(res, ETAG) else {
            return false;
        };
        if !none_match.split(',').map(str::trim).any(|tag| weak_eq(tag, etag)) {
            return false;
        }
    }

    if let Some(since) = modified_since {
        let last = text(res, LAST_MODIFIED).and_then(|v| httpdate::parse_http_date(v).ok());
        let since = httpdate::parse_http_date(since).ok();
        match (last, since) {
            (Some(last), Some(since)) if last <= since => {}
            _ => return false,
        }
    }

    true
}

fn text(map: &HeaderMap, name: HeaderName) -> Option<&str> {
    map.get(name).and_then(|v| v.to_str().ok())
}

fn has_no_cache(value: &str) -> bool {
    value.split(',').any(|d| d.trim().eq_ignore_ascii_case("no-cache"))
}

fn weak_eq(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/") == b.trim_start_matches("W/")
}
