//! Endpoint resolution
//!
//! Precedence: explicit URL, then the `PROPSTREAM_REALTIME_URL` environment
//! variable, then an endpoint derived from the application origin, then the
//! local development fallback.

use url::Url;

use crate::error::{RealtimeError, Result};

/// Environment variable holding the realtime endpoint
pub const ENDPOINT_ENV: &str = "PROPSTREAM_REALTIME_URL";

/// Environment variable holding the application origin
pub const ORIGIN_ENV: &str = "PROPSTREAM_ORIGIN";

/// Path of the realtime endpoint on the application host
pub const REALTIME_PATH: &str = "/realtime";

/// Endpoint used when nothing else is configured
pub const LOCAL_FALLBACK: &str = "ws://localhost:3001/realtime";

/// Query parameter carrying the access token
pub const TOKEN_PARAM: &str = "token";

/// Pick the endpoint string according to the precedence rules
pub fn resolve_endpoint(explicit: Option<&str>, env: Option<&str>, origin: Option<&str>) -> String {
    if let Some(url) = non_blank(explicit) {
        return url.to_string();
    }
    if let Some(url) = non_blank(env) {
        return url.to_string();
    }
    if let Some(url) = non_blank(origin).and_then(derive_from_origin) {
        return url;
    }
    LOCAL_FALLBACK.to_string()
}

/// Read the endpoint override from the environment
pub fn endpoint_from_env() -> Option<String> {
    std::env::var(ENDPOINT_ENV).ok()
}

/// Read the application origin from the environment
pub fn origin_from_env() -> Option<String> {
    std::env::var(ORIGIN_ENV).ok()
}

/// Map an `http(s)` origin to the `ws(s)` realtime endpoint on the same host
pub fn derive_from_origin(origin: &str) -> Option<String> {
    let url = Url::parse(origin).ok()?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        _ => return None,
    };
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}{REALTIME_PATH}"),
        None => format!("{scheme}://{host}{REALTIME_PATH}"),
    })
}

/// Parse the endpoint and set the token query parameter
///
/// Relative endpoints (`/realtime`) are resolved against the origin when one
/// is configured. An existing `token` parameter is replaced.
pub fn build_target(endpoint: &str, origin: Option<&str>, token: Option<&str>) -> Result<Url> {
    let mut url = match Url::parse(endpoint) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = non_blank(origin)
                .and_then(derive_from_origin)
                .ok_or_else(|| {
                    RealtimeError::InvalidEndpoint(format!(
                        "relative endpoint '{endpoint}' without an origin"
                    ))
                })?;
            Url::parse(&base)?.join(endpoint)?
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(token) = token.filter(|t| !t.is_empty()) {
        set_query_param(&mut url, TOKEN_PARAM, Some(token));
    }
    Ok(url)
}

/// Render a URL for logs, without the token
pub fn redact(url: &Url) -> String {
    let mut url = url.clone();
    set_query_param(&mut url, TOKEN_PARAM, None);
    url.to_string()
}

fn set_query_param(url: &mut Url, key: &str, value: Option<&str>) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if retained.is_empty() && value.is_none() {
        url.set_query(None);
        return;
    }

    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    pairs.extend_pairs(retained);
    if let Some(value) = value {
        pairs.append_pair(key, value);
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_precedence() {
        assert_eq!(
            resolve_endpoint(
                Some("wss://explicit/rt"),
                Some("wss://env/rt"),
                Some("https://app.example.com")
            ),
            "wss://explicit/rt"
        );
        assert_eq!(
            resolve_endpoint(None, Some("wss://env/rt"), Some("https://app.example.com")),
            "wss://env/rt"
        );
        assert_eq!(
            resolve_endpoint(Some(" "), None, Some("https://app.example.com")),
            "wss://app.example.com/realtime"
        );
        assert_eq!(resolve_endpoint(None, None, None), LOCAL_FALLBACK);
        assert_eq!(resolve_endpoint(None, None, Some("file:///tmp")), LOCAL_FALLBACK);
    }

    #[test]
    fn test_derive_from_origin() {
        assert_eq!(
            derive_from_origin("http://localhost:5173").as_deref(),
            Some("ws://localhost:5173/realtime")
        );
        assert_eq!(
            derive_from_origin("https://cockpit.example.com/app/home").as_deref(),
            Some("wss://cockpit.example.com/realtime")
        );
        assert_eq!(derive_from_origin("not a url"), None);
    }

    #[test]
    fn test_build_target_appends_token() {
        let url = build_target("wss://rt.example.com/realtime?v=2", None, Some("a b&c")).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://rt.example.com/realtime?v=2&token=a+b%26c"
        );

        let url = build_target("wss://rt.example.com/realtime?token=old", None, Some("new")).unwrap();
        assert_eq!(url.as_str(), "wss://rt.example.com/realtime?token=new");

        let url = build_target("wss://rt.example.com/realtime", None, None).unwrap();
        assert_eq!(url.as_str(), "wss://rt.example.com/realtime");
    }

    #[test]
    fn test_build_target_relative() {
        let url = build_target("/socket", Some("https://app.example.com"), Some("t")).unwrap();
        assert_eq!(url.as_str(), "wss://app.example.com/socket?token=t");

        let err = build_target("/socket", None, None).unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidEndpoint(_)));
    }

    #[test]
    fn test_redact() {
        let url = Url::parse("wss://rt.example.com/realtime?token=secret").unwrap();
        assert_eq!(redact(&url), "wss://rt.example.com/realtime");

        let url = Url::parse("wss://rt.example.com/realtime?v=2&token=secret").unwrap();
        assert_eq!(redact(&url), "wss://rt.example.com/realtime?v=2");
    }
}
