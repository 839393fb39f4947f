//! Header classification
//!
//! Every captured header is sorted into one of six categories. The category
//! decides whether a header travels with replayed requests, is profiled per
//! domain, or is treated as secret material.

/// Category of a single HTTP header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderCategory {
    /// Transport-level headers the replay client must regenerate
    Protocol,
    /// Browser fingerprint headers (sec-fetch-*, sec-ch-ua*, accept-encoding)
    Browser,
    /// Cookie and Set-Cookie
    Cookie,
    /// Credentials and anti-forgery tokens
    Auth,
    /// Well-known request context headers
    Context,
    /// Application-specific headers, the interesting remainder
    App,
}

const PROTOCOL_HEADERS: &[&str] = &["host", "connection", "content-length", "transfer-encoding"];

const AUTH_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "api-key",
    "apikey",
    "x-auth-token",
    "access-token",
    "x-access-token",
    "token",
    "x-token",
    "x-csrf-token",
    "x-xsrf-token",
    "bearer",
];

const AUTH_FRAGMENTS: &[&str] = &["token", "api-key", "apikey", "auth", "csrf", "xsrf"];

const CONTEXT_HEADERS: &[&str] = &[
    "accept",
    "user-agent",
    "referer",
    "origin",
    "accept-language",
    "dnt",
    "cache-control",
    "pragma",
    "upgrade-insecure-requests",
    "if-none-match",
    "if-modified-since",
    "priority",
    "te",
];

/// Classify a header by name. Matching is on the lowercased name.
pub fn classify_header(name: &str) -> HeaderCategory {
    let name = name.to_ascii_lowercase();

    if name.starts_with(':') || PROTOCOL_HEADERS.contains(&name.as_str()) {
        return HeaderCategory::Protocol;
    }
    if name.starts_with("accept-encoding")
        || name.starts_with("sec-fetch-")
        || name.starts_with("sec-ch-ua")
    {
        return HeaderCategory::Browser;
    }
    if name == "cookie" || name == "set-cookie" {
        return HeaderCategory::Cookie;
    }
    if AUTH_HEADERS.contains(&name.as_str())
        || AUTH_FRAGMENTS.iter().any(|frag| name.contains(frag))
    {
        return HeaderCategory::Auth;
    }
    if CONTEXT_HEADERS.contains(&name.as_str()) {
        return HeaderCategory::Context;
    }
    HeaderCategory::App
}

/// True for headers that must never appear in a published profile
pub fn is_profile_excluded(category: HeaderCategory) -> bool {
    matches!(
        category,
        HeaderCategory::Protocol
            | HeaderCategory::Browser
            | HeaderCategory::Cookie
            | HeaderCategory::Auth
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_headers() {
        assert_eq!(classify_header(":authority"), HeaderCategory::Protocol);
        assert_eq!(classify_header("Host"), HeaderCategory::Protocol);
        assert_eq!(classify_header("content-length"), HeaderCategory::Protocol);
        assert_eq!(
            classify_header("Transfer-Encoding"),
            HeaderCategory::Protocol
        );
    }

    #[test]
    fn test_browser_headers() {
        assert_eq!(classify_header("Accept-Encoding"), HeaderCategory::Browser);
        assert_eq!(classify_header("sec-fetch-mode"), HeaderCategory::Browser);
        assert_eq!(
            classify_header("Sec-Ch-Ua-Platform"),
            HeaderCategory::Browser
        );
    }

    #[test]
    fn test_cookie_headers() {
        assert_eq!(classify_header("Cookie"), HeaderCategory::Cookie);
        assert_eq!(classify_header("set-cookie"), HeaderCategory::Cookie);
    }

    #[test]
    fn test_auth_exact_and_substring() {
        assert_eq!(classify_header("Authorization"), HeaderCategory::Auth);
        assert_eq!(classify_header("X-Api-Key"), HeaderCategory::Auth);
        assert_eq!(classify_header("x-csrf-token"), HeaderCategory::Auth);
        // Substring rule catches app-specific variants
        assert_eq!(classify_header("x-goog-api-key"), HeaderCategory::Auth);
        assert_eq!(classify_header("x-session-token"), HeaderCategory::Auth);
        assert_eq!(classify_header("x-xsrf-header"), HeaderCategory::Auth);
    }

    #[test]
    fn test_context_headers() {
        assert_eq!(classify_header("Accept"), HeaderCategory::Context);
        assert_eq!(classify_header("accept-language"), HeaderCategory::Context);
        assert_eq!(classify_header("User-Agent"), HeaderCategory::Context);
        assert_eq!(classify_header("DNT"), HeaderCategory::Context);
    }

    #[test]
    fn test_everything_else_is_app() {
        assert_eq!(classify_header("x-request-id"), HeaderCategory::App);
        assert_eq!(classify_header("x-client-version"), HeaderCategory::App);
        assert_eq!(classify_header("traceparent"), HeaderCategory::App);
    }
}
