//! Token refresh endpoint detection
//!
//! OAuth-style refresh exchanges are recognized from the URL shape, the
//! request body, and the response payload, then distilled into a
//! `RefreshConfig` the scheduler can re-execute on its own.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analyze::schema::safe_parse_json;
use crate::exchange::{CapturedExchange, HeaderMap};

static REFRESH_URL_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"/oauth/token",
        r"/oauth2/v\d+/token",
        r"securetoken\.googleapis\.com",
        r"identitytoolkit\.googleapis\.com",
        r"/auth/refresh",
        r"/auth/.*",
        r"/token/refresh",
        r"/refresh[-_]?token",
        r"/v\d+/auth/token",
        r"/api/.*/refresh",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){}", p)).unwrap())
    .collect()
});

static GRANT_URL_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"/oauth/token", r"/oauth2/v\d+/token", r"/token$", r"/token\?"]
        .iter()
        .map(|p| Regex::new(&format!("(?i){}", p)).unwrap())
        .collect()
});

static REFRESH_GRANT_BODY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)grant_type=refresh_token").unwrap());

// The [=:] alternation is deliberate: a JSON body puts a quote between the
// key and the colon, so `"refresh_token": "..."` does NOT match. JSON refresh
// endpoints are still caught by the URL patterns.
static REFRESH_TOKEN_BODY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)refresh_?token[=:]").unwrap());

static TOKEN_FALLBACK_RES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("access", Regex::new(r#""access_token"\s*:\s*"(.+?)""#).unwrap()),
        ("refresh", Regex::new(r#""refresh_token"\s*:\s*"(.+?)""#).unwrap()),
        ("id", Regex::new(r#""id_token"\s*:\s*"(.+?)""#).unwrap()),
        ("expires", Regex::new(r#""expires_in"\s*:\s*"?(\d+)"#).unwrap()),
    ]
});

/// Identity provider behind a refresh endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshProvider {
    Google,
    Firebase,
    Generic,
}

/// Token material extracted from a refresh/grant response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenInfo {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: Option<i64>,
    pub token_type: String,
}

/// Outcome of refresh endpoint detection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshDetection {
    pub is_refresh: bool,
    pub is_initial_grant: bool,
    pub token_info: Option<TokenInfo>,
}

/// Everything needed to re-execute a refresh exchange headlessly
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshConfig {
    pub url: String,
    pub method: String,

    /// Request headers filtered down to auth-relevant ones
    pub headers: HeaderMap,

    /// Parsed body object, or the raw text when unparseable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    pub provider: RefreshProvider,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Classify an exchange as a refresh call, an initial grant, or neither.
pub fn detect_refresh_endpoint(
    url: &str,
    method: &str,
    body: Option<&str>,
    response_body: Option<&str>,
) -> RefreshDetection {
    let method = method.to_ascii_uppercase();
    let mutating = method == "POST" || method == "PUT";

    let url_is_refresh = REFRESH_URL_RES.iter().any(|re| re.is_match(url))
        || (url.contains("/token") && url.contains('?'));
    let body_is_refresh = body.is_some_and(|b| {
        REFRESH_GRANT_BODY_RE.is_match(b) || REFRESH_TOKEN_BODY_RE.is_match(b)
    });

    let is_refresh = mutating && (url_is_refresh || body_is_refresh);
    let is_initial_grant = !is_refresh
        && mutating
        && GRANT_URL_RES.iter().any(|re| re.is_match(url))
        && body.is_some_and(|b| b.contains("grant_type=authorization_code"));

    let token_info = response_body.and_then(extract_token_info);

    RefreshDetection {
        is_refresh,
        is_initial_grant,
        token_info,
    }
}

/// Pull token material out of a response body; JSON first, regex fallback.
pub fn extract_token_info(body: &str) -> Option<TokenInfo> {
    if let Some(value) = safe_parse_json(body) {
        let obj = value.as_object()?;
        let pick = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| obj.get(*k).and_then(|v| v.as_str().map(|s| s.to_string())))
        };
        let info = TokenInfo {
            access_token: pick(&["access_token", "accessToken", "token"]),
            refresh_token: pick(&["refresh_token", "refreshToken"]),
            id_token: pick(&["id_token", "idToken"]),
            expires_in: ["expires_in", "expiresIn"].iter().find_map(|k| {
                obj.get(*k).and_then(|v| {
                    v.as_i64()
                        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                })
            }),
            token_type: pick(&["token_type", "tokenType"]).unwrap_or_else(|| "Bearer".to_string()),
        };
        if info.access_token.is_some() || info.refresh_token.is_some() || info.id_token.is_some() {
            return Some(info);
        }
        return None;
    }

    // Malformed JSON still often carries the fields verbatim.
    let mut info = TokenInfo {
        token_type: "Bearer".to_string(),
        ..Default::default()
    };
    for (kind, re) in TOKEN_FALLBACK_RES.iter() {
        if let Some(caps) = re.captures(body) {
            let captured = caps[1].to_string();
            match *kind {
                "access" => info.access_token = Some(captured),
                "refresh" => info.refresh_token = Some(captured),
                "id" => info.id_token = Some(captured),
                "expires" => info.expires_in = captured.parse().ok(),
                _ => {}
            }
        }
    }
    if info.access_token.is_some() || info.refresh_token.is_some() {
        Some(info)
    } else {
        None
    }
}

fn provider_for_url(url: &str) -> RefreshProvider {
    let host = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default();
    if host == "accounts.google.com" {
        RefreshProvider::Google
    } else if host == "securetoken.googleapis.com" || host == "identitytoolkit.googleapis.com" {
        RefreshProvider::Firebase
    } else {
        RefreshProvider::Generic
    }
}

fn header_is_refresh_relevant(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == "authorization"
        || name == "content-type"
        || name.contains("token")
        || name.contains("api-key")
        || name.contains("x-auth")
        || name.contains("csrf")
}

fn form_body_to_object(body: &str) -> Value {
    let mut map = serde_json::Map::new();
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        if !key.is_empty() {
            map.insert(key.into_owned(), Value::String(value.into_owned()));
        }
    }
    Value::Object(map)
}

fn body_field(body: &Value, keys: &[&str]) -> Option<String> {
    let obj = body.as_object()?;
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(|v| v.as_str().map(|s| s.to_string())))
}

/// Distill a successful refresh exchange into a re-executable config.
pub fn extract_refresh_config(exchange: &CapturedExchange) -> Option<RefreshConfig> {
    if !(200..300).contains(&exchange.response.status) {
        return None;
    }
    let request = &exchange.request;
    let detection = detect_refresh_endpoint(
        &request.url,
        &request.method,
        request.body_raw.as_deref(),
        exchange.response.body_raw.as_deref(),
    );
    if !detection.is_refresh {
        return None;
    }

    let headers: HeaderMap = request
        .headers
        .iter()
        .filter(|(name, _)| header_is_refresh_relevant(name))
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect();

    let content_type = request.content_type.as_deref().unwrap_or_default();
    let body = request.body_raw.as_deref().map(|raw| {
        if content_type.contains("x-www-form-urlencoded") {
            form_body_to_object(raw)
        } else if let Some(parsed) = safe_parse_json(raw) {
            parsed
        } else {
            Value::String(raw.to_string())
        }
    });

    let token_info = detection.token_info.unwrap_or_default();
    let expires_in = token_info.expires_in;
    // Without an expires_in, a decodable JWT access token still pins expiry.
    let expires_at = expires_in
        .map(|secs| Utc::now() + Duration::seconds(secs))
        .or_else(|| token_info.access_token.as_deref().and_then(jwt_expiry));
    let refresh_token = token_info.refresh_token.clone().or_else(|| {
        body.as_ref()
            .and_then(|b| body_field(b, &["refresh_token", "refreshToken"]))
    });

    Some(RefreshConfig {
        url: request.url.clone(),
        method: request.method.to_ascii_uppercase(),
        provider: provider_for_url(&request.url),
        client_id: body
            .as_ref()
            .and_then(|b| body_field(b, &["client_id", "clientId"])),
        client_secret: body
            .as_ref()
            .and_then(|b| body_field(b, &["client_secret", "clientSecret"])),
        scope: body.as_ref().and_then(|b| body_field(b, &["scope"])),
        refresh_token,
        expires_in_seconds: expires_in,
        expires_at,
        headers,
        body,
    })
}

/// True when the token behind `config` expires within the buffer window.
pub fn needs_refresh_at(config: &RefreshConfig, buffer_minutes: i64, now: DateTime<Utc>) -> bool {
    match config.expires_at {
        Some(expires_at) => now + Duration::minutes(buffer_minutes) >= expires_at,
        None => false,
    }
}

/// `needs_refresh_at` against the current clock.
pub fn needs_refresh(config: &RefreshConfig, buffer_minutes: i64) -> bool {
    needs_refresh_at(config, buffer_minutes, Utc::now())
}

/// Expiry claim of an unverified JWT payload, when decodable.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    use base64::Engine;
    let payload = token.split('.').nth(1)?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let value: Value = serde_json::from_slice(&decoded).ok()?;
    let exp = value.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{CapturedRequest, CapturedResponse};

    #[test]
    fn test_oauth_refresh_detection_end_to_end() {
        let detection = detect_refresh_endpoint(
            "https://idp.example.com/oauth/token",
            "POST",
            Some("grant_type=refresh_token&refresh_token=tok"),
            Some(r#"{"access_token":"A","refresh_token":"R","expires_in":3600}"#),
        );
        assert!(detection.is_refresh);
        assert!(!detection.is_initial_grant);
        let info = detection.token_info.unwrap();
        assert_eq!(info.access_token.as_deref(), Some("A"));
        assert_eq!(info.refresh_token.as_deref(), Some("R"));
        assert_eq!(info.expires_in, Some(3600));
        assert_eq!(info.token_type, "Bearer");
    }

    #[test]
    fn test_refresh_config_from_exchange() {
        let exchange = CapturedExchange {
            index: 0,
            timestamp: 0,
            request: CapturedRequest {
                method: "POST".into(),
                url: "https://idp.example.com/oauth/token".into(),
                headers: [
                    ("Content-Type".to_string(), "application/x-www-form-urlencoded".to_string()),
                    ("User-Agent".to_string(), "x".to_string()),
                ]
                .into_iter()
                .collect(),
                body_raw: Some(
                    "grant_type=refresh_token&refresh_token=tok&client_id=cid&scope=openid".into(),
                ),
                content_type: Some("application/x-www-form-urlencoded".into()),
                ..Default::default()
            },
            response: CapturedResponse {
                status: 200,
                body_raw: Some(r#"{"access_token":"A","refresh_token":"R","expires_in":3600}"#.into()),
                ..Default::default()
            },
        };

        let config = extract_refresh_config(&exchange).unwrap();
        assert_eq!(config.provider, RefreshProvider::Generic);
        assert_eq!(config.client_id.as_deref(), Some("cid"));
        assert_eq!(config.scope.as_deref(), Some("openid"));
        assert_eq!(config.refresh_token.as_deref(), Some("R"));
        assert_eq!(config.expires_in_seconds, Some(3600));
        assert!(config.headers.contains("content-type"));
        assert!(!config.headers.contains("user-agent"));

        let expires_at = config.expires_at.unwrap();
        let lower = Utc::now() + Duration::seconds(3599);
        let upper = Utc::now() + Duration::seconds(3601);
        assert!(expires_at >= lower && expires_at <= upper);
    }

    #[test]
    fn test_non_2xx_yields_no_config() {
        let exchange = CapturedExchange {
            index: 0,
            timestamp: 0,
            request: CapturedRequest {
                method: "POST".into(),
                url: "https://idp.example.com/oauth/token".into(),
                body_raw: Some("grant_type=refresh_token&refresh_token=tok".into()),
                ..Default::default()
            },
            response: CapturedResponse {
                status: 400,
                ..Default::default()
            },
        };
        assert!(extract_refresh_config(&exchange).is_none());
    }

    #[test]
    fn test_firebase_and_google_providers() {
        let d = detect_refresh_endpoint(
            "https://securetoken.googleapis.com/v1/token?key=k",
            "POST",
            None,
            None,
        );
        assert!(d.is_refresh);
        assert_eq!(
            provider_for_url("https://securetoken.googleapis.com/v1/token"),
            RefreshProvider::Firebase
        );
        assert_eq!(
            provider_for_url("https://accounts.google.com/o/oauth2/token"),
            RefreshProvider::Google
        );
        assert_eq!(
            provider_for_url("https://idp.example.com/oauth/token"),
            RefreshProvider::Generic
        );
    }

    #[test]
    fn test_json_refresh_body_is_not_matched() {
        // The [=:] requirement excludes JSON payloads; the quote between the
        // key and the colon breaks the match. Known, kept limitation.
        let detection = detect_refresh_endpoint(
            "https://api.example.com/renew",
            "POST",
            Some(r#"{"refresh_token": "tok"}"#),
            None,
        );
        assert!(!detection.is_refresh);

        // The same payload on a refresh-shaped URL is still detected.
        let detection = detect_refresh_endpoint(
            "https://api.example.com/token/refresh",
            "POST",
            Some(r#"{"refresh_token": "tok"}"#),
            None,
        );
        assert!(detection.is_refresh);
    }

    #[test]
    fn test_initial_grant_detection() {
        let detection = detect_refresh_endpoint(
            "https://idp.example.com/oauth/token",
            "POST",
            Some("grant_type=authorization_code&code=c"),
            None,
        );
        assert!(!detection.is_refresh);
        assert!(detection.is_initial_grant);
    }

    #[test]
    fn test_get_requests_never_refresh() {
        let detection = detect_refresh_endpoint(
            "https://idp.example.com/oauth/token",
            "GET",
            Some("grant_type=refresh_token"),
            None,
        );
        assert!(!detection.is_refresh);
    }

    #[test]
    fn test_regex_fallback_for_broken_json() {
        let info = extract_token_info(
            r#"{"access_token":"A","refresh_token":"R","expires_in":900,"#,
        )
        .unwrap();
        assert_eq!(info.access_token.as_deref(), Some("A"));
        assert_eq!(info.refresh_token.as_deref(), Some("R"));
        assert_eq!(info.expires_in, Some(900));
    }

    #[test]
    fn test_needs_refresh_boundary() {
        let now = Utc::now();
        let mut config = RefreshConfig {
            url: "https://x/oauth/token".into(),
            method: "POST".into(),
            headers: HeaderMap::new(),
            body: None,
            provider: RefreshProvider::Generic,
            client_id: None,
            client_secret: None,
            scope: None,
            refresh_token: None,
            expires_in_seconds: None,
            expires_at: None,
        };

        assert!(!needs_refresh_at(&config, 5, now), "no expiry, no refresh");

        config.expires_at = Some(now + Duration::minutes(5));
        assert!(needs_refresh_at(&config, 5, now), "expiry on the buffer edge");

        config.expires_at = Some(now + Duration::minutes(5) + Duration::seconds(1));
        assert!(!needs_refresh_at(&config, 5, now));

        config.expires_at = Some(now - Duration::minutes(1));
        assert!(needs_refresh_at(&config, 5, now), "already expired");
    }

    #[test]
    fn test_jwt_access_token_seeds_expiry_when_expires_in_absent() {
        use base64::Engine;
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let payload =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"exp\":1893456000}");
        let jwt = format!("{}.{}.sig", header, payload);

        let exchange = CapturedExchange {
            index: 0,
            timestamp: 0,
            request: CapturedRequest {
                method: "POST".into(),
                url: "https://idp.example.com/oauth/token".into(),
                body_raw: Some("grant_type=refresh_token&refresh_token=tok".into()),
                content_type: Some("application/x-www-form-urlencoded".into()),
                ..Default::default()
            },
            response: CapturedResponse {
                status: 200,
                body_raw: Some(format!(r#"{{"access_token":"{}"}}"#, jwt)),
                ..Default::default()
            },
        };

        let config = extract_refresh_config(&exchange).unwrap();
        assert_eq!(config.expires_in_seconds, None);
        assert_eq!(config.expires_at.unwrap().timestamp(), 1893456000);
    }

    #[test]
    fn test_jwt_expiry_decodes_exp_claim() {
        use base64::Engine;
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let payload =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"exp\":1893456000}");
        let token = format!("{}.{}.sig", header, payload);
        let exp = jwt_expiry(&token).unwrap();
        assert_eq!(exp.timestamp(), 1893456000);
        assert!(jwt_expiry("not-a-jwt").is_none());
    }
}
