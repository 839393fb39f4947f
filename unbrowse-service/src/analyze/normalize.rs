//! Route normalization
//!
//! Variable path segments are detected per request (UUIDs, emails,
//! timestamps, hex ids, years, mixed alphanumerics, integers), then a second
//! pass generalizes pure-letter segments that vary across requests with the
//! same surrounding structure. The normalized template is the grouping key
//! for endpoint analysis.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::exchange::path_segments_of;

/// Path segments that are part of the API surface itself, never parameters
const STATIC_SEGMENTS: &[&str] = &[
    "api", "graphql", "rest", "search", "me", "auth", "login", "logout", "signin", "signup",
    "register", "oauth", "token", "refresh", "session", "sessions", "health", "status",
];

/// File extensions preserved as suffixes on parameterized segments
const KEPT_EXTENSIONS: &[&str] = &["json", "xml", "csv", "txt", "html"];

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^v\d+$").unwrap());
static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap()
});
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^@\s/]+@[^@\s/]+\.[^@\s/]+$").unwrap());
static TIMESTAMP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{10,13}$").unwrap());
static HEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{8,}$").unwrap());
static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(19|20)\d{2}(-(19|20)\d{2})?$").unwrap());
static INT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());
static LETTERS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z]+$").unwrap());

/// One segment of a normalized path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Literal segment, emitted verbatim
    Static(String),
    /// Variable segment
    Param {
        /// Parameter name without braces
        name: String,
        /// Pattern kind that matched (uuid, email, timestamp, hex, year, id, num, path)
        kind: String,
        /// First observed value (without extension suffix)
        example: String,
        /// Preserved extension, e.g. `json`
        suffix: Option<String>,
    },
}

/// A normalized request path: template plus its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPath {
    segments: Vec<PathSegment>,
}

/// A named path parameter with a witness value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathParam {
    pub name: String,
    pub kind: String,
    pub example: String,
}

impl NormalizedPath {
    /// Render the template, e.g. `/v2/{year}/modules/{moduleId}.json`
    pub fn template(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            out.push('/');
            match segment {
                PathSegment::Static(s) => out.push_str(s),
                PathSegment::Param { name, suffix, .. } => {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                    if let Some(ext) = suffix {
                        out.push('.');
                        out.push_str(ext);
                    }
                }
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// Parameters in path order
    pub fn params(&self) -> Vec<PathParam> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                PathSegment::Param {
                    name,
                    kind,
                    example,
                    ..
                } => Some(PathParam {
                    name: name.clone(),
                    kind: kind.clone(),
                    example: example.clone(),
                }),
                PathSegment::Static(_) => None,
            })
            .collect()
    }

    /// Rebuild a concrete path from witness values, in parameter order
    pub fn reconstruct(&self, values: &[&str]) -> String {
        let mut out = String::new();
        let mut next = 0usize;
        for segment in &self.segments {
            out.push('/');
            match segment {
                PathSegment::Static(s) => out.push_str(s),
                PathSegment::Param { suffix, example, .. } => {
                    let value = values.get(next).copied().unwrap_or(example.as_str());
                    next += 1;
                    out.push_str(value);
                    if let Some(ext) = suffix {
                        out.push('.');
                        out.push_str(ext);
                    }
                }
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    fn len(&self) -> usize {
        self.segments.len()
    }
}

fn split_extension(segment: &str) -> (&str, Option<&str>) {
    if let Some(dot) = segment.rfind('.') {
        let ext = &segment[dot + 1..];
        if KEPT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            return (&segment[..dot], Some(ext));
        }
    }
    (segment, None)
}

fn is_static_segment(stem: &str) -> bool {
    let lower = stem.to_ascii_lowercase();
    STATIC_SEGMENTS.contains(&lower.as_str()) || VERSION_RE.is_match(&lower)
}

fn is_mixed_alnum(stem: &str) -> bool {
    let mut has_letter = false;
    let mut has_digit = false;
    for c in stem.chars() {
        if c.is_ascii_alphabetic() {
            has_letter = true;
        } else if c.is_ascii_digit() {
            has_digit = true;
        } else if c != '-' && c != '_' {
            return false;
        }
    }
    has_letter && has_digit
}

/// Detect the pattern kind of a raw segment stem, if any
fn detect_kind(stem: &str) -> Option<&'static str> {
    if UUID_RE.is_match(stem) {
        Some("uuid")
    } else if EMAIL_RE.is_match(stem) {
        Some("email")
    } else if TIMESTAMP_RE.is_match(stem) {
        Some("timestamp")
    } else if HEX_RE.is_match(stem) {
        Some("hex")
    } else if YEAR_RE.is_match(stem) {
        Some("year")
    } else if is_mixed_alnum(stem) {
        Some("id")
    } else if INT_RE.is_match(stem) {
        Some("num")
    } else {
        None
    }
}

/// Naive English singularization, good enough for REST nouns
pub fn singularize(word: &str) -> String {
    let lower = word.to_ascii_lowercase();
    if let Some(stem) = lower.strip_suffix("ies") {
        return format!("{}y", stem);
    }
    for suffix in ["ses", "xes", "zes", "ches", "shes"] {
        if let Some(stem) = lower.strip_suffix(suffix) {
            return format!("{}{}", stem, &suffix[..1]);
        }
    }
    if lower.ends_with('s') && !lower.ends_with("ss") {
        return lower[..lower.len() - 1].to_string();
    }
    lower
}

fn looks_plural(stem: &str) -> bool {
    LETTERS_RE.is_match(stem) && stem.len() > 1 && stem.ends_with('s') && !stem.ends_with("ss")
}

fn unique_name(base: String, used: &mut HashSet<String>) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}{}", base, n);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Single-request normalization of a URL (or bare path)
pub fn normalize_url_path(raw: &str) -> NormalizedPath {
    let raw_segments = path_segments_of(raw);
    let mut used = HashSet::new();
    let mut segments = Vec::with_capacity(raw_segments.len());

    for (i, raw_segment) in raw_segments.iter().enumerate() {
        let (stem, ext) = split_extension(raw_segment);
        if stem.is_empty() || is_static_segment(stem) {
            segments.push(PathSegment::Static(raw_segment.clone()));
            continue;
        }
        let Some(kind) = detect_kind(stem) else {
            segments.push(PathSegment::Static(raw_segment.clone()));
            continue;
        };

        let prev = i.checked_sub(1).and_then(|j| raw_segments.get(j));
        let base = match prev {
            Some(prev) if looks_plural(split_extension(prev).0) => {
                format!("{}Id", singularize(split_extension(prev).0))
            }
            _ => kind.to_string(),
        };
        segments.push(PathSegment::Param {
            name: unique_name(base, &mut used),
            kind: kind.to_string(),
            example: stem.to_string(),
            suffix: ext.map(|e| e.to_string()),
        });
    }

    NormalizedPath { segments }
}

/// Cross-request generalization over paths sharing one method.
///
/// Positions holding two or more distinct pure-letter values, with identical
/// structure at every other position, are replaced with a parameter. Needs at
/// least two witnesses; a lone example stays literal.
pub fn generalize_paths(paths: &mut [NormalizedPath]) {
    // Group indices by segment count; generalization never crosses arity.
    let mut by_len: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, p) in paths.iter().enumerate() {
        by_len.entry(p.len()).or_default().push(i);
    }

    for (len, members) in by_len {
        if members.len() < 2 {
            continue;
        }
        for pos in 0..len {
            let mut letter_values: BTreeSet<String> = BTreeSet::new();
            let mut eligible = true;
            for &m in &members {
                match &paths[m].segments[pos] {
                    PathSegment::Static(s) => {
                        let (stem, _) = split_extension(s);
                        if LETTERS_RE.is_match(stem) && !is_static_segment(stem) {
                            letter_values.insert(stem.to_string());
                        } else {
                            eligible = false;
                            break;
                        }
                    }
                    // Already a parameter: compatible with generalization.
                    PathSegment::Param { .. } => {}
                }
            }
            if !eligible || letter_values.len() < 2 {
                continue;
            }
            if !shares_structure_elsewhere(paths, &members, pos) {
                continue;
            }

            let name = param_name_for_position(&paths[members[0]], pos);
            for &m in &members {
                let replacement = match &paths[m].segments[pos] {
                    PathSegment::Static(s) => {
                        let (stem, ext) = split_extension(s);
                        Some((stem.to_string(), ext.map(|e| e.to_string())))
                    }
                    PathSegment::Param { .. } => None,
                };
                if let Some((example, suffix)) = replacement {
                    paths[m].segments[pos] = PathSegment::Param {
                        name: name.clone(),
                        kind: "path".to_string(),
                        example,
                        suffix,
                    };
                }
            }
        }
    }
}

/// All member paths must agree at every position other than `skip`:
/// equal literals, or parameters on both sides.
fn shares_structure_elsewhere(paths: &[NormalizedPath], members: &[usize], skip: usize) -> bool {
    let first = &paths[members[0]];
    for &m in &members[1..] {
        let other = &paths[m];
        for j in 0..first.len() {
            if j == skip {
                continue;
            }
            let matches = match (&first.segments[j], &other.segments[j]) {
                (PathSegment::Static(a), PathSegment::Static(b)) => a == b,
                (PathSegment::Param { .. }, PathSegment::Param { .. }) => true,
                _ => false,
            };
            if !matches {
                return false;
            }
        }
    }
    true
}

fn param_name_for_position(path: &NormalizedPath, pos: usize) -> String {
    if pos > 0 {
        if let PathSegment::Static(prev) = &path.segments[pos - 1] {
            let (stem, _) = split_extension(prev);
            if LETTERS_RE.is_match(stem) {
                return singularize(stem);
            }
        }
    }
    format!("p{}", pos + 1)
}

/// Normalize a set of (method, url) pairs through both passes.
///
/// Returns one `NormalizedPath` per input, index-aligned.
pub fn normalize_all(requests: &[(String, String)]) -> Vec<NormalizedPath> {
    let mut paths: Vec<NormalizedPath> = requests
        .iter()
        .map(|(_, url)| normalize_url_path(url))
        .collect();

    // Second pass runs per method.
    let mut by_method: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, (method, _)) in requests.iter().enumerate() {
        by_method
            .entry(method.to_ascii_uppercase())
            .or_default()
            .push(i);
    }
    for members in by_method.values() {
        let mut group: Vec<NormalizedPath> = members.iter().map(|&i| paths[i].clone()).collect();
        generalize_paths(&mut group);
        for (slot, &i) in members.iter().enumerate() {
            paths[i] = group[slot].clone();
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_segment() {
        let path =
            normalize_url_path("https://x.test/api/users/550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(path.template(), "/api/users/{userId}");
        assert_eq!(path.params()[0].kind, "uuid");
    }

    #[test]
    fn test_email_and_timestamp_segments() {
        let path = normalize_url_path("https://x.test/accounts/bob@example.com/events/1700000000");
        assert_eq!(path.template(), "/accounts/{accountId}/events/{eventId}");
        let params = path.params();
        assert_eq!(params[0].kind, "email");
        assert_eq!(params[1].kind, "timestamp");
    }

    #[test]
    fn test_hex_and_integer_segments() {
        let path = normalize_url_path("https://x.test/blobs/deadbeef42/7");
        assert_eq!(path.template(), "/blobs/{blobId}/{num}");
    }

    #[test]
    fn test_static_segments_never_parameterized() {
        let path = normalize_url_path("https://x.test/api/v2/search/me");
        assert_eq!(path.template(), "/api/v2/search/me");
    }

    #[test]
    fn test_extension_preserved_on_parameter() {
        let path = normalize_url_path("https://x.test/v2/2024-2025/modules/CS2030S.json");
        assert_eq!(path.template(), "/v2/{year}/modules/{moduleId}.json");
        let params = path.params();
        assert_eq!(params[0].example, "2024-2025");
        assert_eq!(params[1].example, "CS2030S");
    }

    #[test]
    fn test_nusmods_grouping_shapes_one_template() {
        let requests: Vec<(String, String)> = [
            "https://api.nusmods.com/v2/2024-2025/modules/CS2030S.json",
            "https://api.nusmods.com/v2/2024-2025/modules/CS1101S.json",
            "https://api.nusmods.com/v2/2024-2025/modules/MA2001.json",
        ]
        .iter()
        .map(|u| ("GET".to_string(), u.to_string()))
        .collect();

        let paths = normalize_all(&requests);
        let templates: BTreeSet<String> = paths.iter().map(|p| p.template()).collect();
        assert_eq!(templates.len(), 1);
        assert_eq!(
            templates.iter().next().unwrap(),
            "/v2/{year}/modules/{moduleId}.json"
        );
    }

    #[test]
    fn test_cross_request_generalizes_letter_segments() {
        let requests: Vec<(String, String)> = [
            "https://x.test/repos/alpha/stats",
            "https://x.test/repos/beta/stats",
        ]
        .iter()
        .map(|u| ("GET".to_string(), u.to_string()))
        .collect();

        let paths = normalize_all(&requests);
        assert_eq!(paths[0].template(), "/repos/{repo}/stats");
        assert_eq!(paths[1].template(), "/repos/{repo}/stats");
    }

    #[test]
    fn test_single_example_stays_literal() {
        // Boundary: generalization needs two distinct witnesses.
        let requests = vec![("GET".to_string(), "https://x.test/repos/alpha/stats".to_string())];
        let paths = normalize_all(&requests);
        assert_eq!(paths[0].template(), "/repos/alpha/stats");
    }

    #[test]
    fn test_generalization_requires_shared_structure() {
        let requests: Vec<(String, String)> = [
            "https://x.test/repos/alpha/stats",
            "https://x.test/repos/beta/issues",
        ]
        .iter()
        .map(|u| ("GET".to_string(), u.to_string()))
        .collect();

        let paths = normalize_all(&requests);
        // Differing tails: neither position is generalized.
        assert_eq!(paths[0].template(), "/repos/alpha/stats");
        assert_eq!(paths[1].template(), "/repos/beta/issues");
    }

    #[test]
    fn test_generalization_never_crosses_methods() {
        let requests = vec![
            ("GET".to_string(), "https://x.test/repos/alpha/stats".to_string()),
            ("POST".to_string(), "https://x.test/repos/beta/stats".to_string()),
        ];
        let paths = normalize_all(&requests);
        assert_eq!(paths[0].template(), "/repos/alpha/stats");
        assert_eq!(paths[1].template(), "/repos/beta/stats");
    }

    #[test]
    fn test_singularize() {
        assert_eq!(singularize("users"), "user");
        assert_eq!(singularize("entries"), "entry");
        assert_eq!(singularize("boxes"), "box");
        assert_eq!(singularize("statuses"), "status");
        assert_eq!(singularize("data"), "data");
    }

    #[test]
    fn test_normalize_reconstruct_round_trip() {
        // R1: normalize, rebuild with witness values, normalize again.
        let original = "https://x.test/api/orders/123456789012/items/ab12cd34";
        let first = normalize_url_path(original);
        let witnesses: Vec<String> = first.params().iter().map(|p| p.example.clone()).collect();
        let witness_refs: Vec<&str> = witnesses.iter().map(|s| s.as_str()).collect();
        let rebuilt = first.reconstruct(&witness_refs);
        let second = normalize_url_path(&rebuilt);
        assert_eq!(first.template(), second.template());
    }

    #[test]
    fn test_duplicate_param_names_disambiguated() {
        let path = normalize_url_path("https://x.test/compare/2020/2021");
        assert_eq!(path.template(), "/compare/{year}/{year2}");
    }
}
