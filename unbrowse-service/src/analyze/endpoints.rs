//! Endpoint grouping and dependency analysis
//!
//! Exchanges collapse into one group per (method, normalized path). Each
//! group carries inferred parameter specs, body schemas, and the
//! produces/consumes names that wire groups into a dependency order.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::normalize::{normalize_all, NormalizedPath, PathParam};
use super::schema::infer_schema;
use crate::exchange::CapturedExchange;

/// Fraction of group requests a query parameter must appear on to be required
const REQUIRED_PARAM_THRESHOLD_PCT: usize = 80;

static ID_LIKE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^id$|Id$|Token$|Uuid$|Key$|uuid$|token$|key$").unwrap());

static AUTH_PATH_MARKERS: &[&str] = &[
    "login", "logout", "signin", "signup", "register", "oauth", "/session", "/token", "/refresh",
];

/// True for names that look like identifiers flowing between endpoints
pub fn is_id_like(name: &str) -> bool {
    ID_LIKE_RE.is_match(name)
}

/// Endpoint behavior class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointCategory {
    Auth,
    Read,
    Write,
    Delete,
}

impl EndpointCategory {
    fn emit_rank(self) -> u8 {
        match self {
            Self::Auth => 0,
            Self::Read => 1,
            Self::Write => 2,
            Self::Delete => 3,
        }
    }
}

/// One query parameter with its observed shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParamSpec {
    pub name: String,
    /// Present on at least 80% of the group's requests
    pub required: bool,
    /// First observed value
    pub example: String,
}

/// Equivalence class of exchanges under (method, normalized path)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointGroup {
    pub method: String,
    pub normalized_path: String,
    pub description: String,
    pub category: EndpointCategory,
    pub path_params: Vec<PathParamSpec>,
    pub query_params: Vec<QueryParamSpec>,
    pub request_body_schema: BTreeMap<String, String>,
    pub response_body_schema: BTreeMap<String, String>,
    /// ID-like response fields this endpoint yields
    pub produces: Vec<String>,
    /// ID-like inputs this endpoint needs
    pub consumes: Vec<String>,
    /// Keys (`"METHOD path"`) of groups that must run first
    pub dependencies: Vec<String>,
    pub example_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_spec: Option<bool>,
    /// Exchange indices backing the group, insertion order
    #[serde(default)]
    pub example_indices: Vec<usize>,
}

/// Path parameter spec carried on a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathParamSpec {
    pub name: String,
    pub kind: String,
    pub example: String,
}

impl From<PathParam> for PathParamSpec {
    fn from(p: PathParam) -> Self {
        Self {
            name: p.name,
            kind: p.kind,
            example: p.example,
        }
    }
}

impl EndpointGroup {
    /// Stable key used for dependency references
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.normalized_path)
    }
}

fn categorize(method: &str, normalized_path: &str) -> EndpointCategory {
    let path = normalized_path.to_ascii_lowercase();
    if AUTH_PATH_MARKERS.iter().any(|m| path.contains(m)) {
        return EndpointCategory::Auth;
    }
    match method {
        "DELETE" => EndpointCategory::Delete,
        "POST" | "PUT" | "PATCH" => EndpointCategory::Write,
        _ => EndpointCategory::Read,
    }
}

fn describe(method: &str, category: EndpointCategory, path: &NormalizedPath) -> String {
    let resource = path
        .template()
        .split('/')
        .rev()
        .find(|s| !s.is_empty() && !s.starts_with('{'))
        .map(|s| s.to_string())
        .unwrap_or_else(|| path.template());
    let verb = match category {
        EndpointCategory::Auth => "Authenticate via",
        EndpointCategory::Read => "Fetch",
        EndpointCategory::Write => "Submit",
        EndpointCategory::Delete => "Delete",
    };
    format!("{} {} ({} {})", verb, resource, method, path.template())
}

/// Build endpoint groups from a sealed exchange sequence.
pub fn analyze_endpoints(exchanges: &[CapturedExchange]) -> Vec<EndpointGroup> {
    let requests: Vec<(String, String)> = exchanges
        .iter()
        .map(|e| {
            (
                e.request.method.to_ascii_uppercase(),
                e.request.url.clone(),
            )
        })
        .collect();
    let paths = normalize_all(&requests);

    // Group exchange positions by (METHOD, template).
    let mut groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
    for (i, (method, _)) in requests.iter().enumerate() {
        groups
            .entry((method.clone(), paths[i].template()))
            .or_default()
            .push(i);
    }

    let mut endpoint_groups: Vec<EndpointGroup> = groups
        .into_iter()
        .map(|((method, template), members)| {
            build_group(&method, &template, &members, &paths, exchanges)
        })
        .collect();

    wire_dependencies(&mut endpoint_groups);

    endpoint_groups.sort_by(|a, b| {
        let a_auth = a.category == EndpointCategory::Auth;
        let b_auth = b.category == EndpointCategory::Auth;
        b_auth
            .cmp(&a_auth)
            .then(a.dependencies.len().cmp(&b.dependencies.len()))
            .then(a.category.emit_rank().cmp(&b.category.emit_rank()))
            .then(a.normalized_path.cmp(&b.normalized_path))
    });

    endpoint_groups
}

fn build_group(
    method: &str,
    template: &str,
    members: &[usize],
    paths: &[NormalizedPath],
    exchanges: &[CapturedExchange],
) -> EndpointGroup {
    let category = categorize(method, template);
    let first_path = &paths[members[0]];

    // Query parameters: frequency decides the required flag; the example is
    // the first observed value.
    let mut seen_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut examples: BTreeMap<String, String> = BTreeMap::new();
    for &m in members {
        let mut seen_here: BTreeSet<&str> = BTreeSet::new();
        for (name, value) in exchanges[m].request.query_params.iter() {
            if seen_here.insert(name) {
                *seen_counts.entry(name.to_string()).or_insert(0) += 1;
            }
            examples.entry(name.to_string()).or_insert_with(|| value.to_string());
        }
    }
    let query_params: Vec<QueryParamSpec> = seen_counts
        .iter()
        .map(|(name, count)| QueryParamSpec {
            name: name.clone(),
            required: count * 100 >= REQUIRED_PARAM_THRESHOLD_PCT * members.len(),
            example: examples.get(name).cloned().unwrap_or_default(),
        })
        .collect();

    let request_samples: Vec<&serde_json::Value> = members
        .iter()
        .filter_map(|&m| exchanges[m].request.body.as_ref())
        .collect();
    let response_samples: Vec<&serde_json::Value> = members
        .iter()
        .filter_map(|&m| exchanges[m].response.body.as_ref())
        .collect();
    let request_body_schema = infer_schema(request_samples.iter().copied());
    let response_body_schema = infer_schema(response_samples.iter().copied());

    let produces: Vec<String> = response_body_schema
        .keys()
        .filter(|name| is_id_like(name))
        .cloned()
        .collect();

    let path_params: Vec<PathParamSpec> = first_path
        .params()
        .into_iter()
        .map(PathParamSpec::from)
        .collect();

    let mut consumes: BTreeSet<String> = path_params.iter().map(|p| p.name.clone()).collect();
    for param in &query_params {
        if is_id_like(&param.name) {
            consumes.insert(param.name.clone());
        }
    }
    for field in request_body_schema.keys() {
        if is_id_like(field) {
            consumes.insert(field.clone());
        }
    }

    EndpointGroup {
        method: method.to_string(),
        normalized_path: template.to_string(),
        description: describe(method, category, first_path),
        category,
        path_params,
        query_params,
        request_body_schema,
        response_body_schema,
        produces,
        consumes: consumes.into_iter().collect(),
        dependencies: Vec::new(),
        example_count: members.len(),
        verified: None,
        from_spec: None,
        example_indices: members.to_vec(),
    }
}

/// Fill in dependency edges: every non-auth endpoint depends on all auth
/// endpoints, and on the producer of each name it consumes. Auth endpoints
/// never depend on anything.
fn wire_dependencies(groups: &mut [EndpointGroup]) {
    let auth_keys: Vec<String> = groups
        .iter()
        .filter(|g| g.category == EndpointCategory::Auth)
        .map(|g| g.key())
        .collect();
    let producers: Vec<(String, BTreeSet<String>)> = groups
        .iter()
        .map(|g| (g.key(), g.produces.iter().cloned().collect()))
        .collect();

    for group in groups.iter_mut() {
        if group.category == EndpointCategory::Auth {
            group.dependencies.clear();
            continue;
        }
        let own_key = group.key();
        let mut deps: BTreeSet<String> = auth_keys.iter().cloned().collect();
        deps.remove(&own_key);
        for consumed in &group.consumes {
            for (key, produced) in &producers {
                if *key != own_key && produced.contains(consumed) {
                    deps.insert(key.clone());
                }
            }
        }
        group.dependencies = deps.into_iter().collect();
    }
}
