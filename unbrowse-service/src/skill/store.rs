//! On-disk skill storage
//!
//! Layout under the configurable base directory (default `~/.unbrowse`):
//!
//! ```text
//! skills/<slug>/
//!   skill.json             manifest (system of record)
//!   SKILL.md               markdown document with frontmatter
//!   auth.json              replayable auth state
//!   scripts/api.ts         generated TypeScript client
//!   references/REFERENCE.md + DAG.json
//!   .marketplace.json      publish record
//! header-profiles/<domain>.json
//! ```
//!
//! Writes are atomic (temp file + rename). A directory-wide file lock keeps
//! one control service per skills directory.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::analyze::profile::HeaderProfile;
use crate::auth::csrf::CsrfProvenance;
use crate::auth::refresh::RefreshConfig;
use crate::auth::extract::AuthState;
use crate::correlate::CorrelationGraphV1;
use crate::error::{Error, Result};
use crate::exchange::{HeaderMap, ParamMap};
use crate::skill::manifest::{slugify, SkillManifest};

/// Persisted auth state for one skill
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthFile {
    pub base_url: String,
    pub headers: HeaderMap,
    pub cookies: ParamMap,
    pub local_storage: BTreeMap<String, String>,
    pub session_storage: BTreeMap<String, String>,
    pub meta_tokens: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csrf_provenance: Option<CsrfProvenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_open_claw_browse_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_config: Option<RefreshConfig>,
}

impl AuthFile {
    pub fn from_state(base_url: &str, state: &AuthState, refresh: Option<RefreshConfig>) -> Self {
        Self {
            base_url: base_url.to_string(),
            headers: state.auth_headers.clone(),
            cookies: state.cookies.clone(),
            local_storage: state.local_storage.clone(),
            session_storage: state.session_storage.clone(),
            meta_tokens: state.meta_tokens.clone(),
            csrf_provenance: state.csrf_provenance.clone(),
            last_open_claw_browse_at: Some(Utc::now()),
            refresh_config: refresh,
        }
    }
}

/// Publish record kept next to the skill
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceRef {
    pub skill_id: String,
    pub index_url: String,
    pub name: String,
}

/// Held while the control service runs; released on drop
pub struct StoreLock {
    _file: File,
}

/// Skill directory store. All mutations serialize through one mutex;
/// reads go straight to disk (writes are atomic renames).
pub struct SkillStore {
    base_dir: PathBuf,
    write_lock: std::sync::Mutex<()>,
}

impl SkillStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(base_dir.join("skills"))?;
        std::fs::create_dir_all(base_dir.join("header-profiles"))?;
        Ok(Self {
            base_dir,
            write_lock: std::sync::Mutex::new(()),
        })
    }

    fn write_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Exclusive advisory lock on the skills directory. Fails fast when
    /// another control service already owns it.
    pub fn lock(&self) -> Result<StoreLock> {
        let path = self.base_dir.join(".lock");
        let file = File::create(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::Conflict(format!(
                "another unbrowse service is already running against {}",
                self.base_dir.display()
            ))
        })?;
        Ok(StoreLock { _file: file })
    }

    fn skill_dir(&self, slug: &str) -> PathBuf {
        self.base_dir.join("skills").join(slug)
    }

    /// Persist the full skill directory for a learned skill.
    pub fn save_skill(
        &self,
        manifest: &SkillManifest,
        auth: &AuthFile,
        graph: Option<&CorrelationGraphV1>,
    ) -> Result<()> {
        let _guard = self.write_guard();
        let dir = self.skill_dir(&manifest.slug());
        std::fs::create_dir_all(dir.join("scripts"))?;
        std::fs::create_dir_all(dir.join("references"))?;

        write_json_atomic(&dir.join("skill.json"), manifest)?;
        write_json_atomic(&dir.join("auth.json"), auth)?;
        write_text_atomic(&dir.join("SKILL.md"), &render_skill_md(manifest))?;
        write_text_atomic(&dir.join("scripts/api.ts"), &render_ts_client(manifest))?;
        write_text_atomic(
            &dir.join("references/REFERENCE.md"),
            &render_reference_md(manifest),
        )?;
        if let Some(graph) = graph {
            write_json_atomic(&dir.join("references/DAG.json"), graph)?;
        }
        tracing::info!(skill = %manifest.slug(), "Skill persisted to disk");
        Ok(())
    }

    pub fn load_skill(&self, slug: &str) -> Result<Option<SkillManifest>> {
        read_json_opt(&self.skill_dir(slug).join("skill.json"))
    }

    /// Find a skill by its marketplace id
    pub fn load_skill_by_id(&self, skill_id: &str) -> Result<Option<SkillManifest>> {
        for manifest in self.list_skills()? {
            if manifest.skill_id == skill_id {
                return Ok(Some(manifest));
            }
        }
        Ok(None)
    }

    pub fn list_skills(&self) -> Result<Vec<SkillManifest>> {
        let skills_dir = self.base_dir.join("skills");
        let mut skills = Vec::new();
        for entry in std::fs::read_dir(&skills_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join("skill.json");
            match read_json_opt::<SkillManifest>(&path)? {
                Some(manifest) => skills.push(manifest),
                None => continue,
            }
        }
        skills.sort_by(|a, b| a.slug().cmp(&b.slug()));
        Ok(skills)
    }

    pub fn load_auth(&self, slug: &str) -> Result<Option<AuthFile>> {
        read_json_opt(&self.skill_dir(slug).join("auth.json"))
    }

    /// Read-modify-write the auth file atomically.
    pub fn update_auth(&self, slug: &str, update: impl FnOnce(&mut AuthFile)) -> Result<()> {
        let _guard = self.write_guard();
        let mut auth = self.load_auth(slug)?.unwrap_or_default();
        update(&mut auth);
        write_json_atomic(&self.skill_dir(slug).join("auth.json"), &auth)
    }

    /// Read-modify-write the manifest atomically.
    pub fn update_skill(&self, slug: &str, update: impl FnOnce(&mut SkillManifest)) -> Result<()> {
        let _guard = self.write_guard();
        let Some(mut manifest) = self.load_skill(slug)? else {
            return Err(Error::NotFound(format!("no skill at {}", slug)));
        };
        update(&mut manifest);
        write_json_atomic(&self.skill_dir(slug).join("skill.json"), &manifest)
    }

    pub fn save_marketplace_ref(&self, slug: &str, reference: &MarketplaceRef) -> Result<()> {
        let _guard = self.write_guard();
        write_json_atomic(&self.skill_dir(slug).join(".marketplace.json"), reference)
    }

    pub fn load_marketplace_ref(&self, slug: &str) -> Result<Option<MarketplaceRef>> {
        read_json_opt(&self.skill_dir(slug).join(".marketplace.json"))
    }

    pub fn load_graph(&self, slug: &str) -> Result<Option<CorrelationGraphV1>> {
        read_json_opt(&self.skill_dir(slug).join("references/DAG.json"))
    }

    /// Store an extraction recipe for one endpoint
    pub fn save_recipe(
        &self,
        slug: &str,
        endpoint_id: &str,
        recipe: &crate::project::ProjectionSpec,
    ) -> Result<()> {
        let _guard = self.write_guard();
        let mut recipes = self.load_recipes(slug)?;
        recipes.insert(endpoint_id.to_string(), recipe.clone());
        write_json_atomic(&self.skill_dir(slug).join("recipes.json"), &recipes)
    }

    pub fn load_recipe(
        &self,
        slug: &str,
        endpoint_id: &str,
    ) -> Result<Option<crate::project::ProjectionSpec>> {
        Ok(self.load_recipes(slug)?.remove(endpoint_id))
    }

    fn load_recipes(
        &self,
        slug: &str,
    ) -> Result<BTreeMap<String, crate::project::ProjectionSpec>> {
        Ok(read_json_opt(&self.skill_dir(slug).join("recipes.json"))?.unwrap_or_default())
    }

    pub fn save_profile(&self, profile: &HeaderProfile) -> Result<()> {
        let _guard = self.write_guard();
        let path = self
            .base_dir
            .join("header-profiles")
            .join(format!("{}.json", slugify(&profile.domain)));
        write_json_atomic(&path, profile)
    }

    pub fn load_profile(&self, domain: &str) -> Result<Option<HeaderProfile>> {
        let path = self
            .base_dir
            .join("header-profiles")
            .join(format!("{}.json", slugify(domain)));
        read_json_opt(&path)
    }

    /// Skill for a domain, when one was learned
    pub fn skill_for_domain(&self, domain: &str) -> Result<Option<SkillManifest>> {
        self.load_skill(&slugify(domain))
    }
}

/// Persists refreshed tokens: the scheduler's bridge into the skill store.
pub struct StoreRefreshSink {
    store: std::sync::Arc<SkillStore>,
}

impl StoreRefreshSink {
    pub fn new(store: std::sync::Arc<SkillStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl crate::auth::scheduler::RefreshSink for StoreRefreshSink {
    async fn apply_refreshed(
        &self,
        skill_id: &str,
        info: &crate::auth::refresh::TokenInfo,
        _config: &RefreshConfig,
    ) -> Result<()> {
        let Some(manifest) = self.store.load_skill_by_id(skill_id)? else {
            return Err(Error::NotFound(format!("no local skill {}", skill_id)));
        };
        let access = info.access_token.clone();
        let refresh = info.refresh_token.clone();
        let expires_in = info.expires_in;
        self.store.update_auth(&manifest.slug(), move |auth| {
            if let Some(access) = access {
                auth.headers.insert("Authorization", format!("Bearer {}", access));
            }
            if let Some(config) = auth.refresh_config.as_mut() {
                if let Some(refresh) = refresh {
                    config.refresh_token = Some(refresh);
                }
                if let Some(secs) = expires_in {
                    config.expires_in_seconds = Some(secs);
                    config.expires_at = Some(Utc::now() + chrono::Duration::seconds(secs));
                }
            }
        })
    }

    async fn mark_degraded(&self, skill_id: &str) -> Result<()> {
        let Some(manifest) = self.store.load_skill_by_id(skill_id)? else {
            return Err(Error::NotFound(format!("no local skill {}", skill_id)));
        };
        self.store.update_skill(&manifest.slug(), |skill| {
            skill.refresh_degraded = Some(true);
        })
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::Internal(format!("serialization failed for {}: {}", path.display(), e)))?;
    write_bytes_atomic(path, &json)
}

fn write_text_atomic(path: &Path, text: &str) -> Result<()> {
    write_bytes_atomic(path, text.as_bytes())
}

fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| Error::Internal(format!("corrupt file {}: {}", path.display(), e)))
}

fn render_skill_md(manifest: &SkillManifest) -> String {
    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&format!("name: {}\n", manifest.name));
    out.push_str(&format!("description: {}\n", manifest.description));
    out.push_str("metadata:\n");
    out.push_str(&format!("  skill_id: {}\n", manifest.skill_id));
    out.push_str(&format!("  version: {}\n", manifest.version));
    out.push_str(&format!("  domain: {}\n", manifest.domain));
    out.push_str("---\n\n");
    out.push_str(&format!("# {}\n\n", manifest.name));
    out.push_str(&format!("{}\n\n", manifest.intent_signature));
    out.push_str("## Endpoints\n\n");
    for endpoint in &manifest.endpoints {
        out.push_str(&format!("### {} {}\n\n", endpoint.method, endpoint.url_template));
        if !endpoint.path_params.is_empty() {
            out.push_str("Path parameters:\n");
            for param in &endpoint.path_params {
                out.push_str(&format!("- `{}` ({}), e.g. `{}`\n", param.name, param.kind, param.example));
            }
            out.push('\n');
        }
        if !endpoint.query_params.is_empty() {
            out.push_str("Query parameters:\n");
            for param in &endpoint.query_params {
                let req = if param.required { "required" } else { "optional" };
                out.push_str(&format!("- `{}` ({}), e.g. `{}`\n", param.name, req, param.example));
            }
            out.push('\n');
        }
        if !endpoint.response_schema.is_empty() {
            out.push_str("Response fields: ");
            let fields: Vec<String> = endpoint
                .response_schema
                .iter()
                .map(|(k, v)| format!("`{}: {}`", k, v))
                .collect();
            out.push_str(&fields.join(", "));
            out.push_str("\n\n");
        }
    }
    out
}

fn render_reference_md(manifest: &SkillManifest) -> String {
    let mut out = format!(
        "# {} reference\n\nDomain: {}\nAuth: {:?}\nEndpoints: {}\n\n",
        manifest.name,
        manifest.domain,
        manifest.auth_method,
        manifest.endpoints.len()
    );
    out.push_str("Dependency order (produces -> consumes):\n\n");
    for endpoint in &manifest.endpoints {
        out.push_str(&format!(
            "- {} {} produces [{}] consumes [{}]\n",
            endpoint.method,
            endpoint.url_template,
            endpoint.produces.join(", "),
            endpoint.consumes.join(", ")
        ));
    }
    out
}

/// Minimal generated TypeScript client, one function per endpoint.
fn render_ts_client(manifest: &SkillManifest) -> String {
    let mut out = String::from("// Generated by unbrowse. Do not edit.\n\n");
    out.push_str(&format!(
        "const BASE = {};\n\n",
        serde_json::to_string(manifest.base_urls.first().map(|s| s.as_str()).unwrap_or_default())
            .unwrap_or_else(|_| "\"\"".to_string())
    ));
    for endpoint in &manifest.endpoints {
        let fn_name = endpoint.endpoint_id.replace('-', "_");
        let params: Vec<String> = endpoint
            .path_params
            .iter()
            .map(|p| format!("{}: string", p.name))
            .collect();
        let mut template = endpoint.url_template.clone();
        for param in &endpoint.path_params {
            template = template.replace(&format!("{{{}}}", param.name), &format!("${{{}}}", param.name));
        }
        out.push_str(&format!(
            "export async function {}({}): Promise<unknown> {{\n  const res = await fetch(`{}`, {{ method: {:?} }});\n  return res.json();\n}}\n\n",
            fn_name,
            params.join(", "),
            template,
            endpoint.method,
        ));
    }
    out
}
