//! Command implementations

use colored::Colorize;
use serde_json::{json, Map, Value};
use unbrowse_service::skill::SkillManifest;

use crate::client::{CliError, CliResult, ControlClient};

pub struct ResolveArgs {
    pub intent: String,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub endpoint: Option<String>,
    pub params: Option<String>,
    pub path: Option<String>,
    pub extract: Option<String>,
    pub limit: Option<usize>,
    pub force_capture: bool,
    pub confirm_unsafe: bool,
    pub dry_run: bool,
}

fn parse_params(raw: Option<&str>) -> CliResult<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| CliError::generic(format!("--params is not valid JSON: {}", e))),
        None => Ok(json!({})),
    }
}

fn projection_value(path: &Option<String>, extract: &Option<String>, limit: Option<usize>) -> Option<Value> {
    if path.is_none() && extract.is_none() && limit.is_none() {
        return None;
    }
    let mut projection = Map::new();
    if let Some(path) = path {
        projection.insert("path".into(), json!(path));
    }
    if let Some(extract) = extract {
        projection.insert("extract".into(), json!(extract));
    }
    if let Some(limit) = limit {
        projection.insert("limit".into(), json!(limit));
    }
    Some(Value::Object(projection))
}

fn print_result(body: &Value) {
    if let Some(message) = body.get("message").and_then(|m| m.as_str()) {
        eprintln!("{} {}", "note:".yellow(), message);
    }
    if let Some(endpoints) = body.get("available_endpoints").and_then(|e| e.as_array()) {
        eprintln!("{}", "available endpoints:".bold());
        for endpoint in endpoints {
            eprintln!(
                "  {} {} {}",
                endpoint["endpoint_id"].as_str().unwrap_or("?").cyan(),
                endpoint["method"].as_str().unwrap_or("?"),
                endpoint["url_template"].as_str().unwrap_or("?")
            );
        }
    }
    let result = body.get("result").unwrap_or(&Value::Null);
    match serde_json::to_string_pretty(result) {
        Ok(pretty) => println!("{}", pretty),
        Err(_) => println!("{}", result),
    }
}

pub async fn resolve(client: &ControlClient, args: ResolveArgs) -> CliResult<()> {
    let params = parse_params(args.params.as_deref())?;
    let mut body = json!({
        "intent": args.intent,
        "params": params,
        "dry_run": args.dry_run,
        "force_capture": args.force_capture,
        "confirm_unsafe": args.confirm_unsafe,
    });
    if args.url.is_some() || args.domain.is_some() {
        body["context"] = json!({"url": args.url, "domain": args.domain});
    }
    if let Some(endpoint) = &args.endpoint {
        body["endpoint_id"] = json!(endpoint);
    }
    if let Some(projection) = projection_value(&args.path, &args.extract, args.limit) {
        body["projection"] = projection;
    }

    let response = client.post("/v1/intent/resolve", &body).await?;
    if response
        .get("auth_recommended")
        .and_then(|a| a.as_bool())
        .unwrap_or(false)
    {
        eprintln!(
            "{} authentication required; run {}",
            "note:".yellow(),
            "unbrowse login <url>".bold()
        );
    }
    print_result(&response);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn execute(
    client: &ControlClient,
    skill_id: &str,
    endpoint: Option<&str>,
    params: Option<&str>,
    confirm_unsafe: bool,
    path: Option<String>,
    extract: Option<String>,
    limit: Option<usize>,
) -> CliResult<()> {
    let params = parse_params(params)?;
    let mut body = json!({
        "params": params,
        "confirm_unsafe": confirm_unsafe,
    });
    if let Some(endpoint) = endpoint {
        body["endpoint_id"] = json!(endpoint);
    }
    if let Some(projection) = projection_value(&path, &extract, limit) {
        body["projection"] = projection;
    }

    let response = client
        .post(&format!("/v1/skills/{}/execute", skill_id), &body)
        .await?;
    print_result(&response);
    Ok(())
}

pub async fn search(
    client: &ControlClient,
    intent: &str,
    domain: Option<&str>,
    k: usize,
) -> CliResult<()> {
    let (path, body) = match domain {
        Some(domain) => (
            "/v1/search/domain",
            json!({"intent": intent, "domain": domain, "k": k}),
        ),
        None => ("/v1/search", json!({"intent": intent, "k": k})),
    };
    let hits = client.post(path, &body).await?;
    let Some(hits) = hits.as_array() else {
        return Err(CliError::generic("unexpected search response"));
    };
    if hits.is_empty() {
        println!("no skills found");
        return Ok(());
    }
    for hit in hits {
        println!(
            "{}  {:.3}",
            hit["id"].as_str().unwrap_or("?").cyan(),
            hit["score"].as_f64().unwrap_or(0.0)
        );
    }
    Ok(())
}

pub async fn skills(client: &ControlClient, id: Option<&str>) -> CliResult<()> {
    match id {
        Some(id) => {
            let skill = client.get(&format!("/v1/skills/{}", id)).await?;
            println!("{}", serde_json::to_string_pretty(&skill).unwrap_or_default());
        }
        None => {
            let skills: Vec<SkillManifest> =
                serde_json::from_value(client.get("/v1/skills").await?)
                    .map_err(|e| CliError::generic(format!("unexpected skills response: {}", e)))?;
            if skills.is_empty() {
                println!("no skills learned yet");
                return Ok(());
            }
            for skill in skills {
                println!(
                    "{}  {}  {} endpoint(s)  [{}]",
                    skill.skill_id.cyan(),
                    skill.domain,
                    skill.endpoints.len(),
                    skill.version.get(..12).unwrap_or(&skill.version)
                );
            }
        }
    }
    Ok(())
}

pub async fn login(client: &ControlClient, url: &str, timeout_secs: u64) -> CliResult<()> {
    println!("opening {} for interactive login...", url.bold());
    let response = client
        .post(
            "/v1/auth/login",
            &json!({"url": url, "timeout_secs": timeout_secs}),
        )
        .await?;
    let cookie_count = response
        .get("cookies")
        .and_then(|c| c.as_object())
        .map(|c| c.len())
        .unwrap_or(0);
    println!("{} captured {} cookie(s)", "ok:".green(), cookie_count);
    Ok(())
}

pub async fn feedback(
    client: &ControlClient,
    skill_id: &str,
    endpoint_id: &str,
    rating: u8,
) -> CliResult<()> {
    client
        .post(
            "/v1/feedback",
            &json!({"skill_id": skill_id, "endpoint_id": endpoint_id, "rating": rating}),
        )
        .await?;
    println!("{} feedback recorded", "ok:".green());
    Ok(())
}

pub async fn sessions(client: &ControlClient, domain: &str, limit: usize) -> CliResult<()> {
    let response = client
        .get(&format!("/v1/sessions/{}?limit={}", domain, limit))
        .await?;
    println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
    Ok(())
}
