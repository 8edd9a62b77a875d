//! URI-addressed resources.
//!
//! `insights://runs/{runId}/{kind}[/{param}]` URIs are resolved through an
//! ordered table of (matcher, handler) pairs: static suffixes first, then
//! parameterized substrings. The first match wins.

use crate::error::{RpcError, RpcResult};
use crate::repository::Repository;
use crate::session::{SessionCache, require_run};
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::OnceLock;
use tracing::debug;

pub const MIME_TYPE: &str = "application/json";
pub const URI_PREFIX: &str = "insights://runs/";

/// One entry of the fixed resource catalog.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ResourceTemplate {
    pub uri: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "mimeType")]
    pub mime_type: &'static str,
}

const fn template(
    uri: &'static str,
    name: &'static str,
    description: &'static str,
) -> ResourceTemplate {
    ResourceTemplate {
        uri,
        name,
        description,
        mime_type: MIME_TYPE,
    }
}

pub const CATALOG: [ResourceTemplate; 8] = [
    template(
        "insights://runs/{runId}/summary",
        "Run summary",
        "Run status, file and analysis counts, and the latest metrics snapshot",
    ),
    template(
        "insights://runs/{runId}/dependencies",
        "Dependency map",
        "Flat dependency edge list with per-file usage counts",
    ),
    template(
        "insights://runs/{runId}/analyses",
        "Analyses",
        "Every file analysis produced by the run",
    ),
    template(
        "insights://runs/{runId}/analyses/{program}",
        "Program analysis",
        "Analysis of a single program, by file name or program name",
    ),
    template(
        "insights://runs/{runId}/graph",
        "Dependency graph",
        "Nodes and edges of the run's dependency graph",
    ),
    template(
        "insights://runs/{runId}/circular-dependencies",
        "Circular dependencies",
        "Bounded list of directed dependency cycles, shortest first",
    ),
    template(
        "insights://runs/{runId}/critical-files",
        "Critical files",
        "Files ranked by incoming plus outgoing dependencies",
    ),
    template(
        "insights://runs/{runId}/impact/{filename}",
        "Impact analysis",
        "Files affected by and required by a given file, within a bounded depth",
    ),
];

pub fn list_resources() -> Value {
    json!({ "resources": CATALOG })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Summary,
    Dependencies,
    Analyses,
    Analysis,
    Graph,
    CircularDependencies,
    CriticalFiles,
    Impact,
}

#[derive(Debug, Clone, Copy)]
enum Matcher {
    Suffix(&'static str),
    Contains(&'static str),
}

impl Matcher {
    fn matches(&self, uri: &str) -> bool {
        match self {
            Matcher::Suffix(suffix) => uri.ends_with(suffix),
            Matcher::Contains(needle) => uri.contains(needle),
        }
    }
}

/// A parsed read request handed to a route handler.
struct Target<'a> {
    uri: &'a str,
    run_id: i64,
    /// Decoded trailing segment for parameterized kinds.
    param: Option<String>,
}

type Handler = fn(&Repository, &mut SessionCache, &Target<'_>) -> RpcResult<Value>;

struct Route {
    kind: ResourceKind,
    matcher: Matcher,
    handler: Handler,
}

static ROUTES: [Route; 8] = [
    Route {
        kind: ResourceKind::Summary,
        matcher: Matcher::Suffix("/summary"),
        handler: read_summary,
    },
    Route {
        kind: ResourceKind::Dependencies,
        matcher: Matcher::Suffix("/dependencies"),
        handler: read_dependencies,
    },
    Route {
        kind: ResourceKind::Analyses,
        matcher: Matcher::Suffix("/analyses"),
        handler: read_analyses,
    },
    Route {
        kind: ResourceKind::Graph,
        matcher: Matcher::Suffix("/graph"),
        handler: read_graph,
    },
    Route {
        kind: ResourceKind::CircularDependencies,
        matcher: Matcher::Suffix("/circular-dependencies"),
        handler: read_cycles,
    },
    Route {
        kind: ResourceKind::CriticalFiles,
        matcher: Matcher::Suffix("/critical-files"),
        handler: read_critical_files,
    },
    Route {
        kind: ResourceKind::Analysis,
        matcher: Matcher::Contains("/analyses/"),
        handler: read_analysis,
    },
    Route {
        kind: ResourceKind::Impact,
        matcher: Matcher::Contains("/impact/"),
        handler: read_impact,
    },
];

/// Which kind a URI resolves to, if any.
pub fn classify_uri(uri: &str) -> Option<ResourceKind> {
    route_for(uri).map(|route| route.kind)
}

fn route_for(uri: &str) -> Option<&'static Route> {
    ROUTES.iter().find(|route| route.matcher.matches(uri))
}

fn run_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"runs/(\d+)/").expect("run id pattern is valid"))
}

/// Run id embedded in the URI, if it carries one.
pub fn uri_run_id(uri: &str) -> RpcResult<Option<i64>> {
    let Some(captures) = run_id_pattern().captures(uri) else {
        return Ok(None);
    };
    captures[1]
        .parse()
        .map(Some)
        .map_err(|_| RpcError::InvalidParams(format!("run id out of range in {uri}")))
}

fn trailing_segment(uri: &str) -> RpcResult<String> {
    let raw = uri.rsplit('/').next().unwrap_or_default();
    if raw.is_empty() {
        return Err(RpcError::InvalidParams(format!("missing name in {uri}")));
    }
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| RpcError::InvalidParams(format!("invalid percent-encoding in {uri}")))?;
    Ok(decoded.into_owned())
}

/// The URI named by `resources/read` params: `uri`, or the first string in
/// `uris`.
pub fn requested_uri(params: &Value) -> RpcResult<&str> {
    if let Some(uri) = params.get("uri").and_then(Value::as_str) {
        return Ok(uri);
    }
    params
        .get("uris")
        .and_then(Value::as_array)
        .and_then(|uris| uris.iter().find_map(Value::as_str))
        .ok_or_else(|| RpcError::InvalidParams("missing uri".to_string()))
}

/// Resolve a resource URI and wrap the payload as
/// `{contents: [{uri, mimeType, text}]}`.
pub fn read_resource(repo: &Repository, cache: &mut SessionCache, uri: &str) -> RpcResult<Value> {
    let route = route_for(uri).ok_or_else(|| RpcError::unknown_resource(uri))?;
    let run_id = match uri_run_id(uri)?.or(cache.run_id()) {
        Some(run_id) => run_id,
        None => return Err(RpcError::NoData("no analysis run available".to_string())),
    };
    let param = match route.matcher {
        Matcher::Contains(_) => Some(trailing_segment(uri)?),
        Matcher::Suffix(_) => None,
    };
    debug!(uri, run_id, kind = ?route.kind, "reading resource");
    let target = Target { uri, run_id, param };
    let payload = (route.handler)(repo, cache, &target)?;
    Ok(json!({
        "contents": [{
            "uri": uri,
            "mimeType": MIME_TYPE,
            "text": serde_json::to_string(&payload)?,
        }]
    }))
}

/// Graph-shaped resources need a run that has dependency rows.
fn require_edges(repo: &Repository, run_id: i64) -> RpcResult<()> {
    require_run(repo, run_id)?;
    if repo.db().run_counts(run_id)?.dependencies == 0 {
        return Err(RpcError::NoData(format!("run {run_id} has no dependencies")));
    }
    Ok(())
}

fn param<'a>(target: &'a Target<'_>) -> RpcResult<&'a str> {
    target
        .param
        .as_deref()
        .ok_or_else(|| RpcError::unknown_resource(target.uri))
}

fn read_summary(repo: &Repository, cache: &mut SessionCache, target: &Target<'_>) -> RpcResult<Value> {
    let summary = cache.summary(repo, target.run_id)?;
    Ok(serde_json::to_value(&*summary)?)
}

fn read_dependencies(
    repo: &Repository,
    cache: &mut SessionCache,
    target: &Target<'_>,
) -> RpcResult<Value> {
    let map = cache.dependencies(repo, target.run_id)?;
    let mut value = serde_json::to_value(&*map)?;
    value["edge_count"] = json!(map.edges.len());
    Ok(value)
}

fn read_analyses(
    repo: &Repository,
    cache: &mut SessionCache,
    target: &Target<'_>,
) -> RpcResult<Value> {
    let analyses = cache.analyses(repo, target.run_id)?;
    Ok(json!({
        "run_id": target.run_id,
        "count": analyses.len(),
        "analyses": &*analyses,
    }))
}

fn read_analysis(repo: &Repository, _cache: &mut SessionCache, target: &Target<'_>) -> RpcResult<Value> {
    let program = param(target)?;
    require_run(repo, target.run_id)?;
    let analysis = repo.get_analysis(target.run_id, program)?.ok_or_else(|| {
        RpcError::NotFound(format!("analysis for {program} in run {}", target.run_id))
    })?;
    Ok(serde_json::to_value(analysis)?)
}

fn read_graph(repo: &Repository, _cache: &mut SessionCache, target: &Target<'_>) -> RpcResult<Value> {
    require_edges(repo, target.run_id)?;
    let graph = repo.graph(target.run_id)?;
    let mut value = serde_json::to_value(&graph)?;
    value["node_count"] = json!(graph.nodes.len());
    value["edge_count"] = json!(graph.edges.len());
    Ok(value)
}

fn read_cycles(repo: &Repository, _cache: &mut SessionCache, target: &Target<'_>) -> RpcResult<Value> {
    require_edges(repo, target.run_id)?;
    let report = repo.cycles(target.run_id)?;
    let mut value = serde_json::to_value(&report)?;
    value["run_id"] = json!(target.run_id);
    value["count"] = json!(report.cycles.len());
    Ok(value)
}

fn read_critical_files(
    repo: &Repository,
    _cache: &mut SessionCache,
    target: &Target<'_>,
) -> RpcResult<Value> {
    require_edges(repo, target.run_id)?;
    let report = repo.critical_files(target.run_id)?;
    let mut value = serde_json::to_value(&report)?;
    value["run_id"] = json!(target.run_id);
    Ok(value)
}

fn read_impact(repo: &Repository, _cache: &mut SessionCache, target: &Target<'_>) -> RpcResult<Value> {
    let file = param(target)?;
    require_edges(repo, target.run_id)?;
    let report = repo.impact(target.run_id, file)?.ok_or_else(|| {
        RpcError::NotFound(format!("file {file} in run {}", target.run_id))
    })?;
    let mut value = serde_json::to_value(&report)?;
    value["run_id"] = json!(target.run_id);
    Ok(value)
}
