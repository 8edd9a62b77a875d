use crate::config::Config;
use crate::error::{RpcError, RpcResult};
use crate::narrator::{CommandNarrator, Narrator};
use crate::repository::Repository;
use crate::resources;
use crate::session::SessionCache;
use crate::summary;
use crate::transport::{Frame, FrameReader, write_frame};
use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use std::io::{self, BufRead, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Everything a request handler can touch. Requests are handled one at a
/// time, so this is plain owned state.
pub struct State {
    repo: Repository,
    cache: SessionCache,
    narrator: Option<Box<dyn Narrator>>,
}

impl State {
    pub fn new(repo: Repository, run_id: Option<i64>, narrator: Option<Box<dyn Narrator>>) -> Self {
        Self {
            repo,
            cache: SessionCache::new(run_id),
            narrator,
        }
    }

    /// Open the stores and bind to `run_id`, or to the latest run when none
    /// is given.
    pub fn open(db_path: &Path, graph_path: Option<&Path>, run_id: Option<i64>) -> Result<Self> {
        let repo = Repository::open(db_path, graph_path)?;
        let run_id = match run_id {
            Some(run_id) => Some(run_id),
            None => repo.latest_run()?.map(|run| run.id),
        };
        let narrator = Config::get()
            .narrator_cmd
            .as_ref()
            .map(|cmd| Box::new(CommandNarrator::new(cmd.clone())) as Box<dyn Narrator>);
        info!(
            db = %repo.db().db_path().display(),
            run_id = ?run_id,
            graph_store = repo.has_graph(),
            narrator = narrator.is_some(),
            "session ready"
        );
        Ok(Self::new(repo, run_id, narrator))
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn run_id(&self) -> Option<i64> {
        self.cache.run_id()
    }
}

/// How long to back off when no complete frame is available, and how many
/// empty polls in a row end the session (0 = never).
#[derive(Debug, Clone, Copy)]
pub struct IdlePolicy {
    pub sleep: Duration,
    pub max_idle_polls: u32,
}

impl IdlePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sleep: Duration::from_millis(config.idle_ms),
            max_idle_polls: config.max_idle_polls,
        }
    }
}

/// Outcome of handling one message.
#[derive(Debug)]
pub struct Reply {
    pub response: Option<Value>,
    pub shutdown: bool,
}

pub fn serve(state: &mut State, cancel: Arc<AtomicBool>) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    serve_stream(
        state,
        stdin.lock(),
        &mut writer,
        cancel,
        IdlePolicy::from_config(Config::get()),
    )
}

/// Read framed requests from `reader` and answer on `writer` until shutdown,
/// end of input, or cancellation.
pub fn serve_stream<R: BufRead, W: Write>(
    state: &mut State,
    reader: R,
    writer: &mut W,
    cancel: Arc<AtomicBool>,
    idle: IdlePolicy,
) -> Result<()> {
    let mut frames = FrameReader::with_cancel(reader, Arc::clone(&cancel))
        .max_body(Config::get().max_frame_bytes);
    let mut idle_polls = 0u32;

    loop {
        if cancel.load(Ordering::SeqCst) {
            info!("cancelled, stopping");
            break;
        }
        match frames.read_frame().with_context(|| "read frame")? {
            Frame::Message(message) => {
                idle_polls = 0;
                let reply = handle_message(message, state);
                if let Some(response) = reply.response {
                    write_frame(writer, &response).with_context(|| "write frame")?;
                }
                if reply.shutdown {
                    info!("shutdown requested");
                    break;
                }
            }
            Frame::Pending => {
                idle_polls += 1;
                if idle.max_idle_polls != 0 && idle_polls >= idle.max_idle_polls {
                    debug!(idle_polls, "input idle, closing session");
                    break;
                }
                std::thread::sleep(idle.sleep);
            }
            Frame::Dropped => idle_polls = 0,
            Frame::Closed => {
                debug!("input closed");
                break;
            }
        }
    }

    Ok(())
}

pub fn handle_message(message: Value, state: &mut State) -> Reply {
    let id = message.get("id").cloned();
    let method = message.get("method").and_then(|value| value.as_str());

    let Some(method) = method else {
        if id.is_none() {
            debug!("dropping notification without method");
        }
        return Reply {
            response: id.map(|id| {
                jsonrpc_error(id, &RpcError::InvalidRequest("missing method".to_string()))
            }),
            shutdown: false,
        };
    };

    if method == "notifications/initialized" {
        return Reply {
            response: None,
            shutdown: false,
        };
    }

    let params = message.get("params").cloned().unwrap_or(Value::Null);
    let outcome = catch_unwind(AssertUnwindSafe(|| dispatch(method, &params, &message, state)))
        .unwrap_or_else(|panic| Err(RpcError::Internal(anyhow!(panic_message(&*panic)))));
    let shutdown = method == "shutdown";

    let response = match (id, outcome) {
        (Some(id), Ok(result)) => Some(jsonrpc_result(id, result)),
        (Some(id), Err(err)) => {
            if matches!(err, RpcError::Internal(_)) {
                warn!(method, error = %err, "request failed");
            } else {
                debug!(method, code = err.code(), error = %err, "request rejected");
            }
            Some(jsonrpc_error(id, &err))
        }
        (None, Ok(_)) => None,
        (None, Err(err)) => {
            debug!(method, error = %err, "dropping failed notification");
            None
        }
    };
    Reply { response, shutdown }
}

fn dispatch(method: &str, params: &Value, message: &Value, state: &mut State) -> RpcResult<Value> {
    match method {
        "initialize" => Ok(initialize_result(message)),
        "ping" => Ok(json!({})),
        "shutdown" => Ok(json!({})),
        "resources/list" => Ok(resources::list_resources()),
        "resources/read" => {
            let uri = resources::requested_uri(params)?;
            resources::read_resource(&state.repo, &mut state.cache, uri)
        }
        "messages/create" => summary::create_message(
            &state.repo,
            &mut state.cache,
            state.narrator.as_deref(),
            params,
        ),
        other => Err(RpcError::MethodNotFound(other.to_string())),
    }
}

fn initialize_result(message: &Value) -> Value {
    let protocol = message
        .get("params")
        .and_then(|params| params.get("protocolVersion"))
        .cloned()
        .unwrap_or_else(|| Value::String(DEFAULT_PROTOCOL_VERSION.to_string()));
    json!({
        "protocolVersion": protocol,
        "capabilities": { "resources": {} },
        "serverInfo": {
            "name": "insights",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "instructions": "Read insights://runs/{runId}/summary first. Graph views: graph, \
circular-dependencies, critical-files, impact/{filename}. Per-program detail: analyses/{program}.",
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {detail}")
}

fn jsonrpc_result(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn jsonrpc_error(id: Value, err: &RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": err.code(),
            "message": err.to_string()
        }
    })
}

/// Handle a single request and return the serialized response, for the
/// `request` command. Notifications yield an empty string.
pub fn call(
    db_path: &Path,
    graph_path: Option<&Path>,
    run_id: Option<i64>,
    method: &str,
    params_raw: &str,
    id_raw: &str,
) -> Result<String> {
    let params: Value = serde_json::from_str(params_raw).with_context(|| "parse params JSON")?;
    let mut state = State::open(db_path, graph_path, run_id)?;
    let message = json!({
        "jsonrpc": "2.0",
        "id": parse_id(id_raw),
        "method": method,
        "params": params,
    });
    match handle_message(message, &mut state).response {
        Some(response) => Ok(serde_json::to_string(&response)?),
        None => Ok(String::new()),
    }
}

fn parse_id(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
