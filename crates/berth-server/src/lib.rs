//! HTTP control API of the berth agent.
//!
//! Every control route is a `POST` whose JSON body carries the agent's API
//! token in `apikey`, plus `service`, `action`, `version` or `data` where the
//! route needs them. Answers are `{"result": ...}` or `{"error": "ERR_..."}`
//! with status 200; only unknown routes and wrong methods get HTTP errors.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

use berth_core::{shutdown_requested, CoreError, EnvUpdate, Fleet};
use berth_remote::ServiceKind;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, info, warn};

/// Largest request body accepted.
const MAX_BODY: u64 = 1 << 20;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Routes answered through [`Agent::dispatch`].
pub const CONTROL_ROUTES: &[&str] = &[
    "/status",
    "/repo",
    "/control",
    "/install",
    "/delete",
    "/executeupdate",
    "/actionstatus",
    "/executerevert",
    "/updatecheck",
    "/listenv",
    "/storeenv",
];

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid api key")]
    Auth,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unknown route {0}")]
    UnknownRoute(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ApiError {
    /// Marker sent in the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Auth => "ERR_AUTH",
            ApiError::BadRequest(_) => "ERR_BAD_REQUEST",
            ApiError::UnknownRoute(_) => "ERR_NOT_FOUND",
            ApiError::Core(e) => e.code(),
            ApiError::Json(_) => "ERR_INTERNAL",
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot listen on {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("{0}")]
    Prerequisites(String),
}

/// Body shared by all control routes; unused fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ApiRequest {
    pub apikey: String,
    pub service: Option<String>,
    pub action: Option<String>,
    pub version: Option<String>,
    pub data: Vec<EnvUpdate>,
}

impl ApiRequest {
    fn field<'a>(value: Option<&'a String>, name: &str) -> Result<&'a str, ApiError> {
        value
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::BadRequest(format!("missing field `{name}`")))
    }

    fn service(&self) -> Result<&str, ApiError> {
        Self::field(self.service.as_ref(), "service")
    }

    fn version(&self) -> Result<&str, ApiError> {
        Self::field(self.version.as_ref(), "version")
    }

    fn start(&self) -> Result<bool, ApiError> {
        match Self::field(self.action.as_ref(), "action")? {
            "start" => Ok(true),
            "stop" => Ok(false),
            other => Err(ApiError::BadRequest(format!("unknown action `{other}`"))),
        }
    }
}

/// The fleet plus the token every request must present.
pub struct Agent {
    fleet: Arc<Fleet>,
    token: String,
}

impl Agent {
    /// Fails when the fleet has no API token yet (first setup not run).
    pub fn new(fleet: Arc<Fleet>) -> Result<Self, CoreError> {
        let token = fleet.api_token()?;
        if token.is_empty() {
            return Err(CoreError::Config("API token is empty".to_owned()));
        }
        Ok(Self { fleet, token })
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    fn authorize(&self, req: &ApiRequest) -> Result<(), ApiError> {
        let given = req.apikey.as_bytes();
        let expected = self.token.as_bytes();
        let diff = given
            .iter()
            .zip(expected)
            .fold(u8::from(given.len() != expected.len()), |acc, (a, b)| {
                acc | (a ^ b)
            });
        if diff == 0 {
            Ok(())
        } else {
            Err(ApiError::Auth)
        }
    }

    /// Run the control route `route` with the raw request `body`.
    pub fn dispatch(&self, route: &str, body: &[u8]) -> Result<Value, ApiError> {
        let req: ApiRequest = if body.iter().all(u8::is_ascii_whitespace) {
            ApiRequest::default()
        } else {
            serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))?
        };
        self.authorize(&req)?;

        let fleet = &self.fleet;
        let result = match route {
            "/status" => serde_json::to_value(fleet.status_report()?)?,
            "/repo" => serde_json::to_value(fleet.available(ServiceKind::Plugin)?)?,
            "/control" => {
                let start = req.start()?;
                serde_json::to_value(fleet.control(req.service()?, start)?)?
            }
            "/install" => serde_json::to_value(fleet.install(req.service()?)?)?,
            "/delete" => serde_json::to_value(fleet.delete(req.service()?)?)?,
            "/executeupdate" => {
                serde_json::to_value(fleet.execute_update(req.service()?, req.version()?)?)?
            }
            "/actionstatus" => serde_json::to_value(fleet.action_status(req.service()?)?)?,
            "/executerevert" => serde_json::to_value(fleet.execute_revert(req.service()?)?)?,
            "/updatecheck" => serde_json::to_value(fleet.update_check(req.service()?)?)?,
            "/listenv" => serde_json::to_value(fleet.list_env()?)?,
            "/storeenv" => {
                fleet.store_env(&req.data)?;
                json!("SUCCESS")
            }
            other => return Err(ApiError::UnknownRoute(other.to_owned())),
        };
        Ok(result)
    }
}

fn respond(req: Request, code: u16, body: String, content_type: &str) {
    let mut response = Response::from_string(body).with_status_code(StatusCode(code));
    if let Ok(header) = Header::from_bytes("Content-Type", content_type) {
        response.add_header(header);
    }
    if let Err(e) = req.respond(response) {
        debug!("response not delivered: {e}");
    }
}

fn respond_json(req: Request, code: u16, body: &Value) {
    respond(req, code, body.to_string(), "application/json");
}

fn read_body(req: &mut Request) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    req.as_reader().take(MAX_BODY).read_to_end(&mut body)?;
    Ok(body)
}

/// Handle a single HTTP request.
pub fn handle_request(agent: &Agent, mut req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    let route = url.split('?').next().unwrap_or_default().to_owned();
    debug!("{method} {route}");

    if route == "/health" && method == Method::Get {
        respond_json(req, 200, &json!({"status": "ok"}));
        return;
    }
    if route == "/" && method == Method::Post {
        respond(
            req,
            200,
            "berth agent is up and running".to_owned(),
            "text/plain",
        );
        return;
    }
    if !CONTROL_ROUTES.contains(&route.as_str()) {
        respond_json(req, 404, &json!({"error": "ERR_NOT_FOUND"}));
        return;
    }
    if method != Method::Post {
        respond_json(req, 405, &json!({"error": "ERR_METHOD_NOT_ALLOWED"}));
        return;
    }

    let body = match read_body(&mut req) {
        Ok(body) => body,
        Err(e) => {
            warn!("{route}: cannot read body: {e}");
            respond_json(req, 400, &json!({"error": "ERR_BAD_REQUEST"}));
            return;
        }
    };
    let answer = match agent.dispatch(&route, &body) {
        Ok(result) => json!({ "result": result }),
        Err(ApiError::Auth) => {
            warn!("{route}: rejected request with invalid api key");
            json!({"error": "ERR_AUTH"})
        }
        Err(e) => {
            info!("{route}: {e}");
            json!({ "error": e.code() })
        }
    };
    respond_json(req, 200, &answer);
}

/// Serve `addr` until a shutdown is requested, then wait for running operations.
pub fn run_server(agent: &Agent, addr: &str) -> Result<(), ServerError> {
    let server = Server::http(addr).map_err(|e| ServerError::Bind {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })?;
    info!("control API listening on {addr}");
    while !shutdown_requested() {
        if let Some(request) = server.recv_timeout(POLL_INTERVAL)? {
            handle_request(agent, request);
        }
    }
    info!("shutting down, waiting for running service operations");
    agent.fleet.wait_idle()?;
    Ok(())
}

/// A server on a random local port, run on a background thread.
///
/// Dropping it unblocks the server and joins the thread.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    server: Arc<Server>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    /// Bind `127.0.0.1:0` and serve `agent`.
    pub fn start(agent: Arc<Agent>) -> Result<Self, ServerError> {
        let server = Server::http("127.0.0.1:0").map_err(|e| ServerError::Bind {
            addr: "127.0.0.1:0".to_owned(),
            reason: e.to_string(),
        })?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| ServerError::Bind {
                addr: "127.0.0.1:0".to_owned(),
                reason: "not an IP listener".to_owned(),
            })?;
        let server = Arc::new(server);
        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&agent, request);
            }
        });
        Ok(Self {
            url: format!("http://127.0.0.1:{port}"),
            port,
            server,
            handle: Some(handle),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
