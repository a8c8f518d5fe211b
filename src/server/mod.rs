//! HTTP Front-End
//!
//! Maps `(verb, path, body)` onto engine operations and renders
//! `{"success": bool, "result": ...}` JSON responses. Framing is hyper's job;
//! this module only routes.
//!
//! | Verb | Path | Operation |
//! |---|---|---|
//! | GET | `/` | list databases |
//! | GET | `/db` | list tables |
//! | GET | `/db/t` | list boxes |
//! | GET | `/db/t/b` | read box |
//! | POST, PUT | `/db`, `/db/t` | create (existing is a success) |
//! | POST, PUT | `/db/t/b` | create or update box with the body |
//! | DELETE | `/` | delete every database |
//! | DELETE | `/db[/t[/b]]` | delete |

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::store::{DeleteAllSummary, Engine, Level, StorePath, MAX_DEPTH};

/// Message for paths deeper than box level
pub const DEPTH_EXCEEDED: &str = "Path exceeds depth of structure.";

// =============================================================================
// Replies
// =============================================================================

/// A routed response before it is framed
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: StatusCode,
    pub success: bool,
    pub result: Value,
}

impl Reply {
    fn ok(result: impl Into<Value>) -> Self {
        Self {
            status: StatusCode::OK,
            success: true,
            result: result.into(),
        }
    }

    fn fail(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            success: false,
            result: Value::String(message.into()),
        }
    }

    fn from_error(err: &Error) -> Self {
        let status = StatusCode::from_u16(err.kind().status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::fail(status, err.to_string())
    }

    /// JSON body
    pub fn body(&self) -> Value {
        json!({ "success": self.success, "result": self.result })
    }

    /// Frame as an HTTP response
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(self.body().to_string())));
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=UTF-8"),
        );
        response
    }
}

impl From<Result<Reply>> for Reply {
    fn from(result: Result<Reply>) -> Self {
        result.unwrap_or_else(|e| Reply::from_error(&e))
    }
}

// =============================================================================
// Routing
// =============================================================================

/// Route one request to the engine
pub async fn route(engine: &Engine, method: &Method, raw_path: &str, body: Bytes) -> Reply {
    let segments = match decode_segments(raw_path) {
        Ok(segments) => segments,
        Err(e) => return Reply::from_error(&e),
    };
    if segments.len() > MAX_DEPTH {
        return Reply::fail(StatusCode::BAD_REQUEST, DEPTH_EXCEEDED);
    }

    let path = if segments.is_empty() {
        None
    } else {
        match StorePath::from_segments(segments) {
            Ok(path) => Some(path),
            Err(e) => return Reply::from_error(&e),
        }
    };

    let reply = match (method.as_str(), path) {
        ("GET", None) => engine.list_databases().await.map(Reply::ok),
        ("GET", Some(path)) => get(engine, &path).await,
        ("POST" | "PUT", Some(path)) => put(engine, &path, body),
        ("POST" | "PUT", None) => Ok(Reply::fail(
            StatusCode::BAD_REQUEST,
            "A database name is required.",
        )),
        ("DELETE", None) => engine.delete_all().await.map(delete_all_reply),
        ("DELETE", Some(path)) => engine
            .delete(&path)
            .map(|()| Reply::ok(format!("{} successfully deleted.", path.level().title()))),
        _ => Ok(Reply::fail(StatusCode::BAD_REQUEST, "Invalid request verb.")),
    };
    reply.into()
}

async fn get(engine: &Engine, path: &StorePath) -> Result<Reply> {
    match path.level() {
        Level::Database | Level::Table => engine.list(path).await.map(Reply::ok),
        Level::Box => {
            let value = engine.read(path).await?;
            match std::str::from_utf8(&value) {
                Ok(text) => Ok(Reply::ok(text)),
                Err(e) => {
                    error!(path = %path, error = %e, "Box contents are not valid UTF-8");
                    Ok(Reply::fail(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Problem getting box contents.",
                    ))
                }
            }
        }
    }
}

fn delete_all_reply(summary: DeleteAllSummary) -> Reply {
    if summary.is_complete() {
        return Reply::ok("All databases successfully deleted.");
    }

    let DeleteAllSummary { total, deleted } = summary;
    let noun = if total == 1 { "database" } else { "databases" };
    Reply::fail(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!(
            "{deleted} of {total} {noun} successfully deleted. {} of {total} {noun} could not be deleted.",
            total - deleted
        ),
    )
}

fn put(engine: &Engine, path: &StorePath, body: Bytes) -> Result<Reply> {
    let title = path.level().title();

    match path.level() {
        Level::Database | Level::Table => match engine.create(path, Bytes::new()) {
            Ok(()) => Ok(Reply::ok(format!("{} successfully created.", title))),
            Err(Error::AlreadyExists(_)) => Ok(Reply::ok(format!("{} already exists.", title))),
            Err(e) => Err(e),
        },
        Level::Box => match engine.create(path, body.clone()) {
            Ok(()) => Ok(Reply::ok("Box successfully created.")),
            Err(Error::AlreadyExists(_)) => {
                engine.update(path, body)?;
                Ok(Reply::ok("Box successfully updated."))
            }
            Err(e) => Err(e),
        },
    }
}

/// Split a request path into percent-decoded segments, skipping empty ones
fn decode_segments(raw: &str) -> Result<Vec<String>> {
    raw.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .map_err(|e| Error::InvalidPath(format!("'{}' is not valid UTF-8: {}", segment, e)))
        })
        .collect()
}

async fn handle(engine: Engine, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let reply = match req.into_body().collect().await {
        Ok(collected) => route(&engine, &method, &path, collected.to_bytes()).await,
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            Reply::fail(StatusCode::BAD_REQUEST, "Malformed request body.")
        }
    };

    debug!(method = %method, path = %path, status = reply.status.as_u16(), "Handled request");
    reply.into_response()
}

// =============================================================================
// Servers
// =============================================================================

/// Bind a listener, naming the server in errors
pub async fn bind(addr: &str, name: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} server address '{}': {}", name, addr, e)))?;

    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server on {}: {}", name, addr, e)))
}

/// Serve the data API until cancelled
pub async fn serve(listener: TcpListener, engine: Engine, cancel: CancellationToken) -> Result<()> {
    accept_loop(listener, cancel, "data", move |req| {
        let engine = engine.clone();
        async move { Ok::<_, Infallible>(handle(engine, req).await) }
    })
    .await
}

/// Serve `/metrics` until cancelled
pub async fn serve_metrics(
    listener: TcpListener,
    engine: Engine,
    cancel: CancellationToken,
) -> Result<()> {
    accept_loop(listener, cancel, "metrics", move |req: Request<Incoming>| {
        let engine = engine.clone();
        async move { Ok::<_, Infallible>(metrics_response(&engine, req.uri().path())) }
    })
    .await
}

fn metrics_response(engine: &Engine, path: &str) -> Response<Full<Bytes>> {
    let (status, body) = match path {
        "/metrics" => match engine.render_metrics() {
            Ok(text) => (StatusCode::OK, text),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        _ => (StatusCode::NOT_FOUND, "not found".to_string()),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if status == StatusCode::OK {
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        );
    }
    response
}

async fn accept_loop<H, Fut>(
    listener: TcpListener,
    cancel: CancellationToken,
    name: &'static str,
    handler: H,
) -> Result<()>
where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = std::result::Result<Response<Full<Bytes>>, Infallible>> + Send + 'static,
{
    let local = listener.local_addr()?;
    info!(server = name, addr = %local, "Server listening");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("{} server accept error: {}", name, e)))?,
            _ = cancel.cancelled() => break,
        };

        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                debug!(server = name, peer = %peer, error = %e, "Connection error");
            }
        });
    }

    info!(server = name, "Server stopped accepting connections");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
