/// Local control API + SSE for the host app shell
///
/// Endpoints:
///   GET    /api/badge
///   POST   /api/push              body: push payload
///   POST   /api/socket/message    body: {"chatId","senderId","content","timestamp","read"?}
///   POST   /api/socket/read       body: {"chatId"}
///   POST   /api/tap               body: {"origin":"foreground|background|initial","payload":{...}}
///   POST   /api/badge/chat        body: {"delta":-1} or {"set":3}
///   DELETE /api/badge/chat
///   DELETE /api/badge/inbox
///   POST   /api/sync              forced refresh (502 on failure)
///   POST   /api/foreground
///   POST   /api/logout
///   GET    /events                SSE stream of ControlEvent JSON
///
/// Navigation actions are delivered over `/events`; the navigation surface
/// counts as ready while at least one SSE client is attached.
use crate::badge::{BadgeSnapshot, SyncOutcome};
use crate::error::{NotifyError, Result};
use crate::event::{PushPayload, ReadReceipt, SocketMessage};
use crate::navigation::{NavigationAction, NavigationHandle};
use crate::session::{NotificationSession, TapOrigin};
use async_trait::async_trait;
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

/// Events streamed to attached app shells
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Badge counters changed
    Badge { badge: BadgeSnapshot },
    /// Navigate to a destination
    Navigation { action: NavigationAction },
}

/// Navigation handle that forwards actions to SSE clients
pub struct ChannelNavigator {
    events: broadcast::Sender<ControlEvent>,
}

#[async_trait]
impl NavigationHandle for ChannelNavigator {
    fn is_ready(&self) -> bool {
        self.events.receiver_count() > 0
    }

    async fn dispatch(&self, action: NavigationAction) -> Result<()> {
        self.events
            .send(ControlEvent::Navigation { action })
            .map(|_| ())
            .map_err(|_| NotifyError::Navigation("no app shell attached".to_string()))
    }
}

/// Control API state
pub struct ControlApi {
    session: NotificationSession,
    events: broadcast::Sender<ControlEvent>,
}

impl ControlApi {
    /// Wire badge updates into the event stream
    pub fn new(session: NotificationSession) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let tx = events.clone();
        // Lives as long as the session's badge store
        let _subscription = session.subscribe_to_badge_updates(move |badge| {
            let _ = tx.send(ControlEvent::Badge { badge: *badge });
        });
        Self { session, events }
    }

    pub fn navigator(&self) -> Arc<ChannelNavigator> {
        Arc::new(ChannelNavigator {
            events: self.events.clone(),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

/// Finish a response; a builder error degrades to an empty 500
fn respond(builder: hyper::http::response::Builder, body: BoxBody) -> Resp {
    builder.body(body).unwrap_or_else(|e| {
        error!("Failed to build response: {}", e);
        let mut resp = Response::new(empty_body());
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        resp
    })
}

fn empty_body() -> BoxBody {
    Full::new(bytes::Bytes::new()).boxed()
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    let builder = cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json");
    respond(builder, Full::new(bytes::Bytes::from(body)).boxed())
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_resp(StatusCode::OK, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

fn sync_json(outcome: &SyncOutcome) -> serde_json::Value {
    match outcome {
        SyncOutcome::Reconciled(badge) => serde_json::json!({ "status": "reconciled", "badge": badge }),
        SyncOutcome::Skipped => serde_json::json!({ "status": "skipped" }),
        SyncOutcome::Failed(e) => serde_json::json!({ "status": "failed", "error": e }),
    }
}

fn sse_resp(rx: broadcast::Receiver<ControlEvent>) -> Resp {
    // Keepalive comment sent immediately so the client knows the connection is live
    let initial = bytes::Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(initial))
    });

    let events = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    let data = format!("data: {}\n\n", json);
                    let frame = Frame::data(bytes::Bytes::from(data));
                    return Some((Ok::<_, Infallible>(frame), rx));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE client lagged {} events", n);
                    continue;
                }
                Err(_) => return None,
            }
        }
    });

    let builder = cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("X-Accel-Buffering", "no");
    respond(builder, StreamBody::new(first.chain(events)).boxed())
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn start_control_api(api: ControlApi, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(NotifyError::Io)?;
    serve_control_api(api, listener).await
}

pub async fn serve_control_api(api: ControlApi, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr().map_err(NotifyError::Io)?;
    info!("Control API started on http://{}", addr);

    let api = Arc::new(api);
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let api = api.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let api = api.clone();
                        async move { Ok::<_, Infallible>(handle(req, api).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // Ignore client-disconnect errors (normal for SSE)
                        if !e.is_incomplete_message() {
                            error!("Control API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Control API accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, api: Arc<ControlApi>) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::OPTIONS {
        return respond(
            cors_headers(Response::builder()).status(StatusCode::NO_CONTENT),
            empty_body(),
        );
    }

    let session = &api.session;
    match (method, path.as_str()) {
        (Method::GET, "/api/badge") => json_ok(serde_json::json!(session.get_badge_state())),
        (Method::POST, "/api/push") => post_push(req, session).await,
        (Method::POST, "/api/socket/message") => post_socket_message(req, session).await,
        (Method::POST, "/api/socket/read") => post_read_receipt(req, session).await,
        (Method::POST, "/api/tap") => post_tap(req, session).await,
        (Method::POST, "/api/badge/chat") => post_chat_count(req, session).await,
        (Method::DELETE, "/api/badge/chat") => {
            session.clear_chat_count();
            json_ok(serde_json::json!(session.get_badge_state()))
        }
        (Method::DELETE, "/api/badge/inbox") => {
            session.clear_inbox_indicator();
            json_ok(serde_json::json!(session.get_badge_state()))
        }
        (Method::POST, "/api/sync") => match session.sync_now().await {
            Ok(outcome) => json_ok(sync_json(&outcome)),
            Err(e) => json_err(StatusCode::BAD_GATEWAY, &e.to_string()),
        },
        (Method::POST, "/api/foreground") => json_ok(sync_json(&session.on_foreground().await)),
        (Method::POST, "/api/logout") => {
            session.logout();
            json_ok(serde_json::json!({ "success": true }))
        }
        (Method::GET, "/events") => {
            let rx = api.subscribe_events();
            // A shell just attached: taps parked during cold start can go now
            session.navigation_ready();
            sse_resp(rx)
        }
        _ => json_err(StatusCode::NOT_FOUND, "not found"),
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn post_push(req: Request<hyper::body::Incoming>, session: &NotificationSession) -> Resp {
    let payload: PushPayload = match read_json(req).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    json_ok(serde_json::json!(session.ingest_push(payload)))
}

async fn post_socket_message(
    req: Request<hyper::body::Incoming>,
    session: &NotificationSession,
) -> Resp {
    let message: SocketMessage = match read_json(req).await {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    json_ok(serde_json::json!({ "admission": session.ingest_socket_message(message) }))
}

async fn post_read_receipt(
    req: Request<hyper::body::Incoming>,
    session: &NotificationSession,
) -> Resp {
    let receipt: ReadReceipt = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    json_ok(sync_json(&session.ingest_read_receipt(receipt).await))
}

#[derive(Deserialize)]
struct TapRequest {
    origin: TapOrigin,
    payload: PushPayload,
}

async fn post_tap(req: Request<hyper::body::Incoming>, session: &NotificationSession) -> Resp {
    let tap: TapRequest = match read_json(req).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match session.handle_tap(tap.origin, tap.payload) {
        Some(outcome) => json_ok(serde_json::json!({ "outcome": outcome })),
        None => json_err(StatusCode::UNPROCESSABLE_ENTITY, "invalid notification payload"),
    }
}

#[derive(Deserialize)]
struct ChatCountRequest {
    delta: Option<i64>,
    set: Option<u32>,
}

async fn post_chat_count(
    req: Request<hyper::body::Incoming>,
    session: &NotificationSession,
) -> Resp {
    let r: ChatCountRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match (r.delta, r.set) {
        (Some(delta), None) => session.update_chat_count(delta),
        (None, Some(count)) => session.set_chat_count(count),
        _ => return json_err(StatusCode::BAD_REQUEST, "expected exactly one of delta or set"),
    }
    json_ok(serde_json::json!(session.get_badge_state()))
}

// ─── Utilities ────────────────────────────────────────────────────────────────

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<T, Resp> {
    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)))?;
    serde_json::from_slice(&body)
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)))
}
