//! Streaming HTTP transport ("SSE"), bound to loopback.
//!
//! A client opens `GET /sse` and holds the event stream: the first frame is
//! an `endpoint` event naming the per-session POST URL, every JSON-RPC
//! response after that rides a `message` event, and `:keepalive` comments go
//! out periodically so middleboxes keep the connection alive. Requests come
//! in as POSTs correlated by session id. Each session owns a bounded queue;
//! a client too slow to drain it gets closed instead of blocking its peers.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use axum::Json;
use axum::Router;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::sse::KeepAlive;
use axum::response::sse::Sse;
use axum::routing::get;
use axum::routing::post;
use futures::Stream;
use futures::StreamExt;
use mcp_types::JSONRPCMessage;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use toolmux_core::ProxyHandler;

pub const DEFAULT_SSE_PORT: u16 = 24680;

/// Outgoing frames a session may have buffered before it is considered too
/// slow and closed.
const SESSION_QUEUE_CAPACITY: usize = 128;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// How often the reaper sweeps for idle sessions.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(60);

struct SseSession {
    tx: mpsc::Sender<JSONRPCMessage>,
    last_activity: Instant,
}

pub struct SseState {
    handler: Arc<ProxyHandler>,
    sessions: Mutex<HashMap<String, SseSession>>,
}

impl SseState {
    fn remove_session(&self, session_id: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if sessions.remove(session_id).is_some() {
                debug!("session {session_id} closed");
            }
        }
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Removes the session when the host drops the event stream.
struct SessionGuard {
    state: Arc<SseState>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.remove_session(&self.session_id);
    }
}

pub fn app(handler: Arc<ProxyHandler>) -> Router {
    let state = Arc::new(SseState {
        handler,
        sessions: Mutex::new(HashMap::new()),
    });
    spawn_session_reaper(state.clone());
    Router::new()
        .route("/sse", get(open_sse))
        .route("/message", post(post_message))
        .with_state(state)
}

/// Serve the SSE transport on `127.0.0.1:<port>`. Failing to bind is the one
/// fatal error in the proxy; everything downstream is per-session.
pub async fn run_sse(handler: Arc<ProxyHandler>, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .context("creating listener socket")?;
    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;
    socket
        .set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(TCP_KEEPALIVE_TIME))
        .context("enabling TCP keepalive")?;
    socket
        .set_nonblocking(true)
        .context("marking listener non-blocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {addr}"))?;
    socket.listen(1024).context("listening")?;

    let listener = tokio::net::TcpListener::from_std(socket.into())
        .context("registering listener with the runtime")?;
    info!("SSE transport listening on http://{addr}/sse");

    axum::serve(listener, app(handler))
        .await
        .context("serving SSE transport")?;
    Ok(())
}

async fn open_sse(
    State(state): State<Arc<SseState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<JSONRPCMessage>(SESSION_QUEUE_CAPACITY);
    if let Ok(mut sessions) = state.sessions.lock() {
        sessions.insert(
            session_id.clone(),
            SseSession {
                tx,
                last_activity: Instant::now(),
            },
        );
    }
    info!(
        "SSE session {session_id} opened ({} active)",
        state.session_count()
    );

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={session_id}"));

    let guard = SessionGuard {
        state: state.clone(),
        session_id,
    };
    let messages = ReceiverStream::new(rx).map(move |message| {
        // The guard rides inside the closure: dropping the stream (client
        // disconnect) removes the session.
        let _keep_alive = &guard;
        let data = serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event("message").data(data))
    });

    let stream = futures::stream::once(async move { Ok(endpoint) }).chain(messages);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn post_message(
    State(state): State<Arc<SseState>>,
    Query(query): Query<MessageQuery>,
    Json(message): Json<JSONRPCMessage>,
) -> StatusCode {
    {
        let Ok(mut sessions) = state.sessions.lock() else {
            return StatusCode::INTERNAL_SERVER_ERROR;
        };
        let Some(session) = sessions.get_mut(&query.session_id) else {
            return StatusCode::NOT_FOUND;
        };
        session.last_activity = Instant::now();
    }

    let state = state.clone();
    let session_id = query.session_id;
    tokio::spawn(async move {
        let Some(response) = state.handler.handle_message(message).await else {
            return;
        };
        let tx = {
            let Ok(sessions) = state.sessions.lock() else {
                return;
            };
            sessions.get(&session_id).map(|s| s.tx.clone())
        };
        let Some(tx) = tx else {
            debug!("dropping response for closed session {session_id}");
            return;
        };
        match tx.try_send(response) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // A slow client must not block its peers.
                warn!("session {session_id} queue is full; closing it");
                state.remove_session(&session_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                state.remove_session(&session_id);
            }
        }
    });

    StatusCode::ACCEPTED
}

/// Close sessions idle beyond the configured threshold. An MCP host that is
/// merely quiet stays connected through keepalives; this only collects
/// sessions whose client went away without closing the socket.
fn spawn_session_reaper(state: Arc<SseState>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(REAPER_INTERVAL).await;
            let idle_after = state
                .handler
                .config()
                .settings
                .sse_idle_timeout_duration();
            let expired: Vec<String> = {
                let Ok(sessions) = state.sessions.lock() else {
                    continue;
                };
                sessions
                    .iter()
                    .filter(|(_, s)| s.last_activity.elapsed() > idle_after)
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for session_id in expired {
                info!("reaping idle SSE session {session_id}");
                state.remove_session(&session_id);
            }
        }
    });
}
