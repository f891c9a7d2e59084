//! HTTP server that shuts itself down after a period without active
//! connections.
//!
//! # Responsibilities
//! - Track per-connection state (new, active, idle, hijacked, closed)
//! - Arm an idle timer whenever the active set becomes empty
//! - Graceful shutdown on idle timeout or external cancellation
//!
//! # Design Decisions
//! - A connection counts as active while new, serving a request, or
//!   upgraded; keep-alive connections between requests are idle
//! - Every change of the active count is published on a watch channel, so
//!   even a brief connection restarts the idle timer

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::http::{Request, Response, StatusCode};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tower::Service;

use crate::http::activation::{Accepted, Listener};
use crate::runtime::ShutdownSignal;

/// Global counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for idle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Active,
    Idle,
    Hijacked,
    Closed,
}

impl ConnState {
    fn is_active(self) -> bool {
        matches!(self, ConnState::New | ConnState::Active | ConnState::Hijacked)
    }
}

/// Snapshot published on every change of the active count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    pub active: usize,
    pub epoch: u64,
}

#[derive(Debug)]
struct Entry {
    state: ConnState,
    in_flight: usize,
}

/// Tracks connection states and publishes the active count.
#[derive(Debug, Clone)]
pub struct IdleTracker {
    conns: Arc<Mutex<HashMap<ConnectionId, Entry>>>,
    tx: Arc<watch::Sender<Activity>>,
}

impl IdleTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Activity::default());
        Self {
            conns: Arc::new(Mutex::new(HashMap::new())),
            tx: Arc::new(tx),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Activity> {
        self.tx.subscribe()
    }

    pub fn active(&self) -> usize {
        self.tx.borrow().active
    }

    /// Record a state transition of `id`.
    pub fn set_state(&self, id: ConnectionId, state: ConnState) {
        self.update(id, |entry| entry.state = state);
    }

    fn begin_request(&self, id: ConnectionId) {
        self.update(id, |entry| {
            entry.in_flight += 1;
            entry.state = ConnState::Active;
        });
    }

    fn end_request(&self, id: ConnectionId, upgraded: bool) {
        self.update(id, |entry| {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            if upgraded {
                entry.state = ConnState::Hijacked;
            } else if entry.in_flight == 0 && entry.state == ConnState::Active {
                entry.state = ConnState::Idle;
            }
        });
    }

    fn update(&self, id: ConnectionId, f: impl FnOnce(&mut Entry)) {
        let active = {
            let mut conns = match self.conns.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = conns.entry(id).or_insert(Entry {
                state: ConnState::New,
                in_flight: 0,
            });
            f(entry);
            tracing::trace!(connection_id = %id, state = ?entry.state, "Connection state");
            if entry.state == ConnState::Closed {
                conns.remove(&id);
            }
            conns.values().filter(|e| e.state.is_active()).count()
        };
        self.tx.send_if_modified(|activity| {
            if activity.active == active {
                return false;
            }
            activity.active = active;
            activity.epoch += 1;
            true
        });
    }

    /// Completes once no connection has been active for `idle_after`.
    pub async fn wait_idle(&self, idle_after: Duration) {
        let mut rx = self.subscribe();
        loop {
            let active = rx.borrow_and_update().active;
            if active > 0 {
                if rx.changed().await.is_err() {
                    return;
                }
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(idle_after) => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl Default for IdleTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Why [`IdleServer::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Idle,
    Cancelled,
}

/// HTTP server over an axum router with optional idle shutdown.
pub struct IdleServer {
    idle_after: Option<Duration>,
    drain_timeout: Duration,
    tracker: IdleTracker,
}

impl IdleServer {
    pub fn new(idle_after: Option<Duration>) -> Self {
        Self {
            idle_after,
            drain_timeout: Duration::from_secs(10),
            tracker: IdleTracker::new(),
        }
    }

    pub fn tracker(&self) -> &IdleTracker {
        &self.tracker
    }

    /// Serve until idle or cancelled, then drain open connections.
    pub async fn serve(
        self,
        listener: Listener,
        router: Router,
        mut shutdown: ShutdownSignal,
    ) -> std::io::Result<StopReason> {
        tracing::info!(
            address = %listener.describe(),
            idle_after = ?self.idle_after,
            "HTTP server starting"
        );

        let builder = Builder::new(TokioExecutor::new());
        let graceful = GracefulShutdown::new();
        let tracker = self.tracker.clone();
        let idle = async {
            match self.idle_after {
                Some(after) => tracker.wait_idle(after).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(idle);

        let reason = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok(Accepted::Tcp(stream)) => {
                            self.spawn_connection(&builder, &graceful, stream, router.clone());
                        }
                        Ok(Accepted::Unix(stream)) => {
                            self.spawn_connection(&builder, &graceful, stream, router.clone());
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
                _ = &mut idle => {
                    tracing::info!("No active connections, shutting down");
                    break StopReason::Idle;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown requested");
                    break StopReason::Cancelled;
                }
            }
        };

        drop(listener);
        tokio::select! {
            _ = graceful.shutdown() => {}
            _ = tokio::time::sleep(self.drain_timeout) => {
                tracing::warn!("Timed out draining connections");
            }
        }
        tracing::info!("HTTP server stopped");
        Ok(reason)
    }

    fn spawn_connection<S>(
        &self,
        builder: &Builder<TokioExecutor>,
        graceful: &GracefulShutdown,
        stream: S,
        router: Router,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnectionId::new();
        self.tracker.set_state(id, ConnState::New);

        let service = TowerToHyperService::new(Tracked {
            inner: router,
            tracker: self.tracker.clone(),
            id,
        });
        let conn = builder
            .serve_connection_with_upgrades(TokioIo::new(stream), service)
            .into_owned();
        let conn = graceful.watch(conn);
        let tracker = self.tracker.clone();

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(connection_id = %id, error = %e, "Connection error");
            }
            tracker.set_state(id, ConnState::Closed);
        });
    }
}

/// Marks its connection active for the duration of each request.
#[derive(Clone)]
struct Tracked<S> {
    inner: S,
    tracker: IdleTracker,
    id: ConnectionId,
}

impl<S, B, R> Service<Request<B>> for Tracked<S>
where
    S: Service<Request<B>, Response = Response<R>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<R>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<R>, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        self.tracker.begin_request(self.id);
        let tracker = self.tracker.clone();
        let id = self.id;
        let fut = self.inner.call(request);
        Box::pin(async move {
            let result = fut.await;
            let upgraded = matches!(&result, Ok(r) if r.status() == StatusCode::SWITCHING_PROTOCOLS);
            tracker.end_request(id, upgraded);
            result
        })
    }
}
