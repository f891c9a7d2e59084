//! Authorization sidecar and idle shutdown over real sockets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::routing::get;
use axum::Router;
use reqwest::StatusCode;

use conductor::http::{IdleServer, Listener, StopReason};
use conductor::policy::server::{router, SidecarState, AUTHORIZATION_HEADER, POLICY_HEADER};
use conductor::policy::types::{Policy, PolicySet};
use conductor::runtime::Shutdown;

fn policies(docs: &[&str]) -> PolicySet {
    docs.iter()
        .map(|d| {
            let p: Policy = serde_yaml::from_str(d).unwrap();
            (p.name.clone(), p)
        })
        .collect()
}

async fn bind_local() -> (Listener, String) {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let addr = match &listener {
        Listener::Tcp(l) => l.local_addr().unwrap(),
        Listener::Unix(..) => unreachable!(),
    };
    (listener, format!("http://{addr}"))
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

struct Sidecar {
    url: String,
    policies: Arc<ArcSwap<PolicySet>>,
    shutdown: Shutdown,
}

impl Sidecar {
    async fn start(docs: &[&str]) -> Self {
        let policies = Arc::new(ArcSwap::from_pointee(policies(docs)));
        let (listener, url) = bind_local().await;
        let shutdown = Shutdown::new();
        let app = router(SidecarState {
            policies: policies.clone(),
        });
        let signal = shutdown.subscribe();
        tokio::spawn(async move { IdleServer::new(None).serve(listener, app, signal).await });
        Self {
            url,
            policies,
            shutdown,
        }
    }

    async fn check(&self, policy: &str, authorization: &str) -> reqwest::Response {
        client()
            .post(format!("{}/", self.url))
            .header(POLICY_HEADER, policy)
            .header("authorization", authorization)
            .send()
            .await
            .unwrap()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

const P1: &str = "name: p1\nany:\n  - bearer: [{token: T}]\n";

#[tokio::test]
async fn wrong_bearer_is_denied() {
    let sidecar = Sidecar::start(&[P1]).await;
    let resp = sidecar.check("p1/read", "Bearer U").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn right_bearer_is_allowed_and_reported() {
    let sidecar = Sidecar::start(&[P1]).await;
    let resp = sidecar.check("p1/read", "Bearer T").await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(resp.headers()[AUTHORIZATION_HEADER], "p1/read");
}

#[tokio::test]
async fn empty_authorization_is_denied() {
    let sidecar = Sidecar::start(&[P1]).await;
    let resp = sidecar.check("p1", "Bearer T").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn swapped_policies_apply_to_next_request() {
    let sidecar = Sidecar::start(&[P1]).await;
    assert_eq!(sidecar.check("p1/read", "Bearer U").await.status(), StatusCode::UNAUTHORIZED);

    sidecar
        .policies
        .store(Arc::new(policies(&["name: p1\nbearer: [{token: U}]\n"])));
    assert_eq!(sidecar.check("p1/read", "Bearer U").await.status(), StatusCode::NO_CONTENT);
}

fn hello() -> Router {
    Router::new().route("/", get(|| async { "hello" }))
}

#[tokio::test]
async fn idle_server_exits_after_quiet_period() {
    let (listener, _) = bind_local().await;
    let shutdown = Shutdown::new();
    let idle_after = Duration::from_millis(500);

    let started = Instant::now();
    let reason = IdleServer::new(Some(idle_after))
        .serve(listener, hello(), shutdown.subscribe())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(reason, StopReason::Idle);
    assert!(elapsed >= idle_after, "{elapsed:?}");
    assert!(elapsed < idle_after + Duration::from_millis(500), "{elapsed:?}");
}

#[tokio::test]
async fn request_restarts_idle_timer() {
    let (listener, url) = bind_local().await;
    let shutdown = Shutdown::new();
    let idle_after = Duration::from_millis(500);

    let started = Instant::now();
    let server = tokio::spawn(
        IdleServer::new(Some(idle_after)).serve(listener, hello(), shutdown.subscribe()),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    let sent = started.elapsed();
    let body = client().get(&url).send().await.unwrap().text().await.unwrap();
    assert_eq!(body, "hello");

    let reason = server.await.unwrap().unwrap();
    let elapsed = started.elapsed();
    assert_eq!(reason, StopReason::Idle);
    assert!(elapsed >= sent + idle_after, "{sent:?} {elapsed:?}");
}

#[tokio::test]
async fn cancellation_stops_server_immediately() {
    let (listener, _) = bind_local().await;
    let shutdown = Shutdown::new();
    let server = tokio::spawn(
        IdleServer::new(Some(Duration::from_secs(60))).serve(listener, hello(), shutdown.subscribe()),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.trigger();
    let reason = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, StopReason::Cancelled);
}
