//! End-to-end tests against an in-process JSON endpoint.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;

use json2prom_common::ConfigFormat;
use json2prom_exporter::config::SeriesConfig;
use json2prom_exporter::error::FailureReason;
use json2prom_exporter::registry::Sample;
use json2prom_exporter::{
    CycleError, ExporterConfig, FetchError, HttpServer, SeriesKey, SeriesRegistry, SharedRegistry,
    Supervisor, TargetErrorPolicy, TargetPoller,
};

#[derive(Debug, Clone)]
struct RecordedRequest {
    method: Method,
    headers: HeaderMap,
    body: String,
}

/// A JSON endpoint whose response can be changed between polls.
#[derive(Clone)]
struct MockEndpoint {
    response: Arc<Mutex<(StatusCode, String)>>,
    delay: Arc<Mutex<Option<Duration>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockEndpoint {
    fn new(body: &str) -> Self {
        Self {
            response: Arc::new(Mutex::new((StatusCode::OK, body.to_string()))),
            delay: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn respond(&self, status: StatusCode, body: &str) {
        *self.response.lock() = (status, body.to_string());
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    async fn start(&self) -> SocketAddr {
        let app = Router::new()
            .route("/data", any(mock_handler))
            .with_state(self.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

async fn mock_handler(
    State(endpoint): State<MockEndpoint>,
    method: Method,
    headers: HeaderMap,
    body: String,
) -> Response {
    endpoint.requests.lock().push(RecordedRequest {
        method,
        headers,
        body,
    });

    let delay = *endpoint.delay.lock();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let (status, body) = endpoint.response.lock().clone();
    (status, [("content-type", "application/json")], body).into_response()
}

fn registry() -> SharedRegistry {
    Arc::new(SeriesRegistry::new("json2prom", SeriesConfig::default()))
}

fn load_yaml(yaml: &str) -> ExporterConfig {
    ExporterConfig::parse_as(yaml, ConfigFormat::Yaml).unwrap()
}

fn users_config(addr: SocketAddr) -> ExporterConfig {
    load_yaml(&format!(
        r#"
targets:
  - name: api
    uri: http://{addr}/data
    periodSeconds: 60
    metrics:
      - name: user_score
        itemsQuery: users[*]
        valueQuery: score
        labels:
          - name: user
            query: name
"#
    ))
}

fn poller_for(config: &ExporterConfig, registry: &SharedRegistry) -> TargetPoller {
    TargetPoller::new(&config.targets[0], reqwest::Client::new(), None, registry.clone()).unwrap()
}

fn user_series(user: &str) -> SeriesKey {
    SeriesKey::new("user_score", [("target", "api"), ("user", user)])
}

fn values(snapshot: &[Sample]) -> Vec<(SeriesKey, f64)> {
    snapshot.iter().map(|s| (s.key.clone(), s.value)).collect()
}

#[tokio::test]
async fn test_items_become_series_and_vanished_items_retire() {
    let endpoint = MockEndpoint::new(
        r#"{"users":[{"name":"alice","score":5},{"name":"bob","score":3}]}"#,
    );
    let addr = endpoint.start().await;
    let registry = registry();
    let poller = poller_for(&users_config(addr), &registry);

    poller.poll_once().await.unwrap();
    assert_eq!(
        values(&registry.snapshot()),
        vec![(user_series("alice"), 5.0), (user_series("bob"), 3.0)]
    );

    endpoint.respond(StatusCode::OK, r#"{"users":[{"name":"alice","score":5}]}"#);
    let summary = poller.poll_once().await.unwrap();

    assert_eq!(summary.retired, 1);
    assert_eq!(
        values(&registry.snapshot()),
        vec![(user_series("alice"), 5.0)]
    );
    assert!(!registry.render().contains("user=\"bob\""));
}

#[tokio::test]
async fn test_single_object_without_items_query() {
    let endpoint = MockEndpoint::new(r#"{"status":"ok","count":7}"#);
    let addr = endpoint.start().await;
    let config = load_yaml(&format!(
        r#"
targets:
  - name: status
    uri: http://{addr}/data
    periodSeconds: 30
    metrics:
      - name: item_count
        valueQuery: count
"#
    ));
    let registry = registry();
    let poller = poller_for(&config, &registry);

    poller.poll_once().await.unwrap();

    assert_eq!(
        values(&registry.snapshot()),
        vec![(SeriesKey::new("item_count", [("target", "status")]), 7.0)]
    );
    assert!(registry.render().contains("item_count{target=\"status\"} 7\n"));
}

#[tokio::test]
async fn test_non_numeric_item_is_skipped() {
    let endpoint = MockEndpoint::new(
        r#"{"users":[{"name":"alice","score":5},{"name":"bob","score":"n/a"},{"name":"carol","score":"2.5"}]}"#,
    );
    let addr = endpoint.start().await;
    let registry = registry();
    let poller = poller_for(&users_config(addr), &registry);

    let summary = poller.poll_once().await.unwrap();

    assert_eq!(summary.published, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(
        values(&registry.snapshot()),
        vec![(user_series("alice"), 5.0), (user_series("carol"), 2.5)]
    );
    assert_eq!(registry.poll_stats("api").unwrap().items_skipped, 1);
}

#[tokio::test]
async fn test_failed_cycles_leave_snapshot_unchanged() {
    let endpoint = MockEndpoint::new(
        r#"{"users":[{"name":"alice","score":5},{"name":"bob","score":3}]}"#,
    );
    let addr = endpoint.start().await;
    let registry = registry();
    let poller = poller_for(&users_config(addr), &registry);

    poller.poll_once().await.unwrap();
    let before = registry.snapshot();

    endpoint.respond(StatusCode::INTERNAL_SERVER_ERROR, r#"{"users":[]}"#);
    let err = poller.poll_once().await.unwrap_err();
    match err {
        CycleError::Fetch(FetchError::Status { status, .. }) => {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR)
        }
        other => panic!("expected a status error, got {:?}", other),
    }
    assert_eq!(registry.snapshot(), before);

    endpoint.respond(StatusCode::OK, "{not json");
    let err = poller.poll_once().await.unwrap_err();
    assert_eq!(err.reason(), FailureReason::Parse);
    assert_eq!(registry.snapshot(), before);

    let stats = registry.poll_stats("api").unwrap();
    assert_eq!(stats.cycles_succeeded, 1);
    assert_eq!(stats.fetch_failures, 1);
    assert_eq!(stats.parse_failures, 1);
}

#[tokio::test]
async fn test_label_change_creates_new_series() {
    let endpoint = MockEndpoint::new(r#"{"users":[{"name":"alice","score":5}]}"#);
    let addr = endpoint.start().await;
    let registry = registry();
    let poller = poller_for(&users_config(addr), &registry);

    poller.poll_once().await.unwrap();
    endpoint.respond(StatusCode::OK, r#"{"users":[{"name":"alicia","score":5}]}"#);
    poller.poll_once().await.unwrap();

    assert_eq!(
        values(&registry.snapshot()),
        vec![(user_series("alicia"), 5.0)]
    );
}

#[tokio::test]
async fn test_request_carries_method_headers_form_and_auth() {
    let endpoint = MockEndpoint::new(r#"{"data":{"pets":[{"kind":"cat","n":2}]}}"#);
    let addr = endpoint.start().await;
    let config = load_yaml(&format!(
        r#"
targets:
  - name: pets
    uri: http://{addr}/data
    method: POST
    includeAuthHeader: true
    headers:
      X-Api-Version: "2"
    formParams:
      query: pets
      limit: "10"
    periodSeconds: 15
    metrics:
      - name: pet_count
        itemsQuery: .data.pets[]
        valueQuery: .n
        labels:
          - name: kind
            query: .kind
"#
    ));
    let registry = registry();
    let poller = TargetPoller::new(
        &config.targets[0],
        reqwest::Client::new(),
        Some("Bearer s3cret"),
        registry.clone(),
    )
    .unwrap();

    poller.poll_once().await.unwrap();

    let requests = endpoint.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.headers.get("authorization").unwrap(), "Bearer s3cret");
    assert_eq!(request.headers.get("x-api-version").unwrap(), "2");
    assert_eq!(
        request.headers.get("content-type").unwrap(),
        "application/x-www-form-urlencoded"
    );
    assert_eq!(request.body, "limit=10&query=pets");

    assert_eq!(
        values(&registry.snapshot()),
        vec![(SeriesKey::new("pet_count", [("kind", "cat"), ("target", "pets")]), 2.0)]
    );
}

#[tokio::test]
async fn test_shutdown_interrupts_inflight_request() {
    let endpoint = MockEndpoint::new(r#"{"users":[]}"#);
    endpoint.set_delay(Duration::from_secs(30));
    let addr = endpoint.start().await;
    let registry = registry();
    let poller = poller_for(&users_config(addr), &registry);

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(poller.run(rx));

    // Wait until the first request is in flight.
    for _ in 0..100 {
        if !endpoint.requests().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(endpoint.requests().len(), 1);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("poller did not stop promptly")
        .unwrap();

    assert_eq!(registry.series_count(), 0);
    assert_eq!(registry.poll_stats("api").unwrap().cycles_succeeded, 0);
}

#[tokio::test]
async fn test_bad_target_does_not_stop_others() {
    let endpoint = MockEndpoint::new(r#"{"users":[{"name":"alice","score":5}]}"#);
    let addr = endpoint.start().await;
    let config = load_yaml(&format!(
        r#"
targets:
  - name: broken
    uri: "not a uri"
    periodSeconds: 60
    metrics:
      - name: broken_metric
        valueQuery: .v
  - name: api
    uri: http://{addr}/data
    periodSeconds: 60
    metrics:
      - name: user_score
        itemsQuery: .users[*]
        valueQuery: .score
        labels:
          - name: user
            query: .name
"#
    ));
    let registry = registry();

    let mut supervisor = Supervisor::new(registry.clone(), None, TargetErrorPolicy::Skip).unwrap();
    assert_eq!(supervisor.start(&config.targets).unwrap(), 1);
    assert_eq!(supervisor.failed()[0].target(), "broken");

    for _ in 0..200 {
        if registry.has_successful_poll() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(values(&registry.snapshot()), vec![(user_series("alice"), 5.0)]);

    assert!(supervisor.shutdown(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_abort_policy_rejects_bad_target() {
    let config = load_yaml(
        r#"
targetErrors: abort
targets:
  - name: needs-auth
    uri: http://127.0.0.1:9/data
    includeAuthHeader: true
    periodSeconds: 60
    metrics:
      - name: m
        valueQuery: .v
"#,
    );

    let mut supervisor = Supervisor::new(registry(), None, config.target_errors).unwrap();
    let err = supervisor.start(&config.targets).unwrap_err();

    assert!(err.to_string().contains("needs-auth"));
    assert_eq!(supervisor.running(), 0);
}

#[tokio::test]
async fn test_scrape_metrics_endpoint() {
    let endpoint = MockEndpoint::new(
        r#"{"users":[{"name":"alice","score":5},{"name":"bob","score":3.5}]}"#,
    );
    let addr = endpoint.start().await;

    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(
        file,
        r#"
prometheus:
  listen: "127.0.0.1:0"
  path: /prom
logging:
  level: debug
targets:
  - name: api
    uri: http://{addr}/data
    periodSeconds: 1
    metrics:
      - name: user_score
        itemsQuery: .users[]
        valueQuery: .score
        labels:
          - name: user
            query: .name
"#
    )
    .unwrap();

    let config = ExporterConfig::load_from_file(file.path()).unwrap();
    let registry = Arc::new(SeriesRegistry::new(
        config.prometheus.self_metrics_prefix.clone(),
        config.series.clone(),
    ));

    let mut supervisor =
        Supervisor::new(registry.clone(), None, config.target_errors).unwrap();
    supervisor.start(&config.targets).unwrap();

    let server = HttpServer::new(
        registry.clone(),
        config.prometheus.listen.parse().unwrap(),
        config.prometheus.path.clone(),
    )
    .bind()
    .await
    .unwrap();
    let base = format!("http://{}", server.local_addr());
    let server_task = tokio::spawn(server.serve(supervisor.subscribe()));

    let client = reqwest::Client::new();
    let mut ready = false;
    for _ in 0..200 {
        let status = client
            .get(format!("{}/ready", base))
            .send()
            .await
            .unwrap()
            .status();
        if status == reqwest::StatusCode::OK {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ready, "exporter never became ready");

    let response = client.get(format!("{}/prom", base)).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();

    assert!(body.contains("# TYPE user_score gauge\n"));
    assert!(body.contains("user_score{target=\"api\",user=\"alice\"} 5\n"));
    assert!(body.contains("user_score{target=\"api\",user=\"bob\"} 3.5\n"));
    assert!(body.contains("json2prom_series 2\n"));
    assert!(body.contains("json2prom_poll_success_total{target=\"api\"}"));
    drop(client);

    assert!(supervisor.shutdown(Duration::from_secs(5)).await);
    tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
