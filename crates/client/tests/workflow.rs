use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use levseq_client::query::{QueryClient, QueryError, QueryReply};
use levseq_client::session::SessionService;
use levseq_protocol::{Scalar, Verb};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Clone)]
struct StubState {
    experiments: Arc<Mutex<Vec<(i64, String)>>>,
}

async fn stub_dispatch(
    State(state): State<StubState>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    let verb = body
        .get("verb")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let params = body
        .get("params")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    match verb.as_str() {
        "save_user_ip" => (StatusCode::OK, Json(serde_json::Value::Null)),
        "get_user_info" => (
            StatusCode::OK,
            Json(serde_json::json!({
                "columns": ["uid", "username", "groupname", "last_ip"],
                "rows": [[1, "alice", "chem", "10.0.0.2"]],
            })),
        ),
        "get_user_experiments" => {
            let rows = state
                .experiments
                .lock()
                .expect("experiments lock")
                .iter()
                .map(|(eid, name)| serde_json::json!([eid, name]))
                .collect::<Vec<_>>();
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "columns": ["eid", "experiment_name"],
                    "rows": rows,
                })),
            )
        }
        "unload_experiment" => {
            let eid = params.get(1).and_then(|v| v.as_i64()).unwrap_or(-1);
            state
                .experiments
                .lock()
                .expect("experiments lock")
                .retain(|(listed, _)| *listed != eid);
            (StatusCode::OK, Json(serde_json::Value::Null))
        }
        "load_file" => {
            let payload = params
                .get(1)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            match BASE64_STANDARD.decode(payload) {
                Ok(bytes) => (
                    StatusCode::OK,
                    Json(serde_json::json!({"details": bytes.len()})),
                ),
                Err(err) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "detail": format!("file payload is not valid base64: {}", err),
                    })),
                ),
            }
        }
        "get_file_load_status" => (
            StatusCode::OK,
            Json(serde_json::json!({
                "columns": ["status"],
                "rows": [["completed"]],
            })),
        ),
        "get_boom" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"detail": "synthetic failure"})),
        ),
        other => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"detail": format!("invalid query '{}'", other)})),
        ),
    }
}

async fn spawn_stub(
    experiments: Vec<(i64, String)>,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let state = StubState {
        experiments: Arc::new(Mutex::new(experiments)),
    };
    let app = Router::new()
        .route("/", post(stub_dispatch))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

fn service_for(addr: SocketAddr) -> SessionService {
    let client = QueryClient::new(format!("http://{}", addr), Duration::from_secs(5))
        .expect("query client should build");
    SessionService::new(client)
}

fn seed_experiments() -> Vec<(i64, String)> {
    vec![
        (17, "lib-prep-A".to_string()),
        (18, "lib-prep-B".to_string()),
    ]
}

#[tokio::test]
async fn select_user_populates_session_and_clears_selection() {
    let (addr, shutdown, task) = spawn_stub(seed_experiments()).await;
    let service = service_for(addr);

    service
        .select_user("cookie-1", 1, "10.0.0.2")
        .await
        .expect("select_user should succeed");

    let session = service.session("cookie-1");
    assert_eq!(session.uid, Some(1));
    assert_eq!(session.uname.as_deref(), Some("alice"));
    assert_eq!(session.groupname.as_deref(), Some("chem"));
    assert_eq!(session.elist, seed_experiments());
    assert_eq!(session.iexpt, None);
    assert_eq!(session.eid, None);
    assert_eq!(session.experiment_name, None);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn unload_removes_the_selected_experiment() {
    let (addr, shutdown, task) = spawn_stub(seed_experiments()).await;
    let service = service_for(addr);

    service
        .select_user("cookie-1", 1, "10.0.0.2")
        .await
        .expect("select_user should succeed");
    service
        .select_experiment("cookie-1", 0)
        .expect("select_experiment should succeed");
    service
        .unload_selected("cookie-1")
        .await
        .expect("unload should succeed");

    let session = service.session("cookie-1");
    assert_eq!(session.elist, vec![(18, "lib-prep-B".to_string())]);
    assert!(!session.elist.iter().any(|(eid, _)| *eid == 17));
    assert_eq!(session.iexpt, None);
    assert_eq!(session.eid, None);
    assert_eq!(session.experiment_name, None);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn select_experiment_is_bounds_checked() {
    let (addr, shutdown, task) = spawn_stub(seed_experiments()).await;
    let service = service_for(addr);

    service
        .select_user("cookie-1", 1, "10.0.0.2")
        .await
        .expect("select_user should succeed");

    let err = service
        .select_experiment("cookie-1", 5)
        .expect_err("out-of-range index must fail");
    assert_eq!(err.to_string(), "experiment index 5 is out of range (2 listed)");

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn unload_without_selection_fails_locally() {
    let (addr, shutdown, task) = spawn_stub(seed_experiments()).await;
    let service = service_for(addr);

    service
        .select_user("cookie-1", 1, "10.0.0.2")
        .await
        .expect("select_user should succeed");

    let err = service
        .unload_selected("cookie-1")
        .await
        .expect_err("unload without selection must fail");
    assert_eq!(err.to_string(), "no experiment selected");

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn upload_reports_byte_count_and_status() {
    let (addr, shutdown, task) = spawn_stub(Vec::new()).await;
    let service = service_for(addr);

    let written = service
        .upload_file("run42/reads.fastq", b"ACGTACGT")
        .await
        .expect("upload should succeed");
    assert_eq!(written, 8);

    let status = service
        .file_load_status("run42/reads.fastq")
        .await
        .expect("status should succeed");
    assert_eq!(status, "completed");

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn service_errors_carry_status_reason_and_detail() {
    let (addr, shutdown, task) = spawn_stub(Vec::new()).await;
    let client = QueryClient::new(format!("http://{}", addr), Duration::from_secs(5))
        .expect("query client should build");

    let err = client
        .fetch(Verb::Get("boom".to_string()), Vec::new())
        .await
        .expect_err("stub returns 500");
    assert_eq!(
        err.to_string(),
        "LevSeq webservice response: 500 Internal Server Error: \nsynthetic failure"
    );

    let reply = client
        .call(
            Verb::Save("user_ip".to_string()),
            vec![Scalar::Int(1), Scalar::Text("10.0.0.2".to_string())],
        )
        .await
        .expect("save should succeed");
    assert_eq!(reply, QueryReply::Done);

    match client.fetch(Verb::Get("nope".to_string()), Vec::new()).await {
        Err(QueryError::Service { status, .. }) => assert_eq!(status, 400),
        other => panic!("expected a service error, got {:?}", other),
    }

    let _ = shutdown.send(());
    let _ = task.await;
}
