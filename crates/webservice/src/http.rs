use std::time::Instant;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use levseq_protocol::{ErrorBody, ResultSet, Scalar, ScalarResponse, Verb, params_from_json};
use serde::Deserialize;
use tracing::Instrument;
use ulid::Ulid;

use crate::config::WebserviceConfig;
use crate::db::{GatewayError, PgGateway};
use crate::stager::{FileStager, StagerError};

#[derive(Clone)]
pub struct AppState {
    pub config: WebserviceConfig,
    gateway: PgGateway,
    stager: FileStager,
}

type ApiError = (StatusCode, Json<ErrorBody>);

pub fn router(config: WebserviceConfig) -> Router {
    let gateway = PgGateway::new(config.pg_conninfo(), config.db_schema.clone());
    let stager = FileStager::new(config.upload_dir.clone());
    let state = AppState {
        config,
        gateway,
        stager,
    };

    Router::new()
        .route("/", get(pginfo).post(dispatch_query))
        .route("/metrics", get(metrics))
        .with_state(state)
}

// GET / doubles as the end-to-end health check: it exercises the full
// dispatcher-to-database path via get_pginfo.
async fn pginfo(State(state): State<AppState>) -> Result<Json<ResultSet>, ApiError> {
    let started = Instant::now();

    let verb = Verb::Get("pginfo".to_string());
    let result = state
        .gateway
        .fetch(&verb, &[Scalar::Int(state.config.ws_id)])
        .await
        .map_err(gateway_error_response);

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request("/", "GET", status.as_u16(), started.elapsed());

    result.map(Json)
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    verb: String,
    params: serde_json::Value,
}

async fn dispatch_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<RawEnvelope>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let Json(raw) = req.map_err(|_| {
            json_error(StatusCode::BAD_REQUEST, "invalid query envelope".to_string())
        })?;

        let verb = Verb::parse(&raw.verb)
            .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?;

        let params = params_from_json(&raw.params)
            .map_err(|err| json_error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()))?;

        let span = tracing::info_span!(
            "query.dispatch",
            request_id = %request_id,
            verb = %verb,
            params = params.len(),
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let prefix = verb.prefix();
        let dispatched = async {
            let started = Instant::now();
            let response = dispatch(&state, &verb, &params).await;

            let latency_ms = started.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency_ms);
            tracing::Span::current()
                .record("outcome", if response.is_ok() { "ok" } else { "error" });
            response
        }
        .instrument(span)
        .await;

        crate::metrics::observe_verb_dispatch(
            prefix,
            if dispatched.is_ok() { "ok" } else { "error" },
        );
        dispatched
    }
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request("/", "POST", status.as_u16(), started.elapsed());

    result.map(Json)
}

async fn dispatch(
    state: &AppState,
    verb: &Verb,
    params: &[Scalar],
) -> Result<serde_json::Value, ApiError> {
    match verb {
        Verb::Get(_) => {
            let table = state
                .gateway
                .fetch(verb, params)
                .await
                .map_err(gateway_error_response)?;
            table.validate().map_err(|message| {
                json_error(StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
            })?;
            encode(&table)
        }
        Verb::Do(_) | Verb::Save(_) => {
            state
                .gateway
                .non_query(verb, params)
                .await
                .map_err(gateway_error_response)?;
            Ok(serde_json::Value::Null)
        }
        Verb::Is(_) | Verb::Peek(_) => {
            let details = state
                .gateway
                .query_scalar(verb, params)
                .await
                .map_err(gateway_error_response)?;
            encode(&ScalarResponse { details })
        }
        // Blob operations carry text file specs and run against the staging
        // directory; load/unload verbs with id parameters name database-side
        // operations (e.g. unload_experiment(uid, eid)).
        Verb::Load(_) => {
            if params.len() == 2 && all_text(params) {
                let written = state
                    .stager
                    .load_from_params(params)
                    .map_err(stager_error_response)?;
                encode(&ScalarResponse {
                    details: Scalar::Int(written),
                })
            } else {
                let details = state
                    .gateway
                    .query_scalar(verb, params)
                    .await
                    .map_err(gateway_error_response)?;
                encode(&ScalarResponse { details })
            }
        }
        Verb::Unload(_) => {
            if params.len() == 1 && all_text(params) {
                state
                    .stager
                    .unload_from_params(params)
                    .map_err(stager_error_response)?;
            } else {
                state
                    .gateway
                    .non_query(verb, params)
                    .await
                    .map_err(gateway_error_response)?;
            }
            Ok(serde_json::Value::Null)
        }
    }
}

fn all_text(params: &[Scalar]) -> bool {
    params.iter().all(|p| matches!(p, Scalar::Text(_)))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|_| {
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to serialize response".to_string(),
        )
    })
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn json_error(status: StatusCode, detail: String) -> ApiError {
    (status, Json(ErrorBody { detail }))
}

fn gateway_error_response(err: GatewayError) -> ApiError {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn stager_error_response(err: StagerError) -> ApiError {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-levseq-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    if out.is_empty() { None } else { Some(out) }
}
