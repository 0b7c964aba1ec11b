//! Engine API handlers
//!
//! Parameters are validated before anything is allocated. Operations then run
//! in a spawned task so that a client disconnect cannot drop their cleanup;
//! the task is cancelled through a token when the response goes away or the
//! execution ceiling elapses.

use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::Stream;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tugboat_build::{BufferSink, StreamEncoder};
use tugboat_core::{
    OperationKind, OperationSpec, ParamError, Params, REGISTRY_AUTH_HEADER,
    REGISTRY_CONFIG_HEADER, help_text, parse_build, parse_inspect, parse_pull, parse_tag,
};

/// Engine API version advertised to clients
pub const API_VERSION: &str = "1.41";

const MIN_API_VERSION: &str = "1.24";

const STREAM_BUFFER: usize = 64;

type QueryPairs = Query<Vec<(String, String)>>;

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bad_request(kind: OperationKind, err: &ParamError) -> Response {
    tracing::info!("Rejected {} request: {}", kind, err);
    (StatusCode::BAD_REQUEST, help_text(kind, err)).into_response()
}

/// Run `operation` in its own task, cancelling it once `ceiling` elapses
fn spawn_operation<F>(
    ceiling: Duration,
    cancel: CancellationToken,
    operation: F,
) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(async move {
        let timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ceiling).await;
                tracing::warn!("Execution ceiling of {:?} reached, cancelling", ceiling);
                cancel.cancel();
            })
        };
        let output = operation.await;
        timer.abort();
        output
    })
}

/// Terminal error for an operation stopped by the execution ceiling
fn ceiling_message(operation: &str, ceiling: Duration) -> String {
    format!(
        "execute {}: execution exceeded the {}s limit",
        operation,
        ceiling.as_secs_f64()
    )
}

/// Response body fed by an operation task; dropping it cancels the task
struct OperationBody {
    rx: ReceiverStream<Bytes>,
    _guard: DropGuard,
}

impl Stream for OperationBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx).map(|chunk| chunk.map(Ok))
    }
}

fn streaming_response(rx: mpsc::Receiver<Bytes>, cancel: &CancellationToken) -> Response {
    let body = OperationBody {
        rx: ReceiverStream::new(rx),
        _guard: cancel.clone().drop_guard(),
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(body),
    )
        .into_response()
}

/// `GET|HEAD /_ping`
pub async fn ping() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::HeaderName::from_static("api-version"), API_VERSION),
        ],
        "OK",
    )
}

/// `GET /version`
pub async fn version() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "Version": env!("CARGO_PKG_VERSION"),
        "ApiVersion": API_VERSION,
        "MinAPIVersion": MIN_API_VERSION,
        "Os": std::env::consts::OS,
        "Arch": std::env::consts::ARCH,
        "Components": [{
            "Name": "tugboat",
            "Version": env!("CARGO_PKG_VERSION"),
        }],
    }))
}

/// `POST /build`
///
/// Streams `{"stream":…}` lines and ends with exactly one `aux` or error line.
pub async fn build(
    State(state): State<AppState>,
    Query(pairs): QueryPairs,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let params = Params::new(pairs);
    let spec = match parse_build(&params, header_value(&headers, REGISTRY_CONFIG_HEADER)) {
        Ok(spec) => spec,
        Err(e) => return bad_request(OperationKind::Build, &e),
    };

    let context = match axum::body::to_bytes(body, state.limits.max_body_size).await {
        Ok(context) => context,
        Err(e) => {
            tracing::warn!("Failed to read build context: {}", e);
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!(
                    "read build context: {} (limit {} bytes)\n",
                    e, state.limits.max_body_size
                ),
            )
                .into_response();
        }
    };
    tracing::debug!("Received build context of {} bytes", context.len());

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let cancel = CancellationToken::new();
    let op = OperationSpec::Build(spec);
    let executor = state.executor.clone();
    let token = cancel.clone();

    let ceiling = state.limits.execution_timeout;
    spawn_operation(ceiling, cancel.clone(), async move {
        let mut encoder = StreamEncoder::capturing(tx);
        let outcome = match executor.run(&op, Some(context), &mut encoder, token).await {
            Ok(report) => encoder.finish_build(report.image_digest).await.map(|_| ()),
            Err(e) if e.is_cancelled() && encoder.is_closed() => {
                tracing::info!("Build {} cancelled", op.describe());
                return;
            }
            Err(e) if e.is_cancelled() => encoder.fail(ceiling_message("build", ceiling)).await,
            Err(e) => encoder.fail(format!("execute build: {}", e)).await,
        };
        if let Err(e) = outcome {
            tracing::debug!("Build stream ended early: {}", e);
        }
    });

    streaming_response(rx, &cancel)
}

/// `POST /images/create`
///
/// Success is implicit at the end of the stream; failures end it with an error line.
pub async fn pull(
    State(state): State<AppState>,
    Query(pairs): QueryPairs,
    headers: HeaderMap,
) -> Response {
    let params = Params::new(pairs);
    let spec = match parse_pull(
        &params,
        header_value(&headers, REGISTRY_AUTH_HEADER),
        &state.registry,
    ) {
        Ok(spec) => spec,
        Err(e) => return bad_request(OperationKind::Pull, &e),
    };

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let cancel = CancellationToken::new();
    let op = OperationSpec::Pull(spec);
    let executor = state.executor.clone();
    let token = cancel.clone();

    let ceiling = state.limits.execution_timeout;
    spawn_operation(ceiling, cancel.clone(), async move {
        let mut encoder = StreamEncoder::new(tx);
        let outcome = match executor.run(&op, None, &mut encoder, token).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_cancelled() && encoder.is_closed() => {
                tracing::info!("Pull {} cancelled", op.describe());
                return;
            }
            Err(e) if e.is_cancelled() => encoder.fail(ceiling_message("pull", ceiling)).await,
            Err(e) => encoder.fail(format!("execute pull: {}", e)).await,
        };
        if let Err(e) = outcome {
            tracing::debug!("Pull stream ended early: {}", e);
        }
    });

    streaming_response(rx, &cancel)
}

/// Run a non-streaming operation to completion and collect its raw output
async fn run_buffered(state: &AppState, op: OperationSpec) -> (Bytes, Result<(), String>) {
    let cancel = CancellationToken::new();
    // Disarmed once the task finishes; firing means the client went away
    let guard = cancel.clone().drop_guard();
    let executor = state.executor.clone();
    let token = cancel.clone();

    let handle = spawn_operation(state.limits.execution_timeout, cancel, async move {
        let mut sink = BufferSink::new();
        let result = executor.run(&op, None, &mut sink, token).await;
        (sink.into_bytes(), result.map(|_| ()).map_err(|e| e.to_string()))
    });

    let joined = handle.await;
    guard.disarm();
    match joined {
        Ok(output) => output,
        Err(e) => (Bytes::new(), Err(format!("operation task failed: {}", e))),
    }
}

/// Image routes keyed by suffix: `/images/{name}/tag` and `/images/{name}/json`
pub async fn image(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    Query(pairs): QueryPairs,
    method: axum::http::Method,
) -> Response {
    if let Some(name) = rest.strip_suffix("/tag") {
        if method != axum::http::Method::POST {
            return StatusCode::METHOD_NOT_ALLOWED.into_response();
        }
        return tag(&state, name, Params::new(pairs)).await;
    }
    if let Some(name) = rest.strip_suffix("/json") {
        if method != axum::http::Method::GET {
            return StatusCode::METHOD_NOT_ALLOWED.into_response();
        }
        return inspect(&state, name).await;
    }
    (StatusCode::NOT_FOUND, format!("page not found: /images/{}\n", rest)).into_response()
}

async fn tag(state: &AppState, name: &str, params: Params) -> Response {
    let spec = match parse_tag(name, &params, &state.registry) {
        Ok(spec) => spec,
        Err(e) => return bad_request(OperationKind::Tag, &e),
    };

    match run_buffered(state, OperationSpec::Tag(spec)).await {
        (_, Ok(())) => StatusCode::CREATED.into_response(),
        (output, Err(e)) => {
            let mut body = output.to_vec();
            body.extend_from_slice(format!("execute tag: {}\n", e).as_bytes());
            (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
        }
    }
}

async fn inspect(state: &AppState, name: &str) -> Response {
    let spec = match parse_inspect(name, &state.registry) {
        Ok(spec) => spec,
        Err(e) => return bad_request(OperationKind::Inspect, &e),
    };

    match run_buffered(state, OperationSpec::Inspect(spec)).await {
        (output, Ok(())) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            output,
        )
            .into_response(),
        (output, Err(e)) => {
            tracing::debug!(
                "Inspect of {} failed: {} ({})",
                name,
                e,
                String::from_utf8_lossy(&output).trim()
            );
            (StatusCode::NOT_FOUND, format!("No such image: {}\n", name)).into_response()
        }
    }
}

