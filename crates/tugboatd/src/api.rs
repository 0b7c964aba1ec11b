//! HTTP surface
//!
//! Every route is also reachable under an API version prefix (`/v1.41/build`);
//! the prefix is stripped before routing.

use crate::handlers;
use crate::state::AppState;
use axum::Router;
use axum::extract::Request;
use axum::http::Uri;
use axum::http::uri::PathAndQuery;
use axum::routing::{any, get, post};
use tower::Layer;
use tower::util::{MapRequest, MapRequestLayer};

/// Router with the version-prefix rewrite applied
pub type App = MapRequest<Router, fn(Request) -> Request>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/_ping", get(handlers::ping))
        .route("/version", get(handlers::version))
        .route("/build", post(handlers::build))
        .route("/images/create", post(handlers::pull))
        .route("/images/{*rest}", any(handlers::image))
        .with_state(state)
}

pub fn create_app(state: AppState) -> App {
    MapRequestLayer::new(strip_api_version as fn(Request) -> Request).layer(create_router(state))
}

/// `/v1.41/rest` -> `/rest`
fn unversioned_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/v")?;
    let end = rest.find('/')?;
    let version = &rest[..end];
    let is_version = !version.is_empty()
        && version.starts_with(|c: char| c.is_ascii_digit())
        && version.chars().all(|c| c.is_ascii_digit() || c == '.');
    is_version.then(|| &rest[end..])
}

fn strip_api_version(mut req: Request) -> Request {
    let Some(path) = unversioned_path(req.uri().path()) else {
        return req;
    };
    let rewritten = match req.uri().query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };

    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = PathAndQuery::try_from(rewritten).ok();
    if parts.path_and_query.is_none() {
        return req;
    }
    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
    req
}
