//! Loopback proxy for exposed ports.
//!
//! `ANY /proxy/{port}/{*path}` forwards the request to
//! `http://127.0.0.1:{port}/{path}` — but only for ports present in the
//! registry, so nothing is reachable before an explicit expose.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::uri::PathAndQuery;
use axum::http::{Request, Uri};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::{ErrorKind, SandboxError};
use crate::AppState;

/// `ANY /proxy/{port}/{*path}`.
pub async fn proxy(
    State(state): State<AppState>,
    Path((port, path)): Path<(u16, String)>,
    mut request: Request<Body>,
) -> Result<Response, SandboxError> {
    if !state.ports.is_exposed(port).await {
        return Err(SandboxError::not_found(format!("port {port} is not exposed")));
    }

    let query = request
        .uri()
        .path_and_query()
        .and_then(PathAndQuery::query)
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let uri: Uri = format!("http://127.0.0.1:{port}/{path}{query}")
        .parse()
        .map_err(|e| SandboxError::validation(format!("bad proxy path: {e}")))?;
    *request.uri_mut() = uri;
    request.headers_mut().remove(hyper::header::HOST);

    let client: Client<_, Body> = Client::builder(TokioExecutor::new()).build_http();
    let response = client.request(request).await.map_err(|e| {
        SandboxError::new(
            ErrorKind::Io,
            format!("upstream request to port {port} failed: {e}"),
        )
    })?;

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(body)).into_response())
}
