//! Per-endpoint request accounting, installed with
//! `middleware::from_fn(track_requests)`.

use crate::state::AppState;
use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    middleware::Next,
    web, Error,
};
use std::time::Instant;

/// Key for requests that fell through to the default service.
const UNMATCHED: &str = "<unmatched>";

/// `METHOD /route/{pattern}`. Keying on the pattern instead of the raw path
/// keeps the endpoint table bounded.
fn endpoint_key(req: &ServiceRequest) -> String {
    let pattern = req.match_pattern();
    format!("{} {}", req.method(), pattern.as_deref().unwrap_or(UNMATCHED))
}

/// Records count, latency and error status of every request into [`AppState`].
/// Apps without registered state pass through untouched.
pub async fn track_requests(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let Some(state) = req.app_data::<web::Data<AppState>>().cloned() else {
        return next.call(req).await;
    };
    let endpoint = endpoint_key(&req);
    let started = Instant::now();

    let result = next.call(req).await;

    let is_error = match &result {
        Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
        Err(_) => true,
    };
    state.record_request(&endpoint, started.elapsed().as_millis() as u64, is_error);

    result
}
