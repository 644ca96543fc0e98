pub mod config;
pub mod transcriptions;

pub use config::*;
pub use transcriptions::*;

use crate::error::{AppError, AppResult};
use actix_web::HttpRequest;

/// Fallback for unknown routes, so they get the same JSON error body as everything else.
pub async fn not_found(req: HttpRequest) -> AppResult<actix_web::HttpResponse> {
    Err(AppError::NotFound(format!("No route for {} {}", req.method(), req.path())))
}
