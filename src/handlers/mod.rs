//! HTTP handlers and the state they share.

pub mod health_handlers;
pub mod tus;
pub mod upload_handlers;

use crate::services::upload_service::UploadService;

/// Shared router state.
#[derive(Clone)]
pub struct AppState {
    pub uploads: UploadService,

    /// Public path prefix of upload URLs, with leading and trailing `/`.
    pub base_path: String,
}
