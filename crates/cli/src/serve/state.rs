//! Application state shared across request handlers.

use leadrun_engine::SmartResumeDriver;

pub(crate) struct AppState {
    pub(crate) driver: SmartResumeDriver,
    /// Accepted as a bearer token or in `x-webhook-secret`.
    pub(crate) webhook_secret: String,
}
