//! HTTP transport layer.
//!
//! Thin translation between the wire surface and the orchestration core; all
//! protocol decisions live in [`crate::session::SessionService`].

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
