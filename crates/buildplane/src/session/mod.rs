//! Session lifecycle management.
//!
//! A session is the client-scoped lifetime of one build server: created on
//! first contact, reconciled against the compute backend on every poll, and
//! reclaimed by the reaper once the client stops polling.

mod memory;
mod models;
mod reaper;
mod repository;
mod service;

pub use memory::InMemorySessionStore;
pub use models::{GetServerRequest, ServerInfo, Session, SessionStatus, now_millis};
pub use reaper::{Reaper, ReaperConfig, ReaperHandle};
pub use repository::{SessionStore, SqliteSessionStore};
pub use service::{SessionService, SessionServiceConfig};

#[cfg(test)]
pub(crate) mod testing;
