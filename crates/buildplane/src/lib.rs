//! Buildplane library.
//!
//! Control plane for ephemeral per-session build servers: the orchestration
//! core, the session store, the compute backend abstraction, and the
//! staleness reaper, plus a thin HTTP transport.

pub mod api;
pub mod compute;
pub mod db;
pub mod session;
