//! `webkin-server` – the scene coordinator and its web surface.
//!
//! # Modules
//!
//! - [`coordinator`] – [`Coordinator`]: all authoritative state behind the
//!   single scene lock; implements the transport [`IngestHandler`] and fans
//!   snapshots out to registered WebSocket clients.
//! - [`api`] – axum router: REST endpoints, `/ws`, bundle model files, and
//!   static assets.
//!
//! [`IngestHandler`]: webkin_ingest::IngestHandler

pub mod api;
pub mod coordinator;

pub use api::{router, AppState};
pub use coordinator::Coordinator;
