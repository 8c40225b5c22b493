//! Shared types and utilities for the seismic sonifier.
//!
//! Holds the `Packet` delivery unit exchanged between the feed and the
//! sonification pipeline, plus the observability and CLI policy both sides use.

pub mod cli;
pub mod observability;
pub mod packet;

pub use cli::ColorWhen;
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use packet::Packet;
