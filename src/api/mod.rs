//! HTTP API Module
//!
//! Provides a read-only admin API over the partitions hosted on a metanode.

mod http;

pub use http::{AppState, HttpServer};
