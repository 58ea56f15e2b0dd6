//! HTTP layer for packgate.
//!
//! This module provides the axum-based HTTP server that answers Git smart
//! HTTP `upload-pack` requests from locally stored bare repositories, plus
//! the health, metrics and admin endpoints.

pub mod handler;
pub mod pktline;
