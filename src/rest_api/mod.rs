//! HTTP endpoints for health checks and scraping
//!
//! Serves liveness information and the Prometheus metrics of the controller.

mod handlers;
mod server;

pub use server::{router, run_server};
