//! Axum HTTP server

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Error, Result};

use super::handlers;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
}

/// Serve health and metrics on `addr` until the process exits
pub async fn run_server(addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router())
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serves_health_and_metrics() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router()).await });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let body = request(&mut stream, "/health").await;
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("\"status\":\"healthy\""));

        crate::controller::metrics::record_reconcile("done");
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let body = request(&mut stream, "/metrics").await;
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("ec2_operator_reconciliations_total"));
    }

    async fn request(stream: &mut tokio::net::TcpStream, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let req = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }
}
