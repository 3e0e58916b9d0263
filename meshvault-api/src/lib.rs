//! Request surface (C6): a single JSON-over-HTTP gateway exposing every
//! client-facing and peer-to-peer operation in §6 behind one axum router.
//!
//! Unlike a gateway fronting several wire protocols, a meshvault peer speaks
//! exactly one: plain JSON bodies over HTTP, with binary chunk payloads
//! carried as raw `application/octet-stream` rather than multipart or
//! base64. Every handler is stateless and reaches shared components
//! (ring/store/membership/strategy) through `Arc`-wrapped [`http::AppState`].

mod http;

pub use http::{router, AppState};

use anyhow::Result;
use std::net::SocketAddr;
use tracing::{info, warn};

/// Owns the listening socket for one peer's request surface. A thin wrapper
/// around axum's `serve`, mirroring the teacher's `start`/`stop` lifecycle.
pub struct MeshvaultServer {
    bind_addr: SocketAddr,
    state: AppState,
}

impl MeshvaultServer {
    pub fn new(bind_addr: SocketAddr, state: AppState) -> Self {
        Self { bind_addr, state }
    }

    /// Binds and serves in a background task; returns once the listener is
    /// bound, not once the server stops.
    pub async fn start(self) -> Result<()> {
        let app = router(self.state);
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "request surface listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "request surface server error");
            }
        });
        Ok(())
    }
}
