use serde::Serialize;

/// Structured error kinds shared by every component boundary.
///
/// Internal helpers keep propagating with `anyhow::Result`; this enum exists
/// at the seams where a caller (the request surface, a background tick)
/// needs to distinguish failure modes rather than just log-and-move-on.
#[derive(Debug, thiserror::Error)]
pub enum MeshvaultError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Wire-level shape for an error body returned by the request surface.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub reason: String,
}

impl MeshvaultError {
    pub fn kind(&self) -> &'static str {
        match self {
            MeshvaultError::NotFound(_) => "not_found",
            MeshvaultError::CorruptData(_) => "corrupt_data",
            MeshvaultError::PeerUnreachable(_) => "peer_unreachable",
            MeshvaultError::BadRequest(_) => "bad_request",
            MeshvaultError::Unauthorized(_) => "unauthorized",
            MeshvaultError::TransferFailed(_) => "transfer_failed",
            MeshvaultError::Other(_) => "internal",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind().to_string(),
            reason: self.to_string(),
        }
    }
}
