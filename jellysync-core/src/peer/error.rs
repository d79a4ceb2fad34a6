use reqwest::Response;

/// Errors surfaced by the peer REST client, discriminated by HTTP status so
/// callers can route not-found and auth failures differently from
/// transport noise.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("Resource not found")]
    NotFound,

    #[error("Unauthorized (check the configured api_key)")]
    Unauthorized,

    #[error("Peer returned HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    Parse(String),

    #[error("Invalid header value")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

impl PeerError {
    /// True when the peer definitively reported the resource missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Map a response's status to a `PeerError`, passing successes through.
pub fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status.as_u16() {
        404 => Err(PeerError::NotFound),
        401 | 403 => Err(PeerError::Unauthorized),
        code => Err(PeerError::Server {
            status: code,
            message: status.canonical_reason().unwrap_or("unknown").to_string(),
        }),
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
