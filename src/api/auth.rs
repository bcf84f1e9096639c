//! Request signing seam
//! Signature internals live outside the engine; clients only ask for headers.

use crate::api::ApiError;

/// Produces authentication headers for a request
pub trait RequestSigner: Send + Sync {
    /// Headers for `method` on `path` (path includes the API prefix, no host)
    fn headers(&self, method: &str, path: &str) -> Result<Vec<(String, String)>, ApiError>;
}

/// Signer that sends fixed credential headers (key id plus an externally minted token)
#[derive(Clone, Default)]
pub struct StaticHeaderSigner {
    api_key_id: Option<String>,
    token: Option<String>,
}

impl StaticHeaderSigner {
    pub fn new(api_key_id: Option<String>, token: Option<String>) -> Self {
        Self { api_key_id, token }
    }

    /// No credentials (paper mode, public market data)
    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for StaticHeaderSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticHeaderSigner")
            .field("api_key_id", &self.api_key_id.as_ref().map(|_| "***"))
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl RequestSigner for StaticHeaderSigner {
    fn headers(&self, _method: &str, _path: &str) -> Result<Vec<(String, String)>, ApiError> {
        let mut headers = Vec::new();
        if let Some(key) = &self.api_key_id {
            headers.push(("KALSHI-ACCESS-KEY".to_string(), key.clone()));
        }
        if let Some(token) = &self.token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        Ok(headers)
    }
}
