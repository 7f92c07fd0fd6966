//! Unix-socket client used by orchestrators and tests to issue requests.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, instrument};

use super::MAX_MESSAGE_BYTES;
use crate::error::CsiError;
use crate::message::CsiMessage;

/// A CSI client addressing the server listening at one socket path.
///
/// Each request opens its own connection.
#[derive(Debug, Clone)]
pub struct CsiClient {
    path: PathBuf,
}

impl CsiClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// A [`CsiMessage::Error`] reply is returned as a message; see
    /// [`call`](Self::call) for the variant that lifts it into `Err`.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let mut stream = UnixStream::connect(&self.path).await.map_err(|e| {
            CsiError::Unavailable(format!("connect {}: {e}", self.path.display()))
        })?;

        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| CsiError::Unavailable(format!("send request: {e}")))?;
        stream
            .shutdown()
            .await
            .map_err(|e| CsiError::Unavailable(format!("finish request: {e}")))?;

        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_BYTES)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| CsiError::Unavailable(format!("read response: {e}")))?;

        let response: CsiMessage = serde_json::from_slice(&buf)
            .map_err(|e| CsiError::Internal(format!("malformed response: {e}")))?;
        debug!(%response, "CSI response received");
        Ok(response)
    }

    /// Like [`request`](Self::request), with error replies returned as `Err`.
    pub async fn call(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        match self.request(msg).await? {
            CsiMessage::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}
