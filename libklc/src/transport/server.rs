//! Unix-socket server dispatching incoming requests to a [`Dispatch`]
//! handler.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, instrument, warn};

use super::{Dispatch, MAX_MESSAGE_BYTES};
use crate::error::CsiError;
use crate::message::CsiMessage;

/// A server that accepts connections on a unix socket and answers one
/// [`CsiMessage`] request per connection.
pub struct CsiServer<T> {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<T>,
}

impl<T: Dispatch> CsiServer<T> {
    /// Bind `path`, replacing a stale socket left by a previous process.
    pub fn bind(path: impl Into<PathBuf>, handler: Arc<T>) -> Result<Self, CsiError> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CsiError::Unavailable(format!(
                    "remove stale socket {}: {e}",
                    path.display()
                )));
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CsiError::Unavailable(format!("create socket dir {}: {e}", parent.display()))
            })?;
        }
        let listener = UnixListener::bind(&path)
            .map_err(|e| CsiError::Unavailable(format!("bind {}: {e}", path.display())))?;
        info!(path = %path.display(), "CSI server listening");
        Ok(Self {
            listener,
            path,
            handler,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until an accept error occurs.
    ///
    /// Each accepted connection is handled on its own Tokio task; the
    /// handler decides how much of the work is serialized.
    pub async fn serve(&self) -> Result<(), CsiError> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .map_err(|e| CsiError::Unavailable(format!("accept: {e}")))?;
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, &handler).await {
                    error!(error = %e, "CSI connection handler error");
                }
            });
        }
    }

    /// [`serve`](Self::serve) until `shutdown` resolves.
    pub async fn serve_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), CsiError> {
        tokio::select! {
            res = self.serve() => res,
            () = shutdown => {
                info!("CSI server shutting down");
                Ok(())
            }
        }
    }

    /// Process a single connection: read request, dispatch, write response.
    #[instrument(skip_all)]
    async fn handle_connection(mut stream: UnixStream, handler: &T) -> Result<(), CsiError> {
        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_BYTES)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| CsiError::Unavailable(format!("read request: {e}")))?;

        let response = match serde_json::from_slice::<CsiMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "CSI request received");
                handler.dispatch(request).await
            }
            Err(e) => {
                warn!(error = %e, "malformed request");
                CsiMessage::Error(CsiError::InvalidArgument(format!("malformed request: {e}")))
            }
        };
        debug!(%response, "CSI response ready");

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| CsiError::Unavailable(format!("write response: {e}")))?;
        stream
            .shutdown()
            .await
            .map_err(|e| CsiError::Unavailable(format!("close response: {e}")))
    }
}

impl<T> Drop for CsiServer<T> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
