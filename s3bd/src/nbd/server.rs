//! Accept loop and connection lifecycle.

use std::sync::Arc;
use std::time::Duration;

use nbd::NbdError;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::connection;
use super::exports::Exports;
use super::listener::Listener;
use crate::buffer::BufferPool;
use crate::scope::{Cause, Scope};

/// How long `shutdown` waits for connections before giving up.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single accept call.
pub const CONN_ACCEPT_TIMEOUT: Duration =
    Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT.as_secs() / 10);

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// NBD server serving the exports resolved by an [`Exports`] implementation.
///
/// The server runs under two scopes. Cancelling the soft scope stops
/// accepting connections and ends transmissions. The strict scope, its
/// parent, is cancelled once connections are gone or the graceful shutdown
/// deadline has passed.
#[derive(Clone)]
pub struct NbdServer {
    inner: Arc<Inner>,
}

struct Inner {
    exports: Arc<dyn Exports>,
    strict: Scope,
    soft: Scope,
    connections: TaskTracker,
    pool: Arc<BufferPool>,
}

impl NbdServer {
    pub fn new(scope: &Scope, exports: Arc<dyn Exports>) -> Self {
        let strict = scope.child();
        let soft = strict.child();
        Self {
            inner: Arc::new(Inner {
                exports,
                strict,
                soft,
                connections: TaskTracker::new(),
                pool: BufferPool::new(),
            }),
        }
    }

    /// Accept and serve connections until shutdown.
    ///
    /// Accept errors are logged and the loop carries on. Returns `Ok(())`
    /// on shutdown or when the listener is exhausted.
    pub async fn listen<L: Listener>(&self, mut listener: L) -> Result<(), NbdError> {
        info!("NBD server accepting connections");
        loop {
            let accepted = tokio::select! {
                _ = self.inner.soft.cancelled() => return self.stopped(),
                accepted = tokio::time::timeout(CONN_ACCEPT_TIMEOUT, listener.accept()) => accepted,
            };

            match accepted {
                Err(_) => continue,
                Ok(Ok((stream, peer))) => self.spawn_connection(stream, peer),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    info!("listener closed");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    fn stopped(&self) -> Result<(), NbdError> {
        match self.inner.soft.cause() {
            None | Some(Cause::Shutdown) => Ok(()),
            Some(cause) => Err(NbdError::Shutdown {
                cause: cause.to_string(),
            }),
        }
    }

    fn spawn_connection<S>(&self, stream: S, peer: String)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let span = info_span!("nbd_conn", client = %peer);
        self.inner.connections.spawn(
            async move {
                debug!("client connected");
                let result =
                    connection::serve(stream, &*inner.exports, &inner.soft, &inner.pool).await;
                match result {
                    Ok(()) => info!("disconnected on success"),
                    Err(NbdError::ClientClosed) => info!("client closed the connection"),
                    Err(e) if e.is_shutdown() => info!(error = %e, "disconnected by shutdown"),
                    Err(e) => warn!(error = %e, "disconnected on failure"),
                }
            }
            .instrument(span),
        );
    }

    /// Number of connections currently being served.
    pub fn connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// Stop accepting connections and wait for the open ones to end.
    ///
    /// # Panics
    ///
    /// Panics if connections are still open after
    /// [`GRACEFUL_SHUTDOWN_TIMEOUT`].
    pub async fn shutdown(&self) {
        info!("initiating graceful shutdown");
        self.inner.soft.cancel(Cause::Shutdown);
        self.inner.connections.close();

        let drained =
            tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, self.inner.connections.wait()).await;
        self.inner.strict.cancel(Cause::Shutdown);
        if drained.is_err() {
            error!(
                connections = self.inner.connections.len(),
                "graceful shutdown took too long"
            );
            panic!("NBD server connections did not end within {GRACEFUL_SHUTDOWN_TIMEOUT:?}");
        }
        info!("NBD server stopped");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use nbd::NbdClient;
    use tokio::io::duplex;

    use super::*;
    use crate::backend::Backend;
    use crate::nbd::{StaticExports, StreamListener};

    fn server(scope: &Scope) -> NbdServer {
        let exports = StaticExports::new().with(
            "disk.img",
            Backend::Memory(Bytes::from_static(b"hello, block device")),
        );
        NbdServer::new(scope, Arc::new(exports))
    }

    #[tokio::test]
    async fn serves_connections_from_listener() {
        let scope = Scope::root();
        let server = server(&scope);
        let (tx, listener) = StreamListener::new(4);
        let listening = {
            let server = server.clone();
            tokio::spawn(async move { server.listen(listener).await })
        };

        for _ in 0..2 {
            let (client, conn) = duplex(64 * 1024);
            tx.send(conn).await.unwrap();
            let mut client = NbdClient::connect(client, "disk.img").await.unwrap();
            let data = client.read(7, 5).await.unwrap();
            assert_eq!(&data[..], b"block");
            client.disconnect().await.unwrap();
        }

        drop(tx);
        listening.await.unwrap().unwrap();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_listener_and_open_connections() {
        let scope = Scope::root();
        let server = server(&scope);
        let (tx, listener) = StreamListener::new(4);
        let listening = {
            let server = server.clone();
            tokio::spawn(async move { server.listen(listener).await })
        };

        let (client, conn) = duplex(64 * 1024);
        tx.send(conn).await.unwrap();
        let mut client = NbdClient::connect(client, "disk.img").await.unwrap();
        client.read(0, 5).await.unwrap();
        assert_eq!(server.connections(), 1);

        server.shutdown().await;
        assert_eq!(server.connections(), 0);
        listening.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn listener_stops_with_failure_cause() {
        let scope = Scope::root();
        let server = server(&scope);
        let (_tx, listener) = StreamListener::<tokio::io::DuplexStream>::new(1);

        scope.cancel(Cause::Failed("disk gone".to_string()));
        let result = server.listen(listener).await;
        assert!(result.unwrap_err().is_shutdown());
    }
}
