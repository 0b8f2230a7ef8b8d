//! Raw TCP (L4) proxying.
//!
//! One listener per configured protocol port. L4 traffic carries no host
//! indicator, so a connection is routed to the first domain in the snapshot
//! with a dialable TCP backend; deployments are expected to run one
//! TCP-enabled domain per port (the loader warns otherwise).
//!
//! A session is two concurrent one-way copiers sharing a cancellation
//! token: either direction hitting EOF, an error, or a stalled deadline
//! tears the whole session down. Deadlines are rearmed before every read
//! and write.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        balancer::{SchemeFilter, select_backend},
        metrics::MetricsAggregator,
        store::ConfigStore,
    },
    utils::{graceful_shutdown::ShutdownToken, session_tracker::SessionTracker},
};

const COPY_BUFFER_SIZE: usize = 32 * 1024;
const READ_DEADLINE: Duration = Duration::from_secs(30);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// L4 proxy serving one protocol port.
pub struct TcpProxy {
    store: Arc<ConfigStore>,
    metrics: Arc<MetricsAggregator>,
    sessions: SessionTracker,
}

impl TcpProxy {
    pub fn new(
        store: Arc<ConfigStore>,
        metrics: Arc<MetricsAggregator>,
        sessions: SessionTracker,
    ) -> Self {
        Self {
            store,
            metrics,
            sessions,
        }
    }

    /// Accept loop for one protocol listener. Runs until shutdown; open
    /// sessions finish on their own deadlines.
    pub async fn run(
        self: Arc<Self>,
        protocol: String,
        listener: TcpListener,
        mut shutdown: ShutdownToken,
    ) {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        tracing::info!(protocol = %protocol, addr = %local, "TCP listener started");

        loop {
            let (client, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(protocol = %protocol, error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                _ = shutdown.wait_for_shutdown() => {
                    tracing::info!(protocol = %protocol, "TCP listener shutting down");
                    break;
                }
            };

            let proxy = Arc::clone(&self);
            let protocol = protocol.clone();
            tokio::spawn(async move {
                proxy.handle_connection(client, peer, &protocol).await;
            });
        }
    }

    async fn handle_connection(&self, client: TcpStream, peer: SocketAddr, protocol: &str) {
        let _guard = self.sessions.begin();
        let started = Instant::now();

        let Some(config) = self.store.first_tcp_domain() else {
            tracing::debug!(protocol = %protocol, client = %peer, "No TCP-capable domain; closing");
            return;
        };
        let routing_key = config.routing_key.clone();

        let Some(backend) = select_backend(&config, SchemeFilter::TcpOnly) else {
            tracing::warn!(domain = %routing_key, client = %peer, "No selectable TCP backend; closing");
            return;
        };

        let backend_addr = backend.addr();
        let upstream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&backend_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(domain = %routing_key, backend = %backend_addr, error = %e,
                    "Backend dial failed; closing client");
                return;
            }
            Err(_) => {
                tracing::warn!(domain = %routing_key, backend = %backend_addr,
                    "Backend dial timed out; closing client");
                return;
            }
        };

        tracing::debug!(domain = %routing_key, client = %peer, backend = %backend_addr,
            "TCP session established");

        let (client_read, client_write) = client.into_split();
        let (backend_read, backend_write) = upstream.into_split();

        let cancel = CancellationToken::new();
        let client_to_backend =
            tokio::spawn(copy_one_way(client_read, backend_write, cancel.clone()));
        let backend_to_client =
            tokio::spawn(copy_one_way(backend_read, client_write, cancel.clone()));
        let _ = tokio::join!(client_to_backend, backend_to_client);

        let elapsed = started.elapsed();
        tracing::debug!(domain = %routing_key, client = %peer,
            duration_ms = elapsed.as_millis() as u64, "TCP session closed");
        self.metrics.record_tcp(&routing_key, elapsed).await;
    }
}

/// Copy bytes in one direction until EOF, an error, a stalled deadline, or
/// cancellation from the opposite direction. Cancels the shared token on
/// the way out so the peer copier tears down too.
async fn copy_one_way<R, W>(mut reader: R, mut writer: W, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = timeout(READ_DEADLINE, reader.read(&mut buf)) => match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            write = timeout(WRITE_DEADLINE, writer.write_all(&buf[..n])) => write,
        };
        match written {
            Ok(Ok(())) => {}
            _ => break,
        }
    }

    cancel.cancel();
    let _ = writer.shutdown().await;
}
