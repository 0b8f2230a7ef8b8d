//! Listener wiring.
//!
//! Three listener families feed the request pipeline: the plain HTTP
//! listener (ACME HTTP-01 answers, HTTPS redirects, plaintext serving for
//! non-SSL domains), the TLS listener (per-SNI certificates from the
//! certificate manager), and one raw TCP listener per configured protocol
//! port. Accept loops stop on shutdown; in-flight work is tracked and
//! drained by the caller.
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
};
use eyre::{Result, WrapErr};
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::{
    adapters::http_handler::{ListenerKind, ProxyHandler},
    utils::{graceful_shutdown::ShutdownToken, session_tracker::SessionTracker},
};

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a listener, failing with context naming the address.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind listener on {addr}"))
}

/// Serve the plain HTTP listener until shutdown.
pub async fn run_http_listener(
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
    sessions: SessionTracker,
    mut shutdown: ShutdownToken,
) -> Result<()> {
    let local = listener.local_addr().wrap_err("HTTP listener address")?;
    tracing::info!(addr = %local, "HTTP listener started");

    let app = Router::new().fallback(
        move |ConnectInfo(addr): ConnectInfo<SocketAddr>, req: Request| {
            let handler = handler.clone();
            let sessions = sessions.clone();
            async move {
                let _guard = sessions.begin();
                handler.handle_request(req, addr, ListenerKind::Http).await
            }
        },
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.wait_for_shutdown().await;
        tracing::info!("HTTP listener shutting down");
    })
    .await
    .wrap_err("HTTP listener failed")
}

/// Serve the TLS listener until shutdown.
///
/// Each accepted connection goes through the rustls handshake (per-SNI
/// certificates resolved by the certificate manager; TLS 1.2 minimum) and
/// is then served by hyper's auto builder, so ALPN-negotiated h2 and
/// http/1.1 both work. A handshake failure only costs that one connection.
pub async fn run_https_listener(
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
    tls_config: Arc<rustls::ServerConfig>,
    sessions: SessionTracker,
    mut shutdown: ShutdownToken,
) -> Result<()> {
    let local = listener.local_addr().wrap_err("HTTPS listener address")?;
    tracing::info!(addr = %local, "HTTPS listener started");

    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept TLS connection");
                    continue;
                }
            },
            _ = shutdown.wait_for_shutdown() => {
                tracing::info!("HTTPS listener shutting down");
                return Ok(());
            }
        };

        let acceptor = acceptor.clone();
        let handler = handler.clone();
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    // Expected for domains whose certificate is still being
                    // issued, and for TLS-ALPN-01 validation connections.
                    tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |req: hyper::Request<Incoming>| {
                let handler = handler.clone();
                let sessions = sessions.clone();
                async move {
                    let _guard = sessions.begin();
                    let response = handler
                        .handle_request(req.map(AxumBody::new), peer, ListenerKind::Https)
                        .await;
                    Ok::<_, Infallible>(response)
                }
            });

            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder
                .http1()
                .timer(TokioTimer::new())
                .header_read_timeout(HEADER_READ_TIMEOUT);

            if let Err(e) = builder
                .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                .await
            {
                tracing::debug!(peer = %peer, error = %e, "TLS connection ended with error");
            }
        });
    }
}
