//! Automatic certificate management.
//!
//! Owns the ACME account, on-disk certificate storage, and challenge
//! answers for every SSL-enabled routing key. The loader reports the
//! desired set after each reload; when it changes, the manager rebuilds the
//! ACME state for the whole set and swaps the certificate resolver and the
//! HTTP-01 challenge service atomically. Certificates and the account key
//! are cached in a directory, so a rebuild reuses everything previously
//! issued and triggers no new orders for already-covered names.
//!
//! The TLS listener asks for certificates per SNI through the resolver; a
//! handshake for a domain whose issuance has not completed yet fails with a
//! TLS alert and recovers without intervention once the order succeeds.
use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

use arc_swap::ArcSwapOption;
use axum::body::Body as AxumBody;
use eyre::{Result, WrapErr};
use futures_util::StreamExt;
use hyper::{Request, Response};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls_acme::{AcmeConfig, UseChallenge, caches::DirCache, tower::TowerHttp01ChallengeService};
use tower::ServiceExt;

use crate::config::models::AcmeSettings;

const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// ALPN protocol name for TLS-ALPN-01 validation (RFC 8737).
const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

/// Certificate resolver that delegates to the current ACME generation.
///
/// The rustls server config is built once at startup; this indirection lets
/// the manager replace the underlying resolver when the managed domain set
/// changes without rebuilding the TLS listener.
#[derive(Debug, Default)]
struct SwappableCertResolver {
    inner: ArcSwapOption<rustls_acme::ResolvesServerCertAcme>,
}

impl ResolvesServerCert for SwappableCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let guard = self.inner.load();
        guard.as_ref().and_then(|r| r.resolve(client_hello))
    }
}

struct ActiveGeneration {
    domains: BTreeSet<String>,
    driver: tokio::task::JoinHandle<()>,
}

/// Manager for ACME accounts, certificates, and challenge responses.
pub struct CertificateManager {
    settings: AcmeSettings,
    data_dir: PathBuf,
    resolver: Arc<SwappableCertResolver>,
    challenge: ArcSwapOption<TowerHttp01ChallengeService>,
    active: std::sync::Mutex<Option<ActiveGeneration>>,
    rebuilds: std::sync::atomic::AtomicUsize,
}

impl CertificateManager {
    /// Create the manager and its storage directory (mode 0700). No ACME
    /// traffic happens until the first `ensure_managed` with a non-empty
    /// set.
    pub fn new(settings: AcmeSettings) -> Result<Self> {
        let data_dir = PathBuf::from(&settings.data_dir);
        std::fs::create_dir_all(&data_dir)
            .wrap_err_with(|| format!("Failed to create ACME data dir {}", data_dir.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&data_dir, std::fs::Permissions::from_mode(0o700))
                .wrap_err("Failed to restrict ACME data dir permissions")?;
        }

        Ok(Self {
            settings,
            data_dir,
            resolver: Arc::new(SwappableCertResolver::default()),
            challenge: ArcSwapOption::empty(),
            active: std::sync::Mutex::new(None),
            rebuilds: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    /// Request managed coverage for exactly `routing_keys`.
    ///
    /// Idempotent and non-blocking: an unchanged set returns immediately,
    /// a changed set swaps in a new ACME state whose orders run on a
    /// background task. Must be called from within a tokio runtime.
    pub fn ensure_managed(&self, routing_keys: &[String]) {
        let desired: BTreeSet<String> = routing_keys.iter().cloned().collect();

        let Ok(mut active) = self.active.lock() else {
            return;
        };

        if active.as_ref().map(|a| &a.domains) == Some(&desired) {
            return;
        }

        if let Some(previous) = active.take() {
            previous.driver.abort();
        }

        if desired.is_empty() {
            tracing::info!("No SSL-enabled domains; certificate management idle");
            self.resolver.inner.store(None);
            self.challenge.store(None);
            return;
        }

        tracing::info!(
            domains = desired.len(),
            production = self.settings.production,
            "Rebuilding managed certificate set"
        );

        let challenge_type = if self.settings.tls_alpn {
            UseChallenge::TlsAlpn01
        } else {
            UseChallenge::Http01
        };

        let mut config = AcmeConfig::new(desired.iter())
            .cache(DirCache::new(self.data_dir.clone()))
            .directory_lets_encrypt(self.settings.production)
            .challenge_type(challenge_type);
        if !self.settings.email.is_empty() {
            config = config.contact_push(format!("mailto:{}", self.settings.email));
        }

        let mut state = config.state();
        self.resolver.inner.store(Some(state.resolver()));
        self.challenge
            .store(Some(Arc::new(state.http01_challenge_tower_service())));

        // Drive orders and renewals. An issuance failure for one domain
        // surfaces as an event here and does not block the others.
        let driver = tokio::spawn(async move {
            loop {
                match state.next().await {
                    Some(Ok(event)) => tracing::info!(event = ?event, "ACME event"),
                    Some(Err(err)) => tracing::warn!(error = %err, "ACME order failed"),
                    None => {
                        tracing::warn!("ACME event stream ended");
                        break;
                    }
                }
            }
        });

        self.rebuilds
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        *active = Some(ActiveGeneration {
            domains: desired,
            driver,
        });
    }

    /// TLS configuration for the HTTPS listener: TLS 1.2+, per-SNI
    /// certificates from the current ACME generation, h2 + http/1.1 ALPN
    /// (plus acme-tls/1 when TLS-ALPN-01 challenges are enabled).
    pub fn rustls_server_config(&self) -> Arc<rustls::ServerConfig> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.resolver.clone());

        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        if self.settings.tls_alpn {
            config.alpn_protocols.push(ACME_TLS_ALPN.to_vec());
        }

        Arc::new(config)
    }

    /// Answer an HTTP-01 challenge request, if this is one.
    ///
    /// Returns `None` for any path outside the well-known challenge prefix
    /// (the pipeline continues normally) and `Some(response)` once the
    /// stored key authorization has been written.
    pub async fn serve_challenge(
        &self,
        req: Request<AxumBody>,
    ) -> Option<Response<AxumBody>> {
        if !req.uri().path().starts_with(CHALLENGE_PREFIX) {
            return None;
        }

        let service = self.challenge.load_full()?;

        match (*service).clone().oneshot(req).await {
            Ok(response) => Some(response.map(AxumBody::new)),
            Err(err) => {
                tracing::warn!(error = ?err, "Failed to answer ACME challenge");
                None
            }
        }
    }

    /// Number of times the managed set was rebuilt (diagnostics).
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds.load(std::sync::atomic::Ordering::Relaxed)
    }
}
