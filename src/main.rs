use std::{sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use proxy_engine::{
    CertificateManager, ConfigLoader, ConfigStore, GracefulShutdown, HealthChecker,
    HttpClientAdapter, MetricsAggregator, MetricsFlusher, PgControlPlane, ProxyHandler,
    RateLimiterRegistry, SessionTracker, TcpProxy,
    config::{Settings, SettingsValidator, load_settings},
    ports::{ControlPlane, HttpClient},
    server, tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "proxy-engine.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate the settings file
    Validate {
        /// Settings file to validate
        #[clap(short, long, default_value = "proxy-engine.toml")]
        config: String,
    },
    /// Start the proxy (default)
    Serve {
        /// Settings file to use
        #[clap(short, long, default_value = "proxy-engine.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    if command == "validate" {
        return validate_settings_command(&config_path);
    }

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            This can happen if a provider was already installed. \
            The application will proceed; ensure a crypto provider is effectively available.",
            e
        );
    }

    let settings = load_settings(&config_path)
        .with_context(|| format!("Failed to load settings from {config_path}"))?;
    SettingsValidator::validate(&settings).map_err(|e| eyre!("Invalid settings:\n{e}"))?;

    tracing_setup::init_tracing(settings.log_format)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    tracing::info!(config = %config_path, "Starting proxy engine");

    serve(settings).await
}

async fn serve(settings: Settings) -> Result<()> {
    let control_plane: Arc<dyn ControlPlane> =
        Arc::new(PgControlPlane::connect(&settings.database_url).await?);
    tracing::info!("Connected to the control-plane store");

    let store = Arc::new(ConfigStore::new());
    let metrics = Arc::new(MetricsAggregator::new());
    let limiters = Arc::new(RateLimiterRegistry::new());
    let certificates = Arc::new(
        CertificateManager::new(settings.acme.clone())
            .wrap_err("Failed to initialize certificate manager")?,
    );
    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().wrap_err("Failed to create upstream HTTP client")?);
    let sessions = SessionTracker::new();
    let shutdown = Arc::new(GracefulShutdown::new());

    // One eager load so the first request never sees an empty snapshot.
    let loader = Arc::new(ConfigLoader::new(
        control_plane.clone(),
        store.clone(),
        Duration::from_secs(settings.reload_interval_secs),
    ));
    match loader.reload_once().await {
        Ok(ssl_keys) => {
            tracing::info!(domains = store.len(), "Initial configuration loaded");
            certificates.ensure_managed(&ssl_keys);
        }
        Err(e) => {
            // Listeners still come up; the loader retries on its cadence.
            tracing::error!(error = %e, "Initial configuration load failed; starting empty");
        }
    }

    let signal_handler_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    {
        let loader = loader.clone();
        let certificates = certificates.clone();
        let token = shutdown.shutdown_token();
        tokio::spawn(async move { loader.run(certificates, token).await });
    }

    {
        let health_checker = HealthChecker::new(
            control_plane.clone(),
            store.clone(),
            http_client.clone(),
            Duration::from_secs(settings.health_check_interval_secs),
        );
        let token = shutdown.shutdown_token();
        tokio::spawn(async move { health_checker.run(token).await });
    }

    {
        let flusher = MetricsFlusher::new(
            control_plane.clone(),
            metrics.clone(),
            Duration::from_secs(settings.metrics_flush_interval_secs),
        );
        let token = shutdown.shutdown_token();
        tokio::spawn(async move { flusher.run(token).await });
    }

    let handler = Arc::new(ProxyHandler::new(
        store.clone(),
        limiters,
        metrics.clone(),
        certificates.clone(),
        http_client,
    ));

    // Bind everything before serving so a port conflict fails startup
    // instead of surfacing minutes later.
    let http_listener = server::bind(&settings.http_addr).await?;
    let https_listener = server::bind(&settings.https_addr).await?;
    let mut tcp_listeners = Vec::new();
    for (protocol, port) in &settings.tcp_protocols {
        let listener = server::bind(&format!("0.0.0.0:{port}")).await?;
        tcp_listeners.push((protocol.clone(), listener));
    }

    {
        let handler = handler.clone();
        let sessions = sessions.clone();
        let token = shutdown.shutdown_token();
        tokio::spawn(async move {
            if let Err(e) = server::run_http_listener(http_listener, handler, sessions, token).await
            {
                tracing::error!(error = %e, "HTTP listener failed");
            }
        });
    }

    {
        let handler = handler.clone();
        let sessions = sessions.clone();
        let tls_config = certificates.rustls_server_config();
        let token = shutdown.shutdown_token();
        tokio::spawn(async move {
            if let Err(e) =
                server::run_https_listener(https_listener, handler, tls_config, sessions, token)
                    .await
            {
                tracing::error!(error = %e, "HTTPS listener failed");
            }
        });
    }

    for (protocol, listener) in tcp_listeners {
        let proxy = Arc::new(TcpProxy::new(
            store.clone(),
            metrics.clone(),
            sessions.clone(),
        ));
        let token = shutdown.shutdown_token();
        tokio::spawn(async move { proxy.run(protocol, listener, token).await });
    }

    let reason = shutdown.wait_for_shutdown_signal().await;
    tracing::info!(reason = ?reason, "Shutting down");

    let grace = Duration::from_secs(settings.shutdown_grace_secs);
    sessions.wait_for_drain(grace).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Validate the settings file and exit
fn validate_settings_command(config_path: &str) -> Result<()> {
    println!("Validating settings file: {config_path}");

    let settings = match load_settings(config_path) {
        Ok(settings) => {
            println!("Settings parsing: OK");
            settings
        }
        Err(e) => {
            eprintln!("Settings parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match SettingsValidator::validate(&settings) {
        Ok(()) => {
            println!("Settings validation: OK");
            println!();
            println!("Summary:");
            println!("   HTTP listener:  {}", settings.http_addr);
            println!("   HTTPS listener: {}", settings.https_addr);
            println!(
                "   TCP protocols:  {}",
                if settings.tcp_protocols.is_empty() {
                    "none".to_string()
                } else {
                    settings
                        .tcp_protocols
                        .iter()
                        .map(|(name, port)| format!("{name}:{port}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                }
            );
            println!(
                "   ACME:           {} ({})",
                settings.acme.email,
                if settings.acme.production {
                    "production"
                } else {
                    "staging"
                }
            );
            println!("   Reload every:   {}s", settings.reload_interval_secs);
            Ok(())
        }
        Err(e) => {
            eprintln!("Settings validation failed:");
            eprintln!("{e}");
            println!();
            println!("Common fixes:");
            println!("   - Set database_url (or the DATABASE_URL environment variable)");
            println!("   - Set acme.email for certificate registration");
            println!("   - Check listener address format (e.g. '0.0.0.0:443')");
            std::process::exit(1);
        }
    }
}
