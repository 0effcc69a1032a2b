use crate::application::session_manager::SessionManager;
use crate::config::Settings;
use crate::domain::session_identity::SessionIdPaths;
use crate::infrastructure::log_messages::{application as msg, database as db_msg, session as session_msg};
use crate::infrastructure::{FileLogger, LokiExporter, MultiSinkWriter, Redactor, SessionStore};
use crate::providers::bedrock::auth::{ChainCredentialSource, SigV4Signer};
use crate::providers::bedrock::types::AwsRegion;
use crate::providers::bedrock::BedrockProvider;
use crate::providers::constants::bedrock::DEFAULT_REGION;
use crate::proxy::{ProxyEngine, ProxyService};
use crate::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, instrument, warn};

/// How long shutdown waits for the exporter queue to drain
pub const EXPORTER_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Main application struct that coordinates all components
pub struct Application {
    settings: Settings,
    listener: TcpListener,
    service: ProxyService,
    store: SessionStore,
    exporter: Option<Arc<LokiExporter>>,
}

impl Application {
    /// Build every component and bind the listener. Bedrock credentials come
    /// from the default AWS chain.
    pub async fn build(settings: Settings) -> Result<Self> {
        Self::build_with_signer(settings, None).await
    }

    /// As [`Application::build`], signing Bedrock requests with `signer`
    /// when one is given
    #[instrument(skip_all, fields(log_root = %settings.log_root.display()))]
    pub async fn build_with_signer(settings: Settings, signer: Option<SigV4Signer>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let store = SessionStore::open(&settings.sessions_db_path()).await?;
        info!(path = %settings.sessions_db_path().display(), "{}", db_msg::OPENED);

        let exporter = match settings.loki.exporter_config()? {
            Some(config) => Some(Arc::new(LokiExporter::spawn(config, client.clone()))),
            None => {
                info!("{}", msg::EXPORTER_DISABLED);
                None
            }
        };

        let sink = Arc::new(MultiSinkWriter::new(
            FileLogger::new(&settings.log_root, settings.max_open_files),
            exporter.clone(),
            Redactor::new(&settings.sensitive_header_names),
        ));

        let (id_paths, unknown) = SessionIdPaths::from_config(&settings.client_session_id_json_paths);
        for key in unknown {
            warn!(provider = %key, "{}", session_msg::UNKNOWN_PROVIDER_KEY);
        }
        let sessions = Arc::new(SessionManager::new(store.clone(), Arc::clone(&sink), id_paths));

        let bedrock = Arc::new(build_bedrock(&settings, signer).await?);

        let engine = ProxyEngine::new(
            settings.proxy_config(),
            client,
            sessions,
            sink,
            bedrock,
        );

        let listener = TcpListener::bind((settings.listen_host.as_str(), settings.listen_port)).await?;

        Ok(Self {
            settings,
            listener,
            service: ProxyService::new(engine),
            store,
            exporter,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn service(&self) -> &ProxyService {
        &self.service
    }

    /// Serve until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then drain the exporter
    #[instrument(skip_all)]
    pub async fn run_until(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "{}", msg::LISTENING);

        let router = self.service.into_router();
        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        if let Some(exporter) = &self.exporter {
            exporter.shutdown(EXPORTER_DRAIN_GRACE).await;
        }
        self.store.close().await;
        info!("{}", msg::STOPPED);
        Ok(())
    }
}

async fn build_bedrock(settings: &Settings, signer: Option<SigV4Signer>) -> Result<BedrockProvider> {
    let region = settings
        .bedrock
        .region
        .as_deref()
        .filter(|region| !region.is_empty())
        .map(|region| {
            AwsRegion::try_new(region.to_string())
                .map_err(|e| Error::invalid_setting("bedrock.region", e.to_string()))
        })
        .transpose()?;

    let signer = match signer {
        Some(signer) => Some(signer),
        None => {
            let chain_region = match &region {
                Some(region) => region.clone(),
                None => AwsRegion::try_new(DEFAULT_REGION.to_string())
                    .map_err(|e| Error::invalid_setting("bedrock.region", e.to_string()))?,
            };
            match ChainCredentialSource::load(&chain_region).await {
                Ok(credentials) => Some(SigV4Signer::new(credentials)),
                Err(e) => {
                    warn!(error = %e, "{}", msg::BEDROCK_UNCONFIGURED);
                    None
                }
            }
        }
    };

    let provider = BedrockProvider::new(region, signer);
    Ok(match &settings.bedrock.endpoint_override {
        Some(base_url) if !base_url.is_empty() => provider.with_base_url(base_url.clone()),
        _ => provider,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("{}", msg::SHUTDOWN_SIGNAL);
}
