//! WoM App
//!
//! Unified initialization of the engine: logging, settings, event bus and
//! the federation, aggregator and reconciler components sharing one store.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use wom_aggregator::{AggregatorConfig, AggregatorService, TransactionSubmitter};
use wom_core::{DocumentStore, Hub, MemoryStore, WomError};
use wom_events::{BusError, EventBus};
use wom_federation::{
    ConnectionRequestValidator, FederationConfig, FederationRegistry, WomConnectionRequest, WomDisconnectionRequest,
};
use wom_identity::{AuthorizationCodeService, IdentityConfig, TokenRegistry};
use wom_logging::{LogLevel, LoggingConfig};
use wom_reconciler::{BlockchainReconciler, ChainReader, InMemoryChain, ReconcilerConfig};
use wom_settings::{Settings, SettingsError};
use wom_settlement::RewardConfig;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Initialization failed: {0}")]
    InitError(String),
    #[error("Settings error: {0}")]
    SettingsError(#[from] SettingsError),
    #[error("Event bus error: {0}")]
    BusError(#[from] BusError),
    #[error(transparent)]
    Wom(#[from] WomError),
}

/// Configuration of every engine component, persisted as one settings file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub logging: LoggingConfig,
    pub identity: IdentityConfig,
    pub federation: FederationConfig,
    pub reward: RewardConfig,
    pub aggregator: AggregatorConfig,
    pub reconciler: ReconcilerConfig,
}

/// Initialized engine.
pub struct Engine {
    pub service: String,
    pub settings: Settings<EngineConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub bus: Arc<EventBus>,
    pub tokens: Arc<TokenRegistry>,
    pub auth_codes: AuthorizationCodeService,
    pub registry: Arc<FederationRegistry>,
    pub connections: ConnectionRequestValidator,
    pub aggregator: Arc<AggregatorService>,
    pub reconciler: Arc<BlockchainReconciler>,
}

impl Engine {
    /// Validate a signed connection request and connect the hub on behalf
    /// of the deed manager.
    pub fn connect_hub(&self, request: &WomConnectionRequest, now: u64) -> Result<Hub, WomError> {
        let (hub, manager) = self.connections.validate_connection(request, now)?;
        self.registry.connect(&manager, &hub, request.deed_id, now)
    }

    pub fn disconnect_hub(&self, request: &WomDisconnectionRequest, now: u64) -> Result<Hub, WomError> {
        let (hub, manager) = self.connections.validate_disconnection(request, now)?;
        self.registry.disconnect(&manager, &hub, now)
    }

    /// Run the aggregator and reconciler jobs until [`Engine::shutdown`].
    pub async fn run(&self, submitter: Arc<dyn TransactionSubmitter>) {
        tokio::join!(self.aggregator.run(submitter), self.reconciler.run());
    }

    /// Deliver pending events and close the bus. Running jobs stop after
    /// their next tick.
    pub fn shutdown(&self) -> Result<(), AppError> {
        self.bus.close()?;
        info!(service = %self.service, "engine stopped");
        Ok(())
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    service: String,
    log_level: Option<LogLevel>,
    skip_logging: bool,
    skip_banner: bool,
    config_path: Option<String>,
    store: Option<Arc<dyn DocumentStore>>,
    chain: Option<Arc<dyn ChainReader>>,
}

impl EngineBuilder {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            log_level: None,
            skip_logging: false,
            skip_banner: false,
            config_path: None,
            store: None,
            chain: None,
        }
    }

    /// Override the configured log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.log_level = Some(LogLevel::from_verbose(verbose));
        self
    }

    pub fn skip_logging(mut self) -> Self {
        self.skip_logging = true;
        self
    }

    pub fn skip_banner(mut self) -> Self {
        self.skip_banner = true;
        self
    }

    pub fn config_path(mut self, path: &str) -> Self {
        self.config_path = Some(path.to_string());
        self
    }

    /// Document store, in memory by default.
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Chain reader, an empty in-memory chain by default.
    pub fn chain(mut self, chain: Arc<dyn ChainReader>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn build(self) -> Result<Engine, AppError> {
        let config_path = self.config_path.as_deref().map(Path::new);
        let settings: Settings<EngineConfig> = Settings::load_or_default(&self.service, config_path)?;
        let config = settings.config.clone();

        if !self.skip_logging {
            let mut logging = config.logging.clone();
            if let Some(level) = self.log_level {
                logging.level = level;
            }
            let _ = wom_logging::try_init_with(&logging);
        }

        if config.reward.period_length_secs == 0 {
            return Err(AppError::InitError("reward period length must be positive".into()));
        }

        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let chain = self.chain.unwrap_or_else(|| Arc::new(InMemoryChain::new()));
        let bus = Arc::new(EventBus::new());
        bus.init()?;

        let tokens = Arc::new(TokenRegistry::new(&config.identity));
        let auth_codes = AuthorizationCodeService::new(config.identity.clone(), bus.clone());
        let registry = Arc::new(FederationRegistry::new(
            config.federation.clone(),
            store.clone(),
            bus.clone(),
        ));
        let connections = ConnectionRequestValidator::new(tokens.clone(), store.clone());
        let aggregator = Arc::new(AggregatorService::restore(
            config.aggregator.clone(),
            config.reward.clone(),
            store.clone(),
            bus.clone(),
        )?);
        let reconciler = Arc::new(BlockchainReconciler::new(
            config.reconciler.clone(),
            store.clone(),
            chain,
            registry.clone(),
            aggregator.clone(),
            bus.clone(),
        ));

        if !self.skip_banner {
            info!(
                service = %self.service,
                version = env!("CARGO_PKG_VERSION"),
                settings = %settings.path().display(),
                reward_token = %config.aggregator.reward_token_address,
                network = config.aggregator.reward_token_network_id,
                "engine starting"
            );
        }

        Ok(Engine {
            service: self.service,
            settings,
            store,
            bus,
            tokens,
            auth_codes,
            registry,
            connections,
            aggregator,
            reconciler,
        })
    }
}
