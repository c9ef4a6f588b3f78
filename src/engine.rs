//! Process-level wiring: the datastore registry, one controller per
//! configured subscription, and graceful shutdown.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::apply::{ConflictResolver, DeadLetterRecord, ReplayReport, ResolverRegistry};
use crate::channel;
use crate::config::Config;
use crate::control;
use crate::datastore::DatastoreRegistry;
use crate::subscription::{
    SubscriptionDefinition, SubscriptionHandle, SubscriptionState, SubscriptionStatus,
};
use crate::{Error, Result};

/// A running set of subscriptions sharing one datastore registry.
pub struct Engine {
    config: Config,
    registry: Arc<DatastoreRegistry>,
    resolvers: ResolverRegistry,
    subscriptions: BTreeMap<String, SubscriptionHandle>,
}

impl Engine {
    /// Registers the configured datastores and spawns a controller for
    /// every subscription. Nothing is started.
    ///
    /// Datastores already present in `registry` are kept, which lets an
    /// embedder hand in established connections.
    pub async fn new(config: Config, registry: Arc<DatastoreRegistry>) -> Result<Self> {
        config.validate()?;
        config.warn_unknown_fields();

        for descriptor in &config.datastores {
            match registry.resolve(&descriptor.name) {
                Ok(_) => info!(datastore = %descriptor.name, "Using preregistered datastore"),
                Err(Error::NotFound { .. }) => {
                    registry.register(descriptor.clone())?;
                }
                Err(e) => return Err(e),
            }
        }

        let resolvers = ResolverRegistry::new();
        let mut subscriptions = BTreeMap::new();
        for subscription in &config.subscriptions {
            let definition = SubscriptionDefinition::from_config(&config, &subscription.name)?;
            let handle =
                SubscriptionHandle::spawn(definition, registry.clone(), resolvers.clone()).await?;
            subscriptions.insert(subscription.name.clone(), handle);
        }

        info!(
            datastores = config.datastores.len(),
            channels = config.channels.len(),
            subscriptions = subscriptions.len(),
            state_dir = ?config.engine.state_dir,
            "Engine ready"
        );
        Ok(Self {
            config,
            registry,
            resolvers,
            subscriptions,
        })
    }

    pub async fn from_config(config: Config) -> Result<Self> {
        Self::new(config, Arc::new(DatastoreRegistry::new())).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DatastoreRegistry> {
        &self.registry
    }

    /// Makes a resolver available to subscriptions naming it in
    /// `custom_resolver`. Looked up when a pipeline starts.
    pub fn register_resolver(&self, name: impl Into<String>, resolver: Arc<dyn ConflictResolver>) {
        self.resolvers.register(name, resolver);
    }

    pub fn subscription(&self, name: &str) -> Result<&SubscriptionHandle> {
        self.subscriptions
            .get(name)
            .ok_or_else(|| Error::not_found("subscription", name))
    }

    pub fn subscription_names(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    pub async fn start(&self, name: &str) -> Result<SubscriptionState> {
        self.subscription(name)?.start().await
    }

    pub async fn stop(&self, name: &str) -> Result<SubscriptionState> {
        self.subscription(name)?.stop().await
    }

    pub async fn pause(&self, name: &str) -> Result<SubscriptionState> {
        self.subscription(name)?.pause().await
    }

    pub async fn resume(&self, name: &str) -> Result<SubscriptionState> {
        self.subscription(name)?.resume().await
    }

    pub fn status(&self, name: &str) -> Result<SubscriptionStatus> {
        Ok(self.subscription(name)?.status())
    }

    pub fn statuses(&self) -> Vec<SubscriptionStatus> {
        self.subscriptions.values().map(|h| h.status()).collect()
    }

    pub async fn dead_letters(&self, name: &str) -> Result<Vec<DeadLetterRecord>> {
        self.subscription(name)?.dead_letters().await
    }

    pub async fn replay_dead_letters(&self, name: &str) -> Result<ReplayReport> {
        self.subscription(name)?.replay_dead_letters().await
    }

    /// Starts every enabled subscription that is not paused or failed.
    /// A subscription that fails to start does not keep the others from
    /// starting. Returns the number started.
    pub async fn start_enabled(&self) -> usize {
        let mut started = 0;
        for subscription in self.config.subscriptions.iter().filter(|s| s.enabled) {
            let Some(handle) = self.subscriptions.get(&subscription.name) else {
                continue;
            };
            match handle.status().state {
                SubscriptionState::Paused | SubscriptionState::Failed => {
                    info!(
                        subscription = %subscription.name,
                        state = %handle.status().state,
                        "Not starting subscription, it needs an operator"
                    );
                    continue;
                }
                _ => {}
            }
            match handle.start().await {
                Ok(state) => {
                    info!(subscription = %subscription.name, state = %state, "Started subscription");
                    started += 1;
                }
                Err(e) => error!(subscription = %subscription.name, "Failed to start: {}", e),
            }
        }
        started
    }

    /// Connects to every channel's datastores and validates its mappings.
    /// Returns the number of validated tables per channel.
    pub async fn validate_channels(&self) -> Result<BTreeMap<String, usize>> {
        let mut validated = BTreeMap::new();
        for config in &self.config.channels {
            let source = self.registry.resolve(&config.source)?.source().await?;
            let target = self.registry.resolve(&config.target)?.target().await?;
            let tables =
                channel::validate_tables(&config.tables, source.as_ref(), target.as_ref()).await?;
            info!(channel = %config.name, tables = tables.len(), "Channel is valid");
            validated.insert(config.name.clone(), tables.len());
        }
        Ok(validated)
    }

    /// Stops every subscription concurrently, then drops all connections.
    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        let stops = self.subscriptions.values().map(|handle| async move {
            if let Err(e) = handle.stop().await {
                warn!(subscription = %handle.name(), "Stop failed during shutdown: {}", e);
            }
        });
        join_all(stops).await;
        self.registry.disconnect_all().await;
        info!("Engine stopped");
    }

    /// Starts enabled subscriptions, serves the control endpoint and runs
    /// until Ctrl-C or SIGTERM.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = control::bind(&self.config.engine.control_addr).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(control::serve(self.clone(), listener, shutdown_rx));

        let started = self.start_enabled().await;
        info!(started, "Engine running");

        wait_for_signal().await?;

        let _ = shutdown_tx.send(true);
        self.shutdown().await;
        match server.await {
            Ok(result) => result,
            Err(e) => {
                error!("Control server ended abnormally: {}", e);
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received Ctrl-C");
        }
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C");
    Ok(())
}
