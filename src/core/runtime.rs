//! Member runtime orchestration.
//!
//! The runtime owns one member and its standalone collaborators:
//! - Start order: member state → transport registration → cluster start →
//!   background loop
//! - Shutdown order: background loop → transport registration
//!
//! The background loop applies newly committed entries (installing a
//! snapshot when the log no longer reaches back far enough) and runs prune
//! cycles on a fixed interval. Member operations block, so the loop hands
//! them to `spawn_blocking`.

use crate::cluster::{Member, MemberDeps, MemberSettings, StartOutcome};
use crate::consensus::InMemoryConsensus;
use crate::core::config::Config;
use crate::identity::FileIdentityStore;
use crate::net::InMemoryTransport;
use crate::storage::{MemoryStorageEngine, PruneReport};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is degraded but functional.
    Degraded,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Local state (identity record, log, snapshots).
    pub storage: ComponentHealth,
    /// Cluster participation.
    pub member: ComponentHealth,
    /// Background sync and prune loop.
    pub background: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            storage: ComponentHealth::Starting,
            member: ComponentHealth::Starting,
            background: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the member is serving.
    pub fn is_ready(&self) -> bool {
        matches!(
            (self.storage, self.member),
            (
                ComponentHealth::Healthy,
                ComponentHealth::Healthy | ComponentHealth::Degraded
            )
        )
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        !matches!(
            (self.storage, self.member),
            (ComponentHealth::Failed, _) | (_, ComponentHealth::Failed)
        )
    }
}

/// Runtime holding one member and its collaborators.
pub struct MemberRuntime {
    /// Configuration.
    config: Arc<Config>,

    /// Standalone consensus log, when the runtime built its own.
    consensus: Option<Arc<InMemoryConsensus>>,

    /// Transport the member is registered with.
    transport: Arc<InMemoryTransport>,

    /// Collaborators supplied by an embedding process.
    deps: Option<MemberDeps>,

    /// The member, once opened.
    member: Option<Arc<Member>>,

    /// How the member came up.
    outcome: Option<StartOutcome>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,

    /// Background loop task handle.
    loop_handle: Option<JoinHandle<()>>,
}

impl MemberRuntime {
    /// Create a standalone runtime: the member gets its own in-process
    /// consensus log and storage engine, and its identity record lives
    /// under the configured data directory.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let member_id = config.member.member_id;
        let mut config = config;
        if !config.cluster.initial_members.contains(&member_id) {
            tracing::warn!(
                member_id,
                initial_members = ?config.cluster.initial_members,
                "standalone member added to its own initial member list"
            );
            config.cluster.initial_members.push(member_id);
        }

        let consensus = Arc::new(InMemoryConsensus::new([member_id]));
        Ok(Self::build(config, Some(consensus), Arc::new(InMemoryTransport::new()), None))
    }

    /// Create a runtime around externally supplied collaborators.
    ///
    /// The member is registered with `transport` so peers sharing it can
    /// reach it.
    pub fn with_deps(
        config: Config,
        deps: MemberDeps,
        transport: Arc<InMemoryTransport>,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        Ok(Self::build(config, None, transport, Some(deps)))
    }

    fn build(
        config: Config,
        consensus: Option<Arc<InMemoryConsensus>>,
        transport: Arc<InMemoryTransport>,
        deps: Option<MemberDeps>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config: Arc::new(config),
            consensus,
            transport,
            deps,
            member: None,
            outcome: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            loop_handle: None,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the member (if opened).
    pub fn member(&self) -> Option<&Arc<Member>> {
        self.member.as_ref()
    }

    /// How the member came up, once started.
    pub fn outcome(&self) -> Option<&StartOutcome> {
        self.outcome.as_ref()
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the member is serving.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Check if the runtime is alive.
    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Open the member, bring it into the cluster and start the background
    /// loop.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            member_id = self.config.member.member_id,
            data_dir = %self.config.member.data_dir,
            "starting lineage runtime"
        );

        // 1. Open local state
        self.init_member().await?;

        // 2. Seed, rejoin or join
        self.start_member().await?;

        // 3. Background sync and prune
        self.start_background_loop();

        self.running.store(true, Ordering::Release);
        tracing::info!("lineage runtime started");
        Ok(())
    }

    /// Open the member's local state and register it with the transport.
    async fn init_member(&mut self) -> Result<()> {
        tracing::debug!("opening member state");

        let settings = self.config.member_settings()?;
        let deps = match &self.deps {
            Some(deps) => deps.clone(),
            None => self.standalone_deps(&settings)?,
        };

        let member = match Member::open(settings, deps) {
            Ok(member) => member,
            Err(e) => {
                self.health.storage = ComponentHealth::Failed;
                return Err(e).context("failed to open member state");
            }
        };

        if let Some(consensus) = &self.consensus {
            consensus.resume_after(member.applied_position());
        }
        self.transport.register(member.id(), &member);
        self.health.storage = ComponentHealth::Healthy;

        tracing::info!(
            member_id = member.id(),
            phase = %member.phase(),
            applied = %member.applied_position(),
            "member state opened"
        );
        self.member = Some(member);
        Ok(())
    }

    fn standalone_deps(&self, settings: &MemberSettings) -> Result<MemberDeps> {
        let consensus = self
            .consensus
            .clone()
            .context("standalone runtime has no consensus log")?;
        Ok(MemberDeps {
            consensus,
            engine: Arc::new(MemoryStorageEngine::new()),
            identity_store: Arc::new(FileIdentityStore::in_dir(settings.cluster_state_dir())),
            admission: self.transport.clone(),
            snapshots: self.transport.clone(),
        })
    }

    /// Run member startup on the blocking pool.
    async fn start_member(&mut self) -> Result<()> {
        let member = self.member.clone().context("member not opened")?;
        let timeout = self.config.startup_timeout();

        let result = tokio::task::spawn_blocking(move || member.start(timeout))
            .await
            .context("member startup task panicked")?;

        match result {
            Ok(outcome) => {
                tracing::info!(
                    identity = %outcome.identity(),
                    outcome = ?outcome,
                    "member started"
                );
                self.health.member = ComponentHealth::Healthy;
                self.outcome = Some(outcome);
                Ok(())
            }
            Err(e) => {
                self.health.member = if e.is_retriable() {
                    ComponentHealth::Degraded
                } else {
                    ComponentHealth::Failed
                };
                tracing::error!(error = %e, "member startup failed");
                Err(e).context("member startup failed")
            }
        }
    }

    /// Spawn the periodic sync and prune loop.
    fn start_background_loop(&mut self) {
        let Some(member) = self.member.clone() else {
            return;
        };
        let tick_every = Duration::from_millis(self.config.cluster.join_retry_backoff_ms.max(1));
        let prune_every = self.config.prune_interval();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(tick_every);
            let mut prune = tokio::time::interval(prune_every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = run_tick(&member).await {
                            tracing::warn!(error = %e, "sync tick failed");
                        }
                    }
                    _ = prune.tick() => {
                        if let Err(e) = run_prune(&member).await {
                            tracing::warn!(error = %e, "prune cycle failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
                if member.is_stopped() {
                    tracing::error!(
                        reason = ?member.stopped_reason(),
                        "member stopped, background loop exiting"
                    );
                    break;
                }
            }
        });

        self.loop_handle = Some(handle);
        self.health.background = ComponentHealth::Healthy;
    }

    /// Apply newly committed entries once.
    pub async fn tick_once(&self) -> Result<()> {
        let member = self.member.clone().context("member not opened")?;
        run_tick(&member).await
    }

    /// Run one prune cycle.
    pub async fn prune_once(&self) -> Result<Option<PruneReport>> {
        let member = self.member.clone().context("member not opened")?;
        run_prune(&member).await
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run the runtime until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop the background loop and leave the transport.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping lineage runtime");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        self.health.background = ComponentHealth::Stopping;
        if let Some(handle) = self.loop_handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => tracing::debug!("background loop stopped"),
                Ok(Err(e)) => tracing::warn!(error = %e, "background loop panicked"),
                Err(_) => tracing::warn!("background loop stop timed out"),
            }
        }
        self.health.background = ComponentHealth::Stopped;

        self.health.member = ComponentHealth::Stopping;
        if let Some(member) = &self.member {
            self.transport.unregister(member.id());
        }
        self.health.member = ComponentHealth::Stopped;
        self.health.storage = ComponentHealth::Stopped;

        tracing::info!("lineage runtime stopped");
        Ok(())
    }

    /// Open and start the member without the background loop or signal
    /// handling.
    pub async fn start_for_tests(&mut self) -> Result<()> {
        self.init_member().await?;
        self.start_member().await?;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the runtime for tests.
    pub async fn shutdown_for_tests(&mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.running.store(false, Ordering::Release);
        if let Some(member) = &self.member {
            self.transport.unregister(member.id());
        }
        Ok(())
    }
}

async fn run_tick(member: &Arc<Member>) -> Result<()> {
    let member = member.clone();
    tokio::task::spawn_blocking(move || member.tick())
        .await
        .context("sync task panicked")?
        .context("sync failed")
}

async fn run_prune(member: &Arc<Member>) -> Result<Option<PruneReport>> {
    let member = member.clone();
    tokio::task::spawn_blocking(move || member.prune_now())
        .await
        .context("prune task panicked")?
        .context("prune failed")
}
