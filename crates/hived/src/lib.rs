//! hived — Hive coordinator daemon.
//!
//! Wires the session registry, task queue, dispatcher and cluster
//! registrar together and runs the node gateway, the control API and the
//! background loops until shutdown.

pub mod gateway;
pub mod maintenance;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use hive_core::config::{HiveConfig, IdentityConfig, RegistrarConfig};
use hive_core::identity::IdentityKey;
use hive_services::{
    ClusterRegistrar, DispatchSettings, Dispatcher, KubernetesBackend, RegistrationBackend,
    RetryPolicy, SessionRegistry, SlurmBackend, TaskQueue,
};

use gateway::Gateway;

/// All coordinator state. Cheap handles; clones share the same registries.
pub struct Coordinator {
    config: HiveConfig,
    identity: IdentityKey,
    pub registry: SessionRegistry,
    pub queue: TaskQueue,
    pub dispatcher: Dispatcher,
    pub registrar: ClusterRegistrar,
}

impl Coordinator {
    /// Build from config, with the registration backends it enables.
    pub fn from_config(config: HiveConfig) -> Result<Self> {
        let backends = build_backends(&config.registrar)?;
        Self::with_backends(config, backends)
    }

    pub fn with_backends(
        config: HiveConfig,
        backends: Vec<Arc<dyn RegistrationBackend>>,
    ) -> Result<Self> {
        let identity = identity_key(&config.identity)?;
        let registry = SessionRegistry::new();
        let queue = TaskQueue::from_config(&config.queue);
        let dispatcher = Dispatcher::new(
            registry.clone(),
            queue.clone(),
            Arc::new(registry.clone()),
            DispatchSettings::from_config(&config),
        );
        let registrar = ClusterRegistrar::new(
            registry.clone(),
            backends,
            RetryPolicy::from_config(&config.registrar),
            dispatcher.wakeup(),
        );

        if registrar.is_standalone() {
            tracing::warn!("no registration backends configured, nodes are promoted without registration");
        }
        if config.sessions.retire_after_secs.is_none() {
            tracing::warn!("sessions.retire_after_secs unset, disconnected nodes are never retired");
        }

        Ok(Self {
            config,
            identity,
            registry,
            queue,
            dispatcher,
            registrar,
        })
    }

    pub fn api_state(&self) -> hive_api::ApiState {
        hive_api::ApiState {
            registry: self.registry.clone(),
            queue: self.queue.clone(),
            dispatcher: self.dispatcher.clone(),
            registrar: self.registrar.clone(),
            default_max_attempts: self.config.queue.default_max_attempts,
            started_at: Instant::now(),
        }
    }

    /// Serve nodes on `gateway` and the control API on `api` until
    /// `shutdown` fires or a component exits.
    pub async fn run(
        self,
        gateway: TcpListener,
        api: TcpListener,
        shutdown: broadcast::Sender<()>,
    ) -> Result<()> {
        let mut shutdown_rx = shutdown.subscribe();
        let gateway_addr = gateway.local_addr()?;
        tracing::info!(addr = %gateway_addr, "node gateway listening");

        let gateway_task = tokio::spawn(
            Gateway::new(
                gateway,
                self.registry.clone(),
                self.dispatcher.clone(),
                self.registrar.clone(),
                self.identity.clone(),
                &self.config,
                shutdown.subscribe(),
            )
            .run(),
        );

        let dispatch_task = tokio::spawn(self.dispatcher.clone().run(shutdown.subscribe()));

        let maintenance_task = tokio::spawn(maintenance::maintenance_loop(
            self.dispatcher.clone(),
            self.registrar.clone(),
            self.config.dispatch.sweep_interval(),
            shutdown.subscribe(),
        ));

        let resync_task = tokio::spawn(
            self.registrar
                .clone()
                .resync_loop(self.config.registrar.resync_interval(), shutdown.subscribe()),
        );

        let api_task = tokio::spawn(hive_api::serve(self.api_state(), api, shutdown.subscribe()));

        // ── Wait for exit ────────────────────────────────────────────────────

        tokio::select! {
            _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
            r = gateway_task        => tracing::error!("gateway exited: {:?}", r),
            r = dispatch_task       => tracing::error!("dispatcher exited: {:?}", r),
            r = maintenance_task    => tracing::error!("maintenance loop exited: {:?}", r),
            r = resync_task         => tracing::error!("registration resync exited: {:?}", r),
            r = api_task            => tracing::error!("control API exited: {:?}", r),
        }

        Ok(())
    }
}

/// Backends enabled by `[registrar.kubernetes]` / `[registrar.slurm]`.
pub fn build_backends(config: &RegistrarConfig) -> Result<Vec<Arc<dyn RegistrationBackend>>> {
    let mut backends: Vec<Arc<dyn RegistrationBackend>> = Vec::new();
    let timeout = config.request_timeout();
    if let Some(k8s) = &config.kubernetes {
        let backend = KubernetesBackend::new(k8s, timeout).context("kubernetes backend")?;
        tracing::info!(api_url = %k8s.api_url, "kubernetes registration enabled");
        backends.push(Arc::new(backend));
    }
    if let Some(slurm) = &config.slurm {
        let backend = SlurmBackend::new(slurm, timeout).context("slurm backend")?;
        tracing::info!(control_url = %slurm.control_url, partition = %slurm.partition, "slurm registration enabled");
        backends.push(Arc::new(backend));
    }
    Ok(backends)
}

fn identity_key(config: &IdentityConfig) -> Result<IdentityKey> {
    if config.secret.trim().is_empty() {
        tracing::warn!("identity.secret unset, node tokens will not survive a restart");
        return Ok(IdentityKey::generate());
    }
    IdentityKey::from_hex(&config.secret).context("identity.secret")
}
