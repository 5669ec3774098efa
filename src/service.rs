use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use axum_server::Handle;
use orchestrator::{ContainerLifecycleOps, ContainerNameAllocator, UpdateOrchestrator};
use runtime_api::{
    sim::{SimDocker, SimRegistry},
    ContainerRegistry,
    DockerService,
};
use state_store::{
    access::AccessChecker,
    kv::{KvStore, MemoryKv},
    ClusterState,
};
use tokio::{signal, sync::watch};
use tracing::info;

use crate::{
    config::ServerConfig,
    node_manager::NodeManager,
    reconciler::ContainerReconciler,
    routes::{create_routes, RouteState},
    scheduler::ScheduledUpdateRunner,
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub kv: Arc<dyn KvStore>,
    pub docker: Arc<dyn DockerService>,
    pub registry: Arc<dyn ContainerRegistry>,
    pub cluster_state: Arc<ClusterState>,
    pub node_manager: Arc<NodeManager>,
    pub reconciler: Arc<ContainerReconciler>,
    pub lifecycle: Arc<ContainerLifecycleOps>,
    pub orchestrator: Arc<UpdateOrchestrator>,
    pub scheduled: Arc<ScheduledUpdateRunner>,
}

impl Service {
    /// Dev-mode service against the in-memory simulated daemon, registry
    /// and store. Production deployments construct the service with real
    /// adapters through [`Service::with_collaborators`].
    pub async fn new(config: ServerConfig) -> Result<Self> {
        if !config.dev {
            bail!("no daemon adapter wired in; enable dev mode or construct the service with collaborators");
        }
        Self::with_collaborators(
            config,
            Arc::new(SimDocker::new()),
            Arc::new(SimRegistry::new()),
            Arc::new(MemoryKv::new()),
            Arc::new(state_store::access::AllowAll),
        )
        .await
    }

    pub async fn with_collaborators(
        config: ServerConfig,
        docker: Arc<dyn DockerService>,
        registry: Arc<dyn ContainerRegistry>,
        kv: Arc<dyn KvStore>,
        access: Arc<dyn AccessChecker>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let cluster_state = ClusterState::new(kv.clone(), access).await?;

        let allocator = Arc::new(ContainerNameAllocator::new());
        let lifecycle = Arc::new(ContainerLifecycleOps::new(docker.clone(), allocator));
        let orchestrator = Arc::new(UpdateOrchestrator::new(
            docker.clone(),
            registry.clone(),
            lifecycle.clone(),
        ));
        let node_manager = Arc::new(NodeManager::new(
            cluster_state.clone(),
            Duration::from_secs(config.node_ttl_secs),
            Duration::from_secs(config.node_sweep_interval_secs),
        ));
        let reconciler = Arc::new(ContainerReconciler::new(
            cluster_state.clone(),
            docker.clone(),
            Duration::from_secs(config.reconcile_interval_secs),
            Duration::from_millis(config.resync_debounce_ms),
            Duration::from_millis(config.resync_debounce_ceiling_ms),
        ));
        let scheduled = Arc::new(ScheduledUpdateRunner::new(
            orchestrator.clone(),
            docker.clone(),
            lifecycle.clone(),
            &config.scheduled_updates,
            Duration::from_secs(config.scheduled_update_interval_secs),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            kv,
            docker,
            registry,
            cluster_state,
            node_manager,
            reconciler,
            lifecycle,
            orchestrator,
            scheduled,
        })
    }

    /// Spawn every background loop: the KV watch pump, the node deadline
    /// monitor and sweeper, the reconciler loops, and the scheduled update
    /// runner. All of them stop on the shutdown channel.
    pub fn spawn_background_tasks(&self) {
        self.cluster_state.start_kv_listener(self.shutdown_rx.clone());

        let monitor = self.node_manager.clone();
        let rx = self.shutdown_rx.clone();
        tokio::spawn(async move { monitor.start_monitor(rx).await });

        let sweeper = self.node_manager.clone();
        let rx = self.shutdown_rx.clone();
        tokio::spawn(async move { sweeper.start_sweeper(rx).await });

        let periodic = self.reconciler.clone();
        let rx = self.shutdown_rx.clone();
        tokio::spawn(async move { periodic.start_periodic(rx).await });

        let events = self.reconciler.clone();
        let rx = self.shutdown_rx.clone();
        tokio::spawn(async move { events.start_event_loop(rx).await });

        let scheduled = self.scheduled.clone();
        let rx = self.shutdown_rx.clone();
        tokio::spawn(async move { scheduled.start(rx).await });
    }

    pub async fn start(&mut self) -> Result<()> {
        self.spawn_background_tasks();

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server");
        });

        let route_state = RouteState {
            cluster_state: self.cluster_state.clone(),
            node_manager: self.node_manager.clone(),
            orchestrator: self.orchestrator.clone(),
        };
        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(route_state);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    handle.shutdown();
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down server gracefully");
}
