use std::sync::Arc;

use anyhow::Result;
use runtime_api::sim::{SimDocker, SimRegistry};
use state_store::{access::AllowAll, kv::MemoryKv};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, service::Service};

pub struct TestService {
    pub service: Service,
    pub docker: Arc<SimDocker>,
    pub registry: Arc<SimRegistry>,
    pub kv: Arc<MemoryKv>,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let docker = Arc::new(SimDocker::new());
        let registry = Arc::new(SimRegistry::new());
        let kv = Arc::new(MemoryKv::new());
        let service = Service::with_collaborators(
            ServerConfig::default(),
            docker.clone(),
            registry.clone(),
            kv.clone(),
            Arc::new(AllowAll),
        )
        .await?;

        Ok(Self {
            service,
            docker,
            registry,
            kv,
        })
    }
}
