use std::{sync::Arc, time::Duration};

use orchestrator::{
    ContainerLifecycleOps,
    JobLog,
    ScheduledTagUpdate,
    UpdateJobParams,
    UpdateOrchestrator,
};
use runtime_api::DockerService;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::ScheduledUpdateConfig;

struct ScheduledJob {
    job: Arc<ScheduledTagUpdate>,
    params: UpdateJobParams,
}

/// Fires the configured scheduled tag-update jobs on a fixed interval.
/// Each definition has its own single-flight job instance, so a slow run
/// and the next firing never overlap.
pub struct ScheduledUpdateRunner {
    jobs: Vec<ScheduledJob>,
    interval: Duration,
}

impl ScheduledUpdateRunner {
    pub fn new(
        orchestrator: Arc<UpdateOrchestrator>,
        docker: Arc<dyn DockerService>,
        lifecycle: Arc<ContainerLifecycleOps>,
        configs: &[ScheduledUpdateConfig],
        interval: Duration,
    ) -> Self {
        let jobs = configs
            .iter()
            .map(|config| ScheduledJob {
                job: Arc::new(ScheduledTagUpdate::new(
                    orchestrator.clone(),
                    docker.clone(),
                    lifecycle.clone(),
                )),
                params: UpdateJobParams {
                    cluster: config.cluster.clone(),
                    image: config.image.clone(),
                    to_version: None,
                    rollback_on_failure: config.rollback_on_failure,
                    health_check: config.health_check,
                    health_check_timeout_secs: config.health_check_timeout_secs,
                    node: config.node.clone(),
                    ..Default::default()
                },
            })
            .collect();
        Self { jobs, interval }
    }

    pub async fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        if self.jobs.is_empty() {
            return;
        }
        info!(
            jobs = self.jobs.len(),
            interval_s = self.interval.as_secs(),
            "starting scheduled update runner"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.fire_all().await;
                }
                _ = shutdown_rx.changed() => {
                    info!("scheduled update runner shutting down");
                    break;
                }
            }
        }
    }

    pub async fn fire_all(&self) {
        for scheduled in &self.jobs {
            let log = JobLog::new();
            if let Err(err) = scheduled.job.run(&scheduled.params, &log).await {
                error!(
                    image = %scheduled.params.image,
                    "scheduled update failed: {:?}", err
                );
            }
        }
    }
}
