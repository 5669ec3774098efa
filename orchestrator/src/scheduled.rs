use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use data_model::{images, ContainerBuilder, ContainerSpec};
use runtime_api::DockerService;
use tracing::info;

use crate::{
    job::{JobLog, UpdateJobParams},
    lifecycle::ContainerLifecycleOps,
    rollback::RollbackJournal,
    update::UpdateOrchestrator,
};

/// The scheduled tag-or-create job: keep an image's containers on its
/// latest registry tag, creating the first container when none exist.
///
/// Runs single-flight per job definition: a firing that overlaps a run
/// already in flight blocks until that run finishes. The coarse lock also
/// guards the latest-version cache, which is looked up once per repository
/// per run and never refreshed mid-run; stale reads mid-batch would cause
/// inconsistent upgrades.
pub struct ScheduledTagUpdate {
    orchestrator: Arc<UpdateOrchestrator>,
    docker: Arc<dyn DockerService>,
    lifecycle: Arc<ContainerLifecycleOps>,
    run_lock: tokio::sync::Mutex<()>,
    versions: Mutex<HashMap<String, String>>,
}

impl ScheduledTagUpdate {
    pub fn new(
        orchestrator: Arc<UpdateOrchestrator>,
        docker: Arc<dyn DockerService>,
        lifecycle: Arc<ContainerLifecycleOps>,
    ) -> Self {
        Self {
            orchestrator,
            docker,
            lifecycle,
            run_lock: tokio::sync::Mutex::new(()),
            versions: Mutex::new(HashMap::new()),
        }
    }

    #[tracing::instrument(skip(self, params, log), fields(job_id = log.id(), image = %params.image))]
    pub async fn run(&self, params: &UpdateJobParams, log: &JobLog) -> Result<()> {
        let _guard = self.run_lock.lock().await;

        // Fresh lookups for this run, memoized for its duration.
        let mut versions: HashMap<String, String> = HashMap::new();

        let result = self.run_locked(params, &mut versions, log).await;
        *self.versions.lock().unwrap() = versions;
        result
    }

    async fn run_locked(
        &self,
        params: &UpdateJobParams,
        versions: &mut HashMap<String, String>,
        log: &JobLog,
    ) -> Result<()> {
        let candidates = self.orchestrator.load_candidates(params, log).await?;

        if candidates.is_empty() {
            return self.create_first(params, versions, log).await;
        }

        // Filter out candidates already on the latest tag or image id.
        let mut to_update = Vec::new();
        for candidate in candidates {
            let repo = images::image_repo(&candidate.image).to_string();
            let tag = self.orchestrator.latest_tag(&repo, versions).await?;
            let latest_image_id = self
                .docker
                .get_image(&format!("{}:{}", repo, tag))
                .await?
                .map(|d| d.id);
            let on_latest = images::image_tag(&candidate.image) == Some(tag.as_str())
                || (candidate.image_id.is_some() && candidate.image_id == latest_image_id);
            if on_latest {
                continue;
            }
            to_update.push(candidate);
        }
        if to_update.is_empty() {
            log.push("all candidate containers are on the latest version".to_string());
            return Ok(());
        }

        let journal = RollbackJournal::new();
        let mut updated = 0;
        let result: Result<()> = async {
            for candidate in &to_update {
                self.orchestrator
                    .replace_container(candidate, params, &journal, versions, log)
                    .await?;
                updated += 1;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                log.push(format!(
                    "scheduled update finished: {} containers moved to the latest tag",
                    updated
                ));
                Ok(())
            }
            Err(err) => {
                log.push(format!("scheduled update failed: {:#}", err));
                if params.rollback_on_failure && !journal.is_empty() {
                    self.lifecycle.rollback(&journal, log).await;
                }
                Err(err)
            }
        }
    }

    /// No candidates exist: create exactly one container with the latest
    /// discovered tag.
    async fn create_first(
        &self,
        params: &UpdateJobParams,
        versions: &mut HashMap<String, String>,
        log: &JobLog,
    ) -> Result<()> {
        let repo = images::image_repo(&params.image).to_string();
        if repo.contains('*') {
            bail!("cannot create a container from image pattern {}", params.image);
        }
        let tag = self.orchestrator.latest_tag(&repo, versions).await?;
        let image = format!("{}:{}", repo, tag);
        info!(%image, "no candidates exist, creating the first container");

        let desired = ContainerBuilder::default()
            .image(image.clone())
            .cluster(params.cluster.clone())
            .src(ContainerSpec {
                image,
                node: params.node.clone(),
                cluster: params.cluster.clone(),
                ..Default::default()
            })
            .build()?;
        let journal = RollbackJournal::new();
        let created = self.lifecycle.create(&desired, &journal, log).await?;
        if !self
            .lifecycle
            .health_check(&created, params.health_check_timeout(), params.health_check)
            .await
        {
            bail!(
                "newly created container {} failed its health check",
                created.display_name()
            );
        }
        log.push(format!(
            "created first container {} for image {}",
            created.display_name(),
            created.image
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use runtime_api::sim::{SimDocker, SimRegistry};

    use super::*;
    use crate::naming::ContainerNameAllocator;

    fn scheduled(
        docker: Arc<SimDocker>,
        registry: Arc<SimRegistry>,
    ) -> Arc<ScheduledTagUpdate> {
        let lifecycle = Arc::new(ContainerLifecycleOps::new(
            docker.clone(),
            Arc::new(ContainerNameAllocator::new()),
        ));
        let orchestrator = Arc::new(UpdateOrchestrator::new(
            docker.clone(),
            registry,
            lifecycle.clone(),
        ));
        Arc::new(ScheduledTagUpdate::new(orchestrator, docker, lifecycle))
    }

    fn params() -> UpdateJobParams {
        UpdateJobParams {
            image: "reg/app".to_string(),
            to_version: None,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_creates_first_container_when_none_exist() -> Result<()> {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        let registry = Arc::new(SimRegistry::new());
        registry.set_tags("reg/app", vec!["1.0", "2.0"]);

        let job = scheduled(docker.clone(), registry);
        job.run(&params(), &JobLog::new()).await?;

        let live = docker.list_containers(None).await?;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].image, "reg/app:2.0");
        assert_eq!(live[0].name, "app");
        Ok(())
    }

    #[tokio::test]
    async fn test_candidates_on_latest_are_left_alone() -> Result<()> {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        docker.add_container("app-0", "reg/app:2.0", "n1");
        let registry = Arc::new(SimRegistry::new());
        registry.set_tags("reg/app", vec!["1.0", "2.0"]);

        let job = scheduled(docker.clone(), registry);
        docker.clear_calls();
        job.run(&params(), &JobLog::new()).await?;

        assert!(docker.calls().iter().all(|c| !c.starts_with("stop(")));
        Ok(())
    }

    #[tokio::test]
    async fn test_outdated_candidates_are_recreated() -> Result<()> {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        docker.add_container("app-0", "reg/app:1.0", "n1");
        let registry = Arc::new(SimRegistry::new());
        registry.set_tags("reg/app", vec!["1.0", "2.0"]);

        let job = scheduled(docker.clone(), registry.clone());
        job.run(&params(), &JobLog::new()).await?;

        let live = docker.list_containers(None).await?;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].image, "reg/app:2.0");
        // The latest tag was looked up once and memoized for the run.
        let lookups = registry
            .calls()
            .iter()
            .filter(|c| c.starts_with("list_tags("))
            .count();
        assert_eq!(lookups, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_runs_do_not_interleave() -> Result<()> {
        tokio::time::pause();
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        let registry = Arc::new(SimRegistry::new());
        registry.set_tags("reg/app", vec!["1.0", "2.0"]);
        // Make the registry call slow enough that overlap would show up.
        registry.set_list_delay(Duration::from_millis(500));

        let job = scheduled(docker.clone(), registry.clone());
        let (a, b) = tokio::join!(
            {
                let job = job.clone();
                async move { job.run(&params(), &JobLog::new()).await }
            },
            {
                let job = job.clone();
                async move { job.run(&params(), &JobLog::new()).await }
            }
        );
        a?;
        // The second run found the first's container already on latest.
        b?;
        assert_eq!(registry.max_concurrent_lists(), 1);
        let live = docker.list_containers(None).await?;
        assert_eq!(live.len(), 1);
        Ok(())
    }
}
