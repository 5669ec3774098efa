use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use anyhow::{anyhow, bail, Result};
use data_model::{
    filter::LabelsFilter,
    images::{self, ImageUpdate, ImagesForUpdate},
    Container,
    ContainerBuilder,
    ContainerSpec,
};
use metrics::{Timer, UpdateJobMetrics};
use runtime_api::{ContainerRegistry, DockerService};
use tracing::warn;

use crate::{
    job::{JobLog, UpdateJobParams, UpdateStrategyKind},
    lifecycle::ContainerLifecycleOps,
    rollback::RollbackJournal,
};

/// Containers carrying this label are our own infrastructure and are never
/// update candidates.
pub const MANAGED_LABEL: &str = "flotilla.managed";

/// Runs update jobs: loads candidates from the live daemon, applies the
/// selected strategy container by container, and replays the rollback
/// journal when a rollback-enabled batch fails partway.
pub struct UpdateOrchestrator {
    docker: Arc<dyn DockerService>,
    registry: Arc<dyn ContainerRegistry>,
    lifecycle: Arc<ContainerLifecycleOps>,
    metrics: Arc<UpdateJobMetrics>,
}

impl UpdateOrchestrator {
    pub fn new(
        docker: Arc<dyn DockerService>,
        registry: Arc<dyn ContainerRegistry>,
        lifecycle: Arc<ContainerLifecycleOps>,
    ) -> Self {
        Self {
            docker,
            registry,
            lifecycle,
            metrics: Arc::new(UpdateJobMetrics::new()),
        }
    }

    #[tracing::instrument(skip(self, params, log), fields(job_id = log.id(), image = %params.image))]
    pub async fn run(&self, params: &UpdateJobParams, log: &JobLog) -> Result<()> {
        let _timer = Timer::start(&self.metrics.job_duration);
        log.push(format!(
            "update job started: image {} strategy {} cluster {}",
            params.image,
            params.strategy,
            params.cluster.as_deref().unwrap_or("-")
        ));

        let candidates = self.load_candidates(params, log).await?;
        if candidates.is_empty() {
            log.push("no candidate containers matched".to_string());
            return Ok(());
        }

        let journal = RollbackJournal::new();
        let mut versions = HashMap::new();
        let result = match params.strategy {
            UpdateStrategyKind::StopThenStartEach => {
                self.stop_then_start_each(&candidates, params, &journal, &mut versions, log)
                    .await
            }
            UpdateStrategyKind::StopThenStartAll => {
                self.stop_then_start_all(&candidates, params, &journal, &mut versions, log)
                    .await
            }
            UpdateStrategyKind::StartThenStopEach => {
                self.start_then_stop_each(&candidates, params, &journal, &mut versions, log)
                    .await
            }
        };

        match result {
            Ok(updated) => {
                self.metrics.containers_updated.add(updated as u64, &[]);
                log.push(format!("update job finished: {} containers updated", updated));
                Ok(())
            }
            Err(err) => {
                log.push(format!("update job failed: {:#}", err));
                if params.rollback_on_failure && !journal.is_empty() {
                    self.metrics.rollbacks.add(1, &[]);
                    self.lifecycle.rollback(&journal, log).await;
                }
                Err(err)
            }
        }
    }

    /// Load candidate containers for the job's image pattern from the live
    /// daemon (the inventory cache may be stale), filter and down-sample
    /// them. Candidate order is the daemon's listing order and stays fixed
    /// for the whole batch.
    pub async fn load_candidates(
        &self,
        params: &UpdateJobParams,
        log: &JobLog,
    ) -> Result<Vec<Container>> {
        let policy = ImagesForUpdate::new(vec![ImageUpdate {
            name: params.image.clone(),
            from: params.from_version.clone(),
            to: params.to_version.clone(),
        }]);
        let filter = match &params.filter {
            Some(expr) => LabelsFilter::parse(expr)?,
            None => LabelsFilter::default(),
        };

        let summaries = self.docker.list_containers(None).await?;
        let mut candidates = Vec::new();
        for summary in summaries {
            if summary.labels.contains_key(MANAGED_LABEL) {
                continue;
            }
            let Some(entry) = policy.find_image(Some(&summary.image), summary.image_id.as_deref())
            else {
                continue;
            };
            if !entry.matches_from(&summary.image, summary.image_id.as_deref()) {
                continue;
            }
            // Already at a concrete target version: nothing to do.
            if let Some(to) = entry.to.as_deref() {
                if !to.contains('*') && images::image_tag(&summary.image) == Some(to) {
                    continue;
                }
            }
            if !filter.matches(&summary.labels) {
                continue;
            }
            let (env, restart_policy) = match self.docker.get_container(&summary.id).await? {
                Some(details) => (details.env, details.restart_policy),
                None => {
                    warn!(
                        container_id = %summary.id,
                        "listed container disappeared before inspection"
                    );
                    continue;
                }
            };
            let container = ContainerBuilder::default()
                .id(Some(summary.id.clone()))
                .name(Some(summary.name.clone()))
                .node(Some(summary.node.clone()))
                .image(summary.image.clone())
                .image_id(summary.image_id.clone())
                .cluster(params.cluster.clone())
                .labels(summary.labels.clone())
                .src(ContainerSpec {
                    image: summary.image.clone(),
                    name: Some(summary.name.clone()),
                    node: params.node.clone(),
                    cluster: params.cluster.clone(),
                    env,
                    labels: summary.labels,
                    constraints: BTreeSet::new(),
                    restart_policy,
                })
                .build()?;
            candidates.push(container);
        }

        let total = candidates.len();
        apply_sampling(&mut candidates, params.sample_percent);
        if candidates.len() < total {
            log.push(format!(
                "sampled {} of {} candidate containers",
                candidates.len(),
                total
            ));
        }
        Ok(candidates)
    }

    /// Remove labels and env vars the image itself contributes, so they are
    /// not re-applied to the replacement as if user-specified. Done before
    /// any other mutation; a bookkeeping copy, not a version step.
    async fn strip_image_config(&self, container: &Container) -> Result<Container> {
        let key = container
            .image_id
            .as_deref()
            .unwrap_or(&container.image);
        let Some(image) = self.docker.get_image(key).await? else {
            return Ok(container.clone());
        };
        Ok(container.make_copy(|c| {
            c.src.labels.retain(|k, v| image.labels.get(k) != Some(v));
            c.src.env.retain(|e| !image.env.contains(e));
        }))
    }

    /// Produce the upgraded desired container for a candidate. The target
    /// tag comes from the job parameters, or from the registry's latest
    /// tag, memoized per repository in `versions`.
    pub(crate) async fn upgrade_version(
        &self,
        container: &Container,
        params: &UpdateJobParams,
        versions: &mut HashMap<String, String>,
        log: &JobLog,
    ) -> Result<Container> {
        let repo = images::image_repo(&container.image).to_string();
        let tag = match params.to_version.as_deref() {
            Some(to) if to != "*" => to.to_string(),
            _ => self.latest_tag(&repo, versions).await?,
        };
        let target = format!("{}:{}", repo, tag);
        log.push(format!(
            "upgrading {} from {} to {}",
            container.display_name(),
            container.image,
            target
        ));
        Ok(container.make_new(|c| {
            c.image = target;
            c.image_id = None;
            c.state = None;
        }))
    }

    pub(crate) async fn latest_tag(
        &self,
        repo: &str,
        versions: &mut HashMap<String, String>,
    ) -> Result<String> {
        if let Some(tag) = versions.get(repo) {
            return Ok(tag.clone());
        }
        let tags = self.registry.list_tags(repo).await?;
        let tag = tags
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("no tags found for image {}", repo))?;
        versions.insert(repo.to_string(), tag.clone());
        Ok(tag)
    }

    /// The shared stop → remove → upgrade → create → health-check sequence
    /// used by the each-strategies and the scheduled tag update.
    pub(crate) async fn replace_container(
        &self,
        candidate: &Container,
        params: &UpdateJobParams,
        journal: &RollbackJournal,
        versions: &mut HashMap<String, String>,
        log: &JobLog,
    ) -> Result<Container> {
        let stripped = self.strip_image_config(candidate).await?;
        self.lifecycle.stop(&stripped, journal, log).await?;
        self.lifecycle.remove(&stripped, journal, log).await?;
        let upgraded = self.upgrade_version(&stripped, params, versions, log).await?;
        // A cleared name makes the allocator pick a fresh unique one.
        let cleared = upgraded.make_copy(|c| c.name = None);
        let created = self.lifecycle.create(&cleared, journal, log).await?;
        if !self
            .lifecycle
            .health_check(&created, params.health_check_timeout(), params.health_check)
            .await
        {
            bail!(
                "container {} failed its health check",
                created.display_name()
            );
        }
        Ok(created)
    }

    async fn stop_then_start_each(
        &self,
        candidates: &[Container],
        params: &UpdateJobParams,
        journal: &RollbackJournal,
        versions: &mut HashMap<String, String>,
        log: &JobLog,
    ) -> Result<usize> {
        let mut updated = 0;
        for candidate in candidates {
            self.replace_container(candidate, params, journal, versions, log)
                .await?;
            updated += 1;
        }
        Ok(updated)
    }

    async fn stop_then_start_all(
        &self,
        candidates: &[Container],
        params: &UpdateJobParams,
        journal: &RollbackJournal,
        versions: &mut HashMap<String, String>,
        log: &JobLog,
    ) -> Result<usize> {
        // Phase 1: strip, stop and remove every candidate.
        let mut working = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let stripped = self.strip_image_config(candidate).await?;
            self.lifecycle.stop(&stripped, journal, log).await?;
            self.lifecycle.remove(&stripped, journal, log).await?;
            working.push(stripped);
        }
        // Phase 2: recreate everything from phase 1. A failure here leaves
        // phase-1 containers already destroyed; rollback recreates them
        // from the journal rather than assuming a simple inverse.
        let mut updated = 0;
        for container in &working {
            let upgraded = self.upgrade_version(container, params, versions, log).await?;
            let cleared = upgraded.make_copy(|c| c.name = None);
            let created = self.lifecycle.create(&cleared, journal, log).await?;
            if !self
                .lifecycle
                .health_check(&created, params.health_check_timeout(), params.health_check)
                .await
            {
                bail!(
                    "container {} failed its health check",
                    created.display_name()
                );
            }
            updated += 1;
        }
        Ok(updated)
    }

    async fn start_then_stop_each(
        &self,
        candidates: &[Container],
        params: &UpdateJobParams,
        journal: &RollbackJournal,
        versions: &mut HashMap<String, String>,
        log: &JobLog,
    ) -> Result<usize> {
        let mut updated = 0;
        for candidate in candidates {
            let stripped = self.strip_image_config(candidate).await?;
            let upgraded = self.upgrade_version(&stripped, params, versions, log).await?;
            // The replacement runs alongside the old container, so its name
            // and id are cleared for a fresh allocation.
            let cleared = upgraded.make_copy(|c| {
                c.name = None;
                c.id = None;
            });
            let created = self.lifecycle.create(&cleared, journal, log).await?;
            if !self
                .lifecycle
                .health_check(&created, params.health_check_timeout(), params.health_check)
                .await
            {
                bail!(
                    "new container {} failed its health check",
                    created.display_name()
                );
            }
            // Only a healthy replacement retires the old container.
            self.lifecycle.stop(&stripped, journal, log).await?;
            self.lifecycle.remove(&stripped, journal, log).await?;
            updated += 1;
        }
        Ok(updated)
    }
}

/// Down-sample candidates to a fraction of the batch, minimum one. Elements
/// are removed from the head until the target size is reached, so the last
/// candidates in load order survive.
pub fn apply_sampling(candidates: &mut Vec<Container>, percent: f64) {
    if candidates.is_empty() || percent >= 1.0 {
        return;
    }
    let target = ((candidates.len() as f64) * percent + 0.5).round() as usize;
    let target = target.clamp(1, candidates.len());
    let excess = candidates.len() - target;
    candidates.drain(0..excess);
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::mock_container;
    use runtime_api::sim::{SimDocker, SimRegistry};

    use super::*;
    use crate::naming::ContainerNameAllocator;

    fn orchestrator(docker: Arc<SimDocker>, registry: Arc<SimRegistry>) -> UpdateOrchestrator {
        let lifecycle = Arc::new(ContainerLifecycleOps::new(
            docker.clone(),
            Arc::new(ContainerNameAllocator::new()),
        ));
        UpdateOrchestrator::new(docker, registry, lifecycle)
    }

    #[test]
    fn test_sampling_keeps_last_candidates() {
        let mut candidates: Vec<Container> = (0..10)
            .map(|i| mock_container(&format!("app-{i}"), "reg/app:1.0", "n1"))
            .collect();
        apply_sampling(&mut candidates, 0.25);
        // round(10 * 0.25 + 0.5) = 3, truncated from the head.
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].name.as_deref(), Some("app-7"));
        assert_eq!(candidates[2].name.as_deref(), Some("app-9"));
    }

    #[test]
    fn test_sampling_minimum_one() {
        let mut candidates = vec![mock_container("app-0", "reg/app:1.0", "n1")];
        apply_sampling(&mut candidates, 0.01);
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn test_sampling_full_batch_untouched() {
        let mut candidates: Vec<Container> = (0..4)
            .map(|i| mock_container(&format!("app-{i}"), "reg/app:1.0", "n1"))
            .collect();
        apply_sampling(&mut candidates, 1.0);
        assert_eq!(candidates.len(), 4);
    }

    #[tokio::test]
    async fn test_load_candidates_skips_managed_and_mismatched() -> Result<()> {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        docker.add_container("app-0", "reg/app:1.0", "n1");
        docker.add_container("other-0", "reg/other:1.0", "n1");
        // Infrastructure container: excluded by label.
        let infra_id = docker.add_container("infra-0", "reg/app:1.0", "n1");
        // Mark it managed through a recreate with the label set.
        {
            let _ = docker.remove_container(&infra_id).await?;
            let mut spec = ContainerSpec {
                image: "reg/app:1.0".to_string(),
                name: Some("infra-0".to_string()),
                ..Default::default()
            };
            spec.labels
                .insert(MANAGED_LABEL.to_string(), "true".to_string());
            let _ = docker.create_container(&spec).await?;
        }

        let orchestrator = orchestrator(docker, Arc::new(SimRegistry::new()));
        let params = UpdateJobParams {
            image: "reg/app".to_string(),
            to_version: Some("2.0".to_string()),
            ..Default::default()
        };
        let log = JobLog::new();
        let candidates = orchestrator.load_candidates(&params, &log).await?;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name.as_deref(), Some("app-0"));
        Ok(())
    }

    #[tokio::test]
    async fn test_load_candidates_skips_containers_already_at_target() -> Result<()> {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        docker.add_container("app-0", "reg/app:1.0", "n1");
        docker.add_container("app-1", "reg/app:2.0", "n1");

        let orchestrator = orchestrator(docker, Arc::new(SimRegistry::new()));
        let params = UpdateJobParams {
            image: "reg/app".to_string(),
            to_version: Some("2.0".to_string()),
            ..Default::default()
        };
        let log = JobLog::new();
        let candidates = orchestrator.load_candidates(&params, &log).await?;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name.as_deref(), Some("app-0"));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_then_start_each_call_sequence() -> Result<()> {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        let old_id = docker.add_container("app-0", "reg/app:1.0", "n1");

        let orchestrator = orchestrator(docker.clone(), Arc::new(SimRegistry::new()));
        let params = UpdateJobParams {
            image: "reg/app".to_string(),
            from_version: Some("*".to_string()),
            to_version: Some("2.0".to_string()),
            health_check_timeout_secs: 1,
            ..Default::default()
        };
        let log = JobLog::new();
        orchestrator.run(&params, &log).await?;

        let calls: Vec<String> = docker
            .calls()
            .into_iter()
            .filter(|c| {
                c.starts_with("stop(")
                    || c.starts_with("remove(")
                    || c.starts_with("create(")
            })
            .collect();
        assert_eq!(calls[0], format!("stop({})", old_id));
        assert_eq!(calls[1], format!("remove({})", old_id));
        // Name was cleared, so the allocator derived "app" fresh.
        assert_eq!(calls[2], "create(app, reg/app:2.0)");

        let live = docker.list_containers(None).await?;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].image, "reg/app:2.0");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_health_check_without_rollback_leaves_old_absent() -> Result<()> {
        tokio::time::pause();
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        docker.add_container("app-0", "reg/app:1.0", "n1");
        docker.set_unhealthy_starts(true);

        let orchestrator = orchestrator(docker.clone(), Arc::new(SimRegistry::new()));
        let params = UpdateJobParams {
            image: "reg/app".to_string(),
            to_version: Some("2.0".to_string()),
            rollback_on_failure: false,
            ..Default::default()
        };
        let log = JobLog::new();
        let result = orchestrator.run(&params, &log).await;
        assert!(result.is_err());

        // Documented behavior: the old container is not restored.
        let live = docker.list_containers(None).await?;
        assert!(!live.iter().any(|c| c.name == "app-0"));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_health_check_with_rollback_restores_old() -> Result<()> {
        tokio::time::pause();
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        docker.add_container("app-0", "reg/app:1.0", "n1");
        docker.set_unhealthy_starts(true);

        let orchestrator = orchestrator(docker.clone(), Arc::new(SimRegistry::new()));
        let params = UpdateJobParams {
            image: "reg/app".to_string(),
            to_version: Some("2.0".to_string()),
            rollback_on_failure: true,
            ..Default::default()
        };
        let log = JobLog::new();
        assert!(orchestrator.run(&params, &log).await.is_err());

        let live = docker.list_containers(None).await?;
        assert!(live
            .iter()
            .any(|c| c.name == "app-0" && c.image == "reg/app:1.0"));
        // The unhealthy replacement was removed again.
        assert!(!live.iter().any(|c| c.image == "reg/app:2.0"));
        Ok(())
    }

    #[tokio::test]
    async fn test_start_then_stop_keeps_old_until_new_is_healthy() -> Result<()> {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        let old_id = docker.add_container("app-0", "reg/app:1.0", "n1");

        let orchestrator = orchestrator(docker.clone(), Arc::new(SimRegistry::new()));
        let params = UpdateJobParams {
            image: "reg/app".to_string(),
            to_version: Some("2.0".to_string()),
            strategy: UpdateStrategyKind::StartThenStopEach,
            ..Default::default()
        };
        let log = JobLog::new();
        orchestrator.run(&params, &log).await?;

        let calls: Vec<String> = docker
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("stop(") || c.starts_with("create("))
            .collect();
        // Create precedes the old container's stop.
        assert!(calls[0].starts_with("create("));
        assert_eq!(calls[1], format!("stop({})", old_id));

        let live = docker.list_containers(None).await?;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].image, "reg/app:2.0");
        // The replacement got a fresh name next to the then-running old one.
        assert_eq!(live[0].name, "app-1");
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_then_start_all_two_phases() -> Result<()> {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        let id0 = docker.add_container("app-0", "reg/app:1.0", "n1");
        let id1 = docker.add_container("app-1", "reg/app:1.0", "n1");

        let orchestrator = orchestrator(docker.clone(), Arc::new(SimRegistry::new()));
        let params = UpdateJobParams {
            image: "reg/app".to_string(),
            to_version: Some("2.0".to_string()),
            strategy: UpdateStrategyKind::StopThenStartAll,
            ..Default::default()
        };
        let log = JobLog::new();
        orchestrator.run(&params, &log).await?;

        let calls: Vec<String> = docker
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("stop(") || c.starts_with("create("))
            .collect();
        // Both stops happen before any create.
        assert_eq!(calls[0], format!("stop({})", id0));
        assert_eq!(calls[1], format!("stop({})", id1));
        assert!(calls[2].starts_with("create("));
        assert!(calls[3].starts_with("create("));

        let live = docker.list_containers(None).await?;
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|c| c.image == "reg/app:2.0"));
        Ok(())
    }

    #[tokio::test]
    async fn test_latest_tag_resolution_from_registry() -> Result<()> {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        docker.add_container("app-0", "reg/app:1.0", "n1");
        let registry = Arc::new(SimRegistry::new());
        registry.set_tags("reg/app", vec!["1.0", "1.2", "1.10"]);

        let orchestrator = orchestrator(docker.clone(), registry.clone());
        let params = UpdateJobParams {
            image: "reg/app".to_string(),
            to_version: None,
            ..Default::default()
        };
        let log = JobLog::new();
        orchestrator.run(&params, &log).await?;

        let live = docker.list_containers(None).await?;
        // Numeric-aware ordering picks 1.10, not 1.2.
        assert_eq!(live[0].image, "reg/app:1.10");
        Ok(())
    }
}
