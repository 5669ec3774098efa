use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use data_model::{images, Container};
use runtime_api::{ContainerRunState, ContainerSummary, DockerService, ResultCode};
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use crate::{
    job::JobLog,
    naming::ContainerNameAllocator,
    placement,
    rollback::{RollbackAction, RollbackJournal, RollbackRecord},
};

const CREATE_ATTEMPTS: usize = 3;
const HEALTH_CHECK_TRIES: u32 = 3;

/// Atomic container operations shared by every update strategy: create
/// (with placement, naming and retry-on-conflict), stop, remove,
/// health-check, and the journal replay that undoes a failed batch.
pub struct ContainerLifecycleOps {
    docker: Arc<dyn DockerService>,
    allocator: Arc<ContainerNameAllocator>,
}

impl ContainerLifecycleOps {
    pub fn new(docker: Arc<dyn DockerService>, allocator: Arc<ContainerNameAllocator>) -> Self {
        Self { docker, allocator }
    }

    /// Create and start a container from its desired configuration.
    ///
    /// A name conflict with no explicit name requested implies a racing
    /// allocator, so the create is retried with a fresh name, up to 3
    /// attempts. Every other non-OK code propagates immediately.
    pub async fn create(
        &self,
        container: &Container,
        journal: &RollbackJournal,
        log: &JobLog,
    ) -> Result<Container> {
        let mut spec = container.src.clone();
        spec.image = container.image.clone();

        if self.docker.pull_image(&spec.image).await?.is_none() {
            bail!("image {} not found", spec.image);
        }

        let cluster_config = self.docker.cluster_config().await?;
        if spec.restart_policy.is_none() {
            spec.restart_policy = cluster_config.default_restart_policy.clone();
        }

        let nodes: Vec<String> = self
            .docker
            .node_list()
            .await?
            .into_iter()
            .map(|n| n.name)
            .collect();
        let live = self.docker.list_containers(None).await?;
        let repo = images::image_repo(&spec.image).to_string();
        let mut per_node_count: HashMap<String, usize> = HashMap::new();
        for summary in &live {
            if images::image_repo(&summary.image) == repo {
                *per_node_count.entry(summary.node.clone()).or_default() += 1;
            }
        }
        placement::calculate_constraints(
            &nodes,
            spec.node.as_deref(),
            &per_node_count,
            cluster_config.max_instances_per_node,
            &mut spec.constraints,
        )?;

        let live_names: Vec<String> = live.iter().map(|c| c.name.clone()).collect();
        let explicit = container.name.clone();

        for attempt in 1..=CREATE_ATTEMPTS {
            let name =
                self.allocator
                    .calculate_name(explicit.as_deref(), &spec.image, &live_names, true);
            spec.name = Some(name.clone());
            let created = self.docker.create_container(&spec).await?;
            match created.code {
                ResultCode::Ok => {
                    let id = created
                        .id
                        .ok_or_else(|| anyhow!("daemon returned no id for container {}", name))?;
                    let started = self.docker.start_container(&id).await?;
                    if !matches!(started.code, ResultCode::Ok | ResultCode::NotModified) {
                        bail!("failed to start container {}: {}", name, started.code);
                    }
                    let node = self
                        .docker
                        .get_container(&id)
                        .await?
                        .map(|d| d.summary.node);
                    log.push(format!(
                        "created container {} ({}) from image {}",
                        name, id, spec.image
                    ));
                    let spec_snapshot = spec.clone();
                    let result = container.make_new(move |c| {
                        c.id = Some(id);
                        c.name = Some(name);
                        if node.is_some() {
                            c.node = node;
                        }
                        c.state = None;
                        c.src = spec_snapshot;
                    });
                    journal.record(&result, RollbackAction::Create);
                    return Ok(result);
                }
                ResultCode::Conflict if explicit.is_none() && attempt < CREATE_ATTEMPTS => {
                    // A racing allocator took the name; the recent-name
                    // cache now knows it, so the next attempt is unique.
                    log.push(format!(
                        "container name {} already taken, retrying ({}/{})",
                        name, attempt, CREATE_ATTEMPTS
                    ));
                    continue;
                }
                code => bail!("failed to create container {}: {}", name, code),
            }
        }
        bail!("exhausted {} create attempts for image {}", CREATE_ATTEMPTS, spec.image)
    }

    pub async fn stop(
        &self,
        container: &Container,
        journal: &RollbackJournal,
        log: &JobLog,
    ) -> Result<()> {
        let id = container
            .id
            .as_deref()
            .ok_or_else(|| anyhow!("container {} has no id", container.display_name()))?;
        let result = self.docker.stop_container(id).await?;
        match result.code {
            ResultCode::Ok => {
                journal.record(container, RollbackAction::Stop);
                log.push(format!("stopped container {}", container.display_name()));
                Ok(())
            }
            // Already stopped; nothing happened, nothing to undo.
            ResultCode::NotModified => Ok(()),
            code => bail!(
                "failed to stop container {}: {}",
                container.display_name(),
                code
            ),
        }
    }

    pub async fn remove(
        &self,
        container: &Container,
        journal: &RollbackJournal,
        log: &JobLog,
    ) -> Result<()> {
        let id = container
            .id
            .as_deref()
            .ok_or_else(|| anyhow!("container {} has no id", container.display_name()))?;
        let result = self.docker.remove_container(id).await?;
        match result.code {
            ResultCode::Ok => {
                journal.record(container, RollbackAction::Delete);
                log.push(format!("removed container {}", container.display_name()));
                Ok(())
            }
            code => bail!(
                "failed to remove container {}: {}",
                container.display_name(),
                code
            ),
        }
    }

    /// Probe a container's health, splitting the total timeout into three
    /// equal tries. A transport error counts as an unhealthy try, not a
    /// fatal error; only exhausting every try yields false. With health
    /// checking disabled the container is reported healthy without
    /// contacting the daemon.
    pub async fn health_check(
        &self,
        container: &Container,
        total_timeout: Duration,
        enabled: bool,
    ) -> bool {
        if !enabled {
            return true;
        }
        let Some(id) = container.id.as_deref() else {
            return false;
        };
        let per_try = total_timeout / HEALTH_CHECK_TRIES;
        for attempt in 1..=HEALTH_CHECK_TRIES {
            let started = Instant::now();
            let healthy = match timeout(per_try, self.probe(id)).await {
                Ok(Ok(healthy)) => healthy,
                Ok(Err(err)) => {
                    debug!(container_id = id, attempt, "health probe error: {:?}", err);
                    false
                }
                Err(_) => false,
            };
            if healthy {
                return true;
            }
            if attempt < HEALTH_CHECK_TRIES {
                let elapsed = started.elapsed();
                if elapsed < per_try {
                    sleep(per_try - elapsed).await;
                }
            }
        }
        false
    }

    async fn probe(&self, id: &str) -> Result<bool> {
        Ok(self
            .docker
            .get_container(id)
            .await?
            .map(|d| d.summary.state == ContainerRunState::Running)
            .unwrap_or(false))
    }

    /// Replay the journal in reverse chronological order, best-effort: a
    /// record that cannot be undone is reported to the job log and replay
    /// continues with the remaining records.
    pub async fn rollback(&self, journal: &RollbackJournal, log: &JobLog) {
        let records = journal.records();
        log.push(format!(
            "rolling back {} journaled actions in reverse order",
            records.len()
        ));
        for record in records.iter().rev() {
            let name = record.container.display_name().to_string();
            if let Err(err) = self.undo(record, log).await {
                log.push(format!(
                    "rollback of {} on {} failed: {:#}",
                    record.action, name, err
                ));
            }
        }
    }

    async fn undo(&self, record: &RollbackRecord, log: &JobLog) -> Result<()> {
        match record.action {
            RollbackAction::Create => self.undo_create(&record.container, log).await,
            RollbackAction::Delete => self.undo_delete(&record.container, log).await,
            RollbackAction::Stop => self.undo_stop(&record.container, log).await,
        }
    }

    async fn find_live_by_name(&self, name: &str) -> Result<Option<ContainerSummary>> {
        Ok(self
            .docker
            .list_containers(None)
            .await?
            .into_iter()
            .find(|c| c.name == name))
    }

    async fn undo_create(&self, container: &Container, log: &JobLog) -> Result<()> {
        let Some(name) = container.name.as_deref() else {
            return Ok(());
        };
        let Some(live) = self.find_live_by_name(name).await? else {
            return Ok(());
        };
        if live.image != container.image {
            bail!(
                "live container {} runs image {}, not {}; refusing to remove it",
                name,
                live.image,
                container.image
            );
        }
        // The daemon's view is authoritative; its id may differ from the
        // journaled one.
        let stopped = self.docker.stop_container(&live.id).await?;
        if !matches!(
            stopped.code,
            ResultCode::Ok | ResultCode::NotModified | ResultCode::NotFound
        ) {
            bail!("failed to stop {} during rollback: {}", name, stopped.code);
        }
        let removed = self.docker.remove_container(&live.id).await?;
        if !matches!(removed.code, ResultCode::Ok | ResultCode::NotFound) {
            bail!(
                "failed to remove {} during rollback: {}",
                name,
                removed.code
            );
        }
        log.push(format!("rollback: removed created container {}", name));
        Ok(())
    }

    async fn undo_delete(&self, container: &Container, log: &JobLog) -> Result<()> {
        let Some(name) = container.name.as_deref() else {
            bail!("journaled delete has no container name");
        };
        if let Some(live) = self.find_live_by_name(name).await? {
            if live.image == container.image {
                // Effectively restored already.
                return Ok(());
            }
            bail!(
                "cannot restore {}: name is taken by a container running {}",
                name,
                live.image
            );
        }
        let mut spec = container.src.clone();
        spec.image = container.image.clone();
        spec.name = Some(name.to_string());
        let created = self.docker.create_container(&spec).await?;
        if created.code != ResultCode::Ok {
            bail!(
                "failed to recreate {} during rollback: {}",
                name,
                created.code
            );
        }
        if let Some(id) = created.id {
            let started = self.docker.start_container(&id).await?;
            if !matches!(started.code, ResultCode::Ok | ResultCode::NotModified) {
                bail!("failed to start recreated {}: {}", name, started.code);
            }
        }
        log.push(format!("rollback: recreated container {}", name));
        Ok(())
    }

    async fn undo_stop(&self, container: &Container, log: &JobLog) -> Result<()> {
        let Some(id) = container.id.as_deref() else {
            return Ok(());
        };
        if self.docker.get_container(id).await?.is_none() {
            return Ok(());
        }
        let started = self.docker.start_container(id).await?;
        if !matches!(started.code, ResultCode::Ok | ResultCode::NotModified) {
            bail!(
                "failed to restart {}: {}",
                container.display_name(),
                started.code
            );
        }
        log.push(format!(
            "rollback: restarted container {}",
            container.display_name()
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use data_model::ContainerBuilder;
    use runtime_api::sim::SimDocker;

    use super::*;

    fn ops(docker: Arc<SimDocker>) -> ContainerLifecycleOps {
        ContainerLifecycleOps::new(docker, Arc::new(ContainerNameAllocator::new()))
    }

    fn desired(image: &str) -> Container {
        ContainerBuilder::default()
            .image(image.to_string())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_allocates_name_and_links_history() -> Result<()> {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        let ops = ops(docker.clone());
        let journal = RollbackJournal::new();
        let log = JobLog::new();

        let created = ops.create(&desired("reg/app:2.0"), &journal, &log).await?;
        assert_eq!(created.name.as_deref(), Some("app"));
        assert!(created.id.is_some());
        assert_eq!(created.old.as_ref().unwrap().image, "reg/app:2.0");
        assert_eq!(journal.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_retries_on_conflict_without_explicit_name() -> Result<()> {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        docker.fail_next_creates_with_conflict(1);
        let ops = ops(docker.clone());
        let journal = RollbackJournal::new();
        let log = JobLog::new();

        let created = ops.create(&desired("reg/app:2.0"), &journal, &log).await?;
        // First attempt conflicted on "app"; the retry got a fresh name.
        assert_eq!(created.name.as_deref(), Some("app-1"));
        let creates: Vec<String> = docker
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("create("))
            .collect();
        assert_eq!(creates.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_conflict_with_explicit_name_fails_fast() {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        docker.add_container("pinned", "reg/app:1.0", "n1");
        let ops = ops(docker.clone());
        let journal = RollbackJournal::new();
        let log = JobLog::new();

        let mut container = desired("reg/app:2.0");
        container.name = Some("pinned".to_string());
        let result = ops.create(&container, &journal, &log).await;
        assert!(result.is_err());
        let creates: Vec<String> = docker
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("create("))
            .collect();
        assert_eq!(creates.len(), 1);
    }

    #[tokio::test]
    async fn test_health_check_disabled_skips_daemon() {
        let docker = Arc::new(SimDocker::new());
        let ops = ops(docker.clone());
        let container = desired("reg/app:1.0");
        assert!(
            ops.health_check(&container, Duration::from_secs(1), false)
                .await
        );
        assert!(docker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_health_check_fails_after_three_tries() {
        tokio::time::pause();
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        let id = docker.add_container("app", "reg/app:1.0", "n1");
        // Exited container is unhealthy.
        let _ = docker.stop_container(&id).await.unwrap();
        let ops = ops(docker.clone());
        let mut container = desired("reg/app:1.0");
        container.id = Some(id);
        assert!(
            !ops.health_check(&container, Duration::from_secs(3), true)
                .await
        );
    }

    #[tokio::test]
    async fn test_rollback_replays_in_reverse_order() {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        // A: created by the batch, still live.
        let a_id = docker.add_container("a", "reg/app:2.0", "n1");
        // B: stopped by the batch, still present.
        let b_id = docker.add_container("b", "reg/app:1.0", "n1");
        let _ = docker.stop_container(&b_id).await.unwrap();
        // C: deleted by the batch, absent from the daemon.

        let ops = ops(docker.clone());
        let journal = RollbackJournal::new();
        let log = JobLog::new();

        let mut a = desired("reg/app:2.0");
        a.id = Some(a_id.clone());
        a.name = Some("a".to_string());
        let mut b = desired("reg/app:1.0");
        b.id = Some(b_id.clone());
        b.name = Some("b".to_string());
        let mut c = desired("reg/app:1.0");
        c.id = Some("gone".to_string());
        c.name = Some("c".to_string());

        journal.record(&a, RollbackAction::Create);
        journal.record(&b, RollbackAction::Stop);
        journal.record(&c, RollbackAction::Delete);

        docker.clear_calls();
        ops.rollback(&journal, &log).await;

        // Undo DELETE(c) first (create), then STOP(b) (start), then
        // CREATE(a) (stop+remove).
        let calls = docker.calls();
        assert_eq!(calls[0], "create(c, reg/app:1.0)");
        assert!(calls[1].starts_with("start("));
        assert_eq!(calls[2], format!("start({})", b_id));
        assert_eq!(calls[3], format!("stop({})", a_id));
        assert_eq!(calls[4], format!("remove({})", a_id));
    }

    #[tokio::test]
    async fn test_rollback_is_best_effort() {
        let docker = Arc::new(SimDocker::new());
        docker.add_node("n1", "10.0.0.1:2376");
        // The journaled create's name is now occupied by a foreign image:
        // that record must fail, but the later (earlier-journaled) stop
        // record must still be undone.
        docker.add_container("a", "reg/other:9.9", "n1");
        let b_id = docker.add_container("b", "reg/app:1.0", "n1");
        let _ = docker.stop_container(&b_id).await.unwrap();

        let ops = ops(docker.clone());
        let journal = RollbackJournal::new();
        let log = JobLog::new();

        let mut b = desired("reg/app:1.0");
        b.id = Some(b_id.clone());
        b.name = Some("b".to_string());
        let mut a = desired("reg/app:2.0");
        a.id = Some("old-a-id".to_string());
        a.name = Some("a".to_string());

        journal.record(&b, RollbackAction::Stop);
        journal.record(&a, RollbackAction::Create);

        docker.clear_calls();
        ops.rollback(&journal, &log).await;

        // a's undo refused (foreign image), b still restarted.
        assert!(docker.calls().contains(&format!("start({})", b_id)));
        assert!(log
            .entries()
            .iter()
            .any(|line| line.contains("refusing to remove")));
        let live = docker.list_containers(None).await.unwrap();
        assert!(live.iter().any(|c| c.name == "a" && c.image == "reg/other:9.9"));
    }
}
