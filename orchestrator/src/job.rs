use std::{sync::Mutex, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Which update strategy a job runs. Resolved once at job start; the
/// scheduled tag-or-create job is its own entry point, not a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum UpdateStrategyKind {
    /// Stop, remove and recreate one container at a time.
    StopThenStartEach,
    /// Stop and remove every candidate, then recreate them all.
    StopThenStartAll,
    /// Create the replacement next to the running container; stop the old
    /// one only once the new one is healthy.
    StartThenStopEach,
}

/// Parameters of one update job invocation, populated at the job framework
/// boundary before the core is entered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJobParams {
    /// Cluster identifier, for the audit trail.
    pub cluster: Option<String>,
    /// Image name, id or `*` pattern selecting candidates.
    pub image: String,
    /// Source version pattern; `None`/`"*"` matches any.
    pub from_version: Option<String>,
    /// Target version; `None`/`"*"` means the latest discovered tag.
    pub to_version: Option<String>,
    pub strategy: UpdateStrategyKind,
    pub rollback_on_failure: bool,
    pub health_check: bool,
    pub health_check_timeout_secs: u64,
    /// Fraction of candidates to update, 0.0–1.0. At least one candidate
    /// survives when any exist.
    pub sample_percent: f64,
    /// Label filter expression, e.g. `tier==web,env!=staging`.
    pub filter: Option<String>,
    /// Explicit target node for created containers.
    pub node: Option<String>,
}

impl Default for UpdateJobParams {
    fn default() -> Self {
        Self {
            cluster: None,
            image: String::new(),
            from_version: None,
            to_version: None,
            strategy: UpdateStrategyKind::StopThenStartEach,
            rollback_on_failure: true,
            health_check: true,
            health_check_timeout_secs: 60,
            sample_percent: 1.0,
            filter: None,
            node: None,
        }
    }
}

impl UpdateJobParams {
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}

/// Append-only, human-readable audit trail of one job run. Not machine
/// parsed; every line also goes to the tracing log.
pub struct JobLog {
    id: String,
    entries: Mutex<Vec<String>>,
}

impl JobLog {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn push(&self, message: String) {
        info!(job_id = %self.id, "{}", message);
        self.entries.lock().unwrap().push(message);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }
}

impl Default for JobLog {
    fn default() -> Self {
        Self::new()
    }
}
