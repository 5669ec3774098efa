use std::time::Duration;

use dashmap::DashMap;
use data_model::images;
use tokio::time::Instant;
use tracing::debug;

/// How long a just-allocated name is remembered. Long enough for the
/// daemon's listings to start reporting the new container.
const RECENT_NAME_TTL: Duration = Duration::from_secs(60);

/// Allocates unique, human-readable container names from image names.
///
/// The recent-allocation cache closes the race where the daemon has not
/// yet reflected a just-created container: names handed out in the last
/// 60 seconds count as taken even if no listing shows them. Entries are
/// evicted lazily on every read, never by a background timer.
pub struct ContainerNameAllocator {
    recent: DashMap<String, Instant>,
}

impl ContainerNameAllocator {
    pub fn new() -> Self {
        Self {
            recent: DashMap::new(),
        }
    }

    /// Compute the name for a new container. An explicit name is used
    /// verbatim with no uniqueness check. `allocate` records the result in
    /// the recent cache; pass false for a dry-run preview.
    pub fn calculate_name(
        &self,
        explicit: Option<&str>,
        image: &str,
        live_names: &[String],
        allocate: bool,
    ) -> String {
        if let Some(name) = explicit {
            return name.to_string();
        }
        let base = images::app_name(image);

        let now = Instant::now();
        self.recent
            .retain(|_, allocated_at| now.duration_since(*allocated_at) < RECENT_NAME_TTL);

        let recent: Vec<String> = self.recent.iter().map(|e| e.key().clone()).collect();
        let max_index = live_names
            .iter()
            .map(|n| n.as_str())
            .chain(recent.iter().map(|s| s.as_str()))
            .filter_map(|name| name_index(&base, name))
            .max();

        let name = match max_index {
            None => base,
            Some(max) => format!("{}-{}", base, max + 1),
        };
        if allocate {
            debug!(%name, image, "allocated container name");
            self.recent.insert(name.clone(), now);
        }
        name
    }
}

impl Default for ContainerNameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of a name in the `base`/`base-<n>` family; `base` itself counts
/// as 0, anything else does not participate.
fn name_index(base: &str, name: &str) -> Option<u64> {
    if name == base {
        return Some(0);
    }
    name.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|n| n.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    fn live(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_fresh_base_then_increments() {
        let allocator = ContainerNameAllocator::new();
        assert_eq!(
            allocator.calculate_name(None, "registry/app:1.0", &[], false),
            "app"
        );
        assert_eq!(
            allocator.calculate_name(None, "registry/app:1.0", &live(&["app"]), false),
            "app-1"
        );
        assert_eq!(
            allocator.calculate_name(None, "registry/app:1.0", &live(&["app", "app-1"]), false),
            "app-2"
        );
    }

    #[test]
    fn test_unrelated_names_ignored() {
        let allocator = ContainerNameAllocator::new();
        assert_eq!(
            allocator.calculate_name(
                None,
                "registry/app:1.0",
                &live(&["apples", "app-x", "other-3"]),
                false
            ),
            "app"
        );
    }

    #[test]
    fn test_explicit_name_verbatim() {
        let allocator = ContainerNameAllocator::new();
        assert_eq!(
            allocator.calculate_name(Some("my-name"), "registry/app:1.0", &live(&["my-name"]), true),
            "my-name"
        );
    }

    #[tokio::test]
    async fn test_recent_allocations_count_as_taken() {
        let allocator = ContainerNameAllocator::new();
        // The daemon listing is empty both times; only the recent cache
        // makes the second call unique.
        assert_eq!(
            allocator.calculate_name(None, "reg/app:1.0", &[], true),
            "app"
        );
        assert_eq!(
            allocator.calculate_name(None, "reg/app:1.0", &[], true),
            "app-1"
        );
    }

    #[tokio::test]
    async fn test_recent_allocations_expire() {
        time::pause();
        let allocator = ContainerNameAllocator::new();
        assert_eq!(
            allocator.calculate_name(None, "reg/app:1.0", &[], true),
            "app"
        );
        time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            allocator.calculate_name(None, "reg/app:1.0", &[], true),
            "app"
        );
    }

    #[test]
    fn test_dry_run_does_not_allocate() {
        let allocator = ContainerNameAllocator::new();
        assert_eq!(
            allocator.calculate_name(None, "reg/app:1.0", &[], false),
            "app"
        );
        assert_eq!(
            allocator.calculate_name(None, "reg/app:1.0", &[], false),
            "app"
        );
    }
}
