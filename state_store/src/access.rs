use anyhow::Result;

/// The security boundary for registry access. The real checker lives
/// outside this repository; registries only assert through this trait.
pub trait AccessChecker: Send + Sync {
    fn check_read(&self, node: &str) -> Result<()>;
    fn check_update(&self, node: &str) -> Result<()>;
}

/// Default checker: everything is permitted.
pub struct AllowAll;

impl AccessChecker for AllowAll {
    fn check_read(&self, _node: &str) -> Result<()> {
        Ok(())
    }

    fn check_update(&self, _node: &str) -> Result<()> {
        Ok(())
    }
}
