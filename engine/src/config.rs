//! Workflow configuration as consumed by the engine.
//!
//! A configuration can be built programmatically (`WorkflowConfig::new`) or
//! read from an HCL file the way the daemon does it.
//!

use std::fs;
use std::path::Path;
use std::time::Duration;

use eyre::Result;
use serde::Deserialize;
use tracing::{debug, trace};

/// Usual check for a malformed or outdated file.
pub const CONFIG_VERSION: usize = 1;

const DEFAULT_MEMORY: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_CORES: u32 = 1;
const DEFAULT_DISK: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_POLLING: f64 = 60.;

/// Everything the core needs to know about the enclosing workflow.
///
#[derive(Clone, Debug, Deserialize)]
pub struct WorkflowConfig {
    /// Must match `CONFIG_VERSION` when loaded from a file
    #[serde(default = "version_default")]
    pub version: usize,
    /// Locator of the job store this workflow runs against
    pub job_store: String,
    /// Stable identifier of the workflow
    pub workflow_id: String,
    /// Incremented by the leader on every restart of the workflow
    #[serde(default = "one")]
    pub workflow_attempt_number: u32,
    /// Run every worker with the plain, uncached file store
    #[serde(default)]
    pub disable_shared_cache: bool,
    /// Default for the `mutable` flag of global reads
    #[serde(default)]
    pub read_global_file_mutable_by_default: bool,
    /// Allow asynchronous write-back of produced files
    #[serde(default = "yes")]
    pub use_async: bool,
    /// Seconds between two liveness checks of a running service
    #[serde(default = "polling_default")]
    pub service_polling_interval: f64,
    #[serde(default = "memory_default")]
    pub default_memory: u64,
    #[serde(default = "cores_default")]
    pub default_cores: u32,
    #[serde(default = "disk_default")]
    pub default_disk: u64,
    /// Defaults to `default_disk` when absent
    #[serde(default)]
    pub default_cache: Option<u64>,
    #[serde(default)]
    pub default_preemptable: bool,
}

fn version_default() -> usize {
    CONFIG_VERSION
}

fn one() -> u32 {
    1
}

fn yes() -> bool {
    true
}

fn polling_default() -> f64 {
    DEFAULT_POLLING
}

fn memory_default() -> u64 {
    DEFAULT_MEMORY
}

fn cores_default() -> u32 {
    DEFAULT_CORES
}

fn disk_default() -> u64 {
    DEFAULT_DISK
}

impl WorkflowConfig {
    /// All defaults, bound to a job store locator and a workflow id.
    ///
    pub fn new(job_store: &str, workflow_id: &str) -> Self {
        WorkflowConfig {
            version: CONFIG_VERSION,
            job_store: job_store.to_owned(),
            workflow_id: workflow_id.to_owned(),
            workflow_attempt_number: 1,
            disable_shared_cache: false,
            read_global_file_mutable_by_default: false,
            use_async: true,
            service_polling_interval: DEFAULT_POLLING,
            default_memory: DEFAULT_MEMORY,
            default_cores: DEFAULT_CORES,
            default_disk: DEFAULT_DISK,
            default_cache: None,
            default_preemptable: false,
        }
    }

    /// Load a configuration from an HCL file.
    ///
    #[tracing::instrument]
    pub fn load(fname: &Path) -> Result<Self> {
        trace!("loading workflow config");

        let data = fs::read_to_string(fname)?;
        let cfg: WorkflowConfig = hcl::from_str(&data)?;
        debug!("cfg={:?}", cfg);

        if cfg.version != CONFIG_VERSION {
            return Err(eyre::eyre!(
                "bad version in {}: {} vs {CONFIG_VERSION}",
                fname.display(),
                cfg.version
            ));
        }
        Ok(cfg)
    }

    /// The effective cache budget default.
    ///
    pub fn default_cache(&self) -> u64 {
        self.default_cache.unwrap_or(self.default_disk)
    }

    /// Polling interval as a proper `Duration`.
    ///
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs_f64(self.service_polling_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_programmatic_defaults() {
        let cfg = WorkflowConfig::new("/tmp/store", "wf-1");
        assert_eq!(cfg.workflow_attempt_number, 1);
        assert!(cfg.use_async);
        assert_eq!(cfg.default_cache(), cfg.default_disk);
    }

    #[test]
    fn test_load_hcl() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
version = 1
job_store = "/var/run/atelier/store"
workflow_id = "wf-test"
use_async = false
service_polling_interval = 0.5
"#
        )
        .unwrap();

        let cfg = WorkflowConfig::load(f.path()).unwrap();
        assert_eq!(cfg.workflow_id, "wf-test");
        assert!(!cfg.use_async);
        assert_eq!(cfg.service_polling_interval, 0.5);
    }

    #[test]
    fn test_load_bad_version() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
version = 99
job_store = "/var/run/atelier/store"
workflow_id = "wf-test"
"#
        )
        .unwrap();

        assert!(WorkflowConfig::load(f.path()).is_err());
    }
}
