//! Per-job resource requests and their resolution against workflow defaults.
//!

use serde::{Deserialize, Serialize};

use crate::WorkflowConfig;

/// What a job asks for. Unset fields resolve to the workflow defaults.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Maximum bytes of memory the job needs
    pub memory: Option<u64>,
    /// CPU cores
    pub cores: Option<u32>,
    /// Bytes of local scratch disk
    pub disk: Option<u64>,
    /// Bytes of the disk request reserved for the shared cache
    pub cache: Option<u64>,
    /// May the job land on a preemptable node
    pub preemptable: Option<bool>,
}

/// A fully resolved resource request, as recorded on a wrapper.
///
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectiveResources {
    pub memory: u64,
    pub cores: u32,
    pub disk: u64,
    pub cache: u64,
    pub preemptable: bool,
}

impl Resources {
    /// Resolve unset fields against the workflow defaults. The cache request
    /// never exceeds the disk request.
    ///
    pub fn effective(&self, cfg: &WorkflowConfig) -> EffectiveResources {
        let disk = self.disk.unwrap_or(cfg.default_disk);
        let cache = self.cache.unwrap_or_else(|| cfg.default_cache()).min(disk);
        EffectiveResources {
            memory: self.memory.unwrap_or(cfg.default_memory),
            cores: self.cores.unwrap_or(cfg.default_cores),
            disk,
            cache,
            preemptable: self.preemptable.unwrap_or(cfg.default_preemptable),
        }
    }

    pub fn with_disk(mut self, disk: u64) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn with_memory(mut self, memory: u64) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = Some(cores);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, None, 2 * 1024 * 1024 * 1024)]
    #[case(Some(512), None, 512)]
    #[case(Some(512), Some(1024), 512)]
    fn test_cache_never_exceeds_disk(
        #[case] disk: Option<u64>,
        #[case] cache: Option<u64>,
        #[case] expected_cache: u64,
    ) {
        let cfg = WorkflowConfig::new("/tmp/store", "wf");
        let res = Resources {
            disk,
            cache,
            ..Resources::default()
        };
        assert_eq!(res.effective(&cfg).cache, expected_cache);
    }

    #[test]
    fn test_defaults_flow_through() {
        let cfg = WorkflowConfig::new("/tmp/store", "wf");
        let eff = Resources::default().effective(&cfg);
        assert_eq!(eff.memory, cfg.default_memory);
        assert_eq!(eff.cores, cfg.default_cores);
        assert_eq!(eff.disk, cfg.default_disk);
        assert!(!eff.preemptable);
    }
}
