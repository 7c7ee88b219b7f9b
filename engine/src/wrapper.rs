//! The job-store-resident record kept per job.
//!
//! A wrapper is created during serialization, mutated only by the worker
//! that owns the currently executing job, and deleted by the leader once the
//! job and all its transitive successors have completed.
//!

use serde::{Deserialize, Serialize};

use crate::{EffectiveResources, FileId};

/// One successor entry inside a stack batch.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuccessorRef {
    pub id: String,
    pub memory: u64,
    pub cores: u32,
    pub disk: u64,
    pub preemptable: bool,
    /// Fresh uuid iff the successor has more than one predecessor
    pub predecessor_tag: Option<String>,
}

/// One service entry, grouped per depth on the owning wrapper.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub id: String,
    pub memory: u64,
    pub cores: u32,
    pub disk: u64,
    pub start_file: FileId,
    pub terminate_file: FileId,
    pub error_file: FileId,
}

/// The durable metadata record for one job.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobWrapper {
    pub id: String,
    /// Token sequence referencing the frozen job body, `None` once run
    pub command: Option<String>,
    pub memory: u64,
    pub cores: u32,
    pub disk: u64,
    pub preemptable: bool,
    pub predecessor_number: u32,
    /// Batches of successors, in the order they were recorded; the batch on
    /// top (the end) runs first
    pub stack: Vec<Vec<SuccessorRef>>,
    /// Services to run alongside this job, one list per tree depth
    pub services: Vec<Vec<ServiceRef>>,
    /// Staged global deletions, stamped at commit time
    pub files_to_delete: Vec<FileId>,
    /// Promise files a checkpoint job retains for replay
    pub checkpoint_files_to_delete: Vec<FileId>,
    pub start_file: Option<FileId>,
    pub terminate_file: Option<FileId>,
    pub error_file: Option<FileId>,
}

impl JobWrapper {
    /// Fresh wrapper with the given id, command and resolved resources.
    ///
    pub fn new(
        id: &str,
        command: Option<String>,
        predecessor_number: u32,
        res: &EffectiveResources,
    ) -> Self {
        JobWrapper {
            id: id.to_owned(),
            command,
            memory: res.memory,
            cores: res.cores,
            disk: res.disk,
            preemptable: res.preemptable,
            predecessor_number,
            ..JobWrapper::default()
        }
    }
}
