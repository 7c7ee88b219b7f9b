//! All typed errors raised by the engine, one enum per area.
//!

use thiserror::Error;

use crate::FileId;

/// Graph validation failures. Raised at submission time, before anything
/// touches the job store.
///
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph contains no root jobs due to cycles")]
    NoRoots,
    #[error("graph does not contain exactly one root job: {0:?}")]
    MultipleRoots(Vec<String>),
    #[error("a cycle of job dependencies has been detected: {0:?}")]
    Cycle(Vec<String>),
    #[error("new checkpoint job {0} is not a leaf in the job graph")]
    CheckpointNotLeaf(String),
}

/// Authoring-time wiring misuse.
///
#[derive(Debug, Error)]
pub enum JobError {
    #[error("the given job is already a predecessor of this job")]
    DuplicatePredecessor,
    #[error("parent service is not a service of the given job")]
    ForeignParentService,
    #[error("the service is already attached to a job")]
    ServiceAlreadyAttached,
    #[error("malformed job command {0:?}")]
    BadCommand(String),
    #[error("nothing registered under the name {0}")]
    Unregistered(String),
    #[error("module {0} is not loadable on this worker")]
    UnknownModule(String),
}

/// Promise protocol violations. Fatal for the consumer job.
///
#[derive(Debug, Error)]
pub enum PromiseError {
    #[error("the promising job is not a predecessor of the job receiving the promise")]
    Misuse,
    #[error("promise file {0} has not been filled by the promising job")]
    Unfulfilled(FileId),
    #[error("cannot decode the promised value held in file {0}")]
    Decode(FileId),
    #[error("return value of the promising job has no item at index {0}")]
    BadIndex(usize),
}

/// Cache protocol violations and exhaustion.
///
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("attempting to re-cache file {0}")]
    Recache(String),
    #[error("cache-tracked file {0} was deleted externally, use delete_local_file for such files")]
    TrackedFileDeleted(String),
    #[error("attempting to cache a file across devices: cache={cache}, file={file}")]
    CrossDevice { cache: String, file: String },
    #[error("attempting a cache operation on non-local file {0}")]
    NonLocalSrc(String),
    #[error("unable to free up enough cache space for a reservation of {0} bytes")]
    OutOfCacheSpace(i64),
    #[error("cached file {0} is in use by another job")]
    InUse(String),
}

/// Misuse of the job store as seen from the file store facade.
///
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such file in the job store: {0}")]
    NoSuchFile(FileId),
    #[error("no such job in the job store: {0}")]
    NoSuchJob(String),
    #[error("trying to access a file in the job store you have deleted: {0}")]
    Deleted(FileId),
    #[error("local file {0} already exists, cannot overwrite")]
    Exists(String),
}
