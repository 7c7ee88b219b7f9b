//! The job store contract consumed by the core.
//!
//! The engine never implements a backend here; concrete stores (local
//! filesystem, object stores) live with the leader. Everything the core does
//! against the durable substrate goes through this trait.
//!

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use eyre::Result;

use crate::{EffectiveResources, JobWrapper, WorkflowConfig};

/// Identifier of a content file inside a job store.
pub type FileId = String;

/// Durable substrate holding wrappers, frozen jobs and content files.
///
/// Writes of new file ids are append-only; `update` of a wrapper is atomic
/// from any reader's point of view. The optional `cleanup` scope on write
/// operations ties the file's lifetime to the named wrapper: the store drops
/// the file when that wrapper is deleted.
///
pub trait JobStore: Send + Sync {
    fn config(&self) -> &WorkflowConfig;

    /// Allocate a wrapper with a unique id.
    fn create(
        &self,
        command: Option<String>,
        predecessor_number: u32,
        res: &EffectiveResources,
    ) -> Result<JobWrapper>;

    fn load(&self, wrapper_id: &str) -> Result<JobWrapper>;

    /// Atomic durable write of the wrapper.
    fn update(&self, wrapper: &JobWrapper) -> Result<()>;

    fn delete(&self, wrapper_id: &str) -> Result<()>;

    /// Record which wrapper is the workflow bootstrap.
    fn set_root_job(&self, wrapper_id: &str) -> Result<()>;

    fn write_file(&self, local: &Path, cleanup: Option<&str>) -> Result<FileId>;

    fn write_file_stream(&self, cleanup: Option<&str>) -> Result<(Box<dyn Write + Send>, FileId)>;

    /// Overwrite the content of an existing file id.
    fn update_file_stream(&self, id: &str) -> Result<Box<dyn Write + Send>>;

    /// Allocate an empty file, e.g. a promise placeholder or a service flag.
    fn get_empty_file_store_id(&self, cleanup: Option<&str>) -> Result<FileId>;

    fn read_file(&self, id: &str, local: &Path) -> Result<()>;

    fn read_file_stream(&self, id: &str) -> Result<Box<dyn Read + Send>>;

    /// Bootstrap files are kept under well-known names, see `FIRST_JOB`.
    fn read_shared_file_stream(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    fn delete_file(&self, id: &str) -> Result<()>;

    fn file_exists(&self, id: &str) -> Result<bool>;

    fn import_file(&self, src_url: &str) -> Result<FileId>;

    fn export_file(&self, id: &str, dst_url: &str) -> Result<()>;

    /// For a same-machine file-backed store, the absolute path of a stored
    /// file. `None` for remote backends; hard-link write-back and the nlink
    /// threshold probe key off this.
    fn local_file_path(&self, id: &str) -> Option<PathBuf> {
        let _ = id;
        None
    }

    /// Root directory of a same-machine file-backed store.
    fn local_root(&self) -> Option<&Path> {
        None
    }
}
