//! Shared fixtures: a disk-backed job store double and a minimal driver
//! that walks wrapper stacks the way the leader would.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use eyre::Result;

use atelier_common::{atomic_write, init_logging};
use atelier_engine::{
    DirectFileStore, EffectiveResources, FileId, JobStore, JobWrapper, Registry, StoreError,
    WorkerContext, WorkflowConfig, execute_job,
};

static LOG_INIT: Once = Once::new();

/// Stand up the tracing stack once per test binary so the engine's spans and
/// events flow through the real subscriber. Filtering stays on `RUST_LOG`.
pub fn init_test_logging() {
    LOG_INIT.call_once(|| {
        let _ = init_logging("atelier-tests", false, None);
    });
}

/// File-backed store double. With `link: true` it behaves like a local-file
/// backend on the same device: reads hand out hard links and
/// `local_file_path` is advertised. With `link: false` it copies, as a
/// remote backend would.
///
pub struct DiskJobStore {
    root: PathBuf,
    cfg: WorkflowConfig,
    link: bool,
    counter: AtomicU64,
    reads: AtomicU64,
    scopes: Mutex<HashMap<String, Vec<FileId>>>,
}

#[allow(dead_code)]
impl DiskJobStore {
    pub fn new(root: &Path) -> Arc<Self> {
        Self::with_config(root, true, test_config(root))
    }

    /// A store that never hands out hard links (copy semantics).
    pub fn copying(root: &Path) -> Arc<Self> {
        Self::with_config(root, false, test_config(root))
    }

    pub fn with_config(root: &Path, link: bool, cfg: WorkflowConfig) -> Arc<Self> {
        init_test_logging();
        fs::create_dir_all(root.join("files")).unwrap();
        fs::create_dir_all(root.join("jobs")).unwrap();
        fs::create_dir_all(root.join("shared")).unwrap();
        Arc::new(DiskJobStore {
            root: root.to_path_buf(),
            cfg,
            link,
            counter: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            scopes: Mutex::new(HashMap::new()),
        })
    }

    /// How many content reads hit the backend, for cache assertions.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn file_count(&self) -> usize {
        fs::read_dir(self.root.join("files")).unwrap().count()
    }

    pub fn job_count(&self) -> usize {
        fs::read_dir(self.root.join("jobs")).unwrap().count()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.counter.fetch_add(1, Ordering::SeqCst))
    }

    fn file_path(&self, id: &str) -> PathBuf {
        self.root.join("files").join(id)
    }

    fn wrapper_path(&self, id: &str) -> PathBuf {
        self.root.join("jobs").join(format!("{id}.json"))
    }

    fn track_scope(&self, scope: Option<&str>, id: &str) {
        if let Some(scope) = scope {
            self.scopes
                .lock()
                .unwrap()
                .entry(scope.to_owned())
                .or_default()
                .push(id.to_owned());
        }
    }
}

pub fn test_config(root: &Path) -> WorkflowConfig {
    let mut cfg = WorkflowConfig::new(&root.display().to_string(), "wf-test");
    cfg.service_polling_interval = 0.05;
    cfg
}

impl JobStore for DiskJobStore {
    fn config(&self) -> &WorkflowConfig {
        &self.cfg
    }

    fn create(
        &self,
        command: Option<String>,
        predecessor_number: u32,
        res: &EffectiveResources,
    ) -> Result<JobWrapper> {
        let id = self.next_id("job");
        let wrapper = JobWrapper::new(&id, command, predecessor_number, res);
        self.update(&wrapper)?;
        Ok(wrapper)
    }

    fn load(&self, wrapper_id: &str) -> Result<JobWrapper> {
        let path = self.wrapper_path(wrapper_id);
        if !path.exists() {
            return Err(StoreError::NoSuchJob(wrapper_id.to_owned()).into());
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn update(&self, wrapper: &JobWrapper) -> Result<()> {
        atomic_write(&self.wrapper_path(&wrapper.id), &serde_json::to_vec(wrapper)?)
    }

    fn delete(&self, wrapper_id: &str) -> Result<()> {
        let path = self.wrapper_path(wrapper_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        if let Some(scoped) = self.scopes.lock().unwrap().remove(wrapper_id) {
            for id in scoped {
                self.delete_file(&id)?;
            }
        }
        Ok(())
    }

    fn set_root_job(&self, wrapper_id: &str) -> Result<()> {
        fs::write(self.root.join("shared").join("rootJob"), wrapper_id)?;
        Ok(())
    }

    fn write_file(&self, local: &Path, cleanup: Option<&str>) -> Result<FileId> {
        let id = self.next_id("file");
        fs::copy(local, self.file_path(&id))?;
        self.track_scope(cleanup, &id);
        Ok(id)
    }

    fn write_file_stream(&self, cleanup: Option<&str>) -> Result<(Box<dyn Write + Send>, FileId)> {
        let id = self.next_id("file");
        let file = File::create(self.file_path(&id))?;
        self.track_scope(cleanup, &id);
        Ok((Box::new(file), id))
    }

    fn update_file_stream(&self, id: &str) -> Result<Box<dyn Write + Send>> {
        Ok(Box::new(File::create(self.file_path(id))?))
    }

    fn get_empty_file_store_id(&self, cleanup: Option<&str>) -> Result<FileId> {
        let id = self.next_id("file");
        File::create(self.file_path(&id))?;
        self.track_scope(cleanup, &id);
        Ok(id)
    }

    fn read_file(&self, id: &str, local: &Path) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let src = self.file_path(id);
        if !src.exists() {
            return Err(StoreError::NoSuchFile(id.to_owned()).into());
        }
        if self.link {
            if local.exists() {
                fs::remove_file(local)?;
            }
            fs::hard_link(&src, local)?;
        } else {
            fs::copy(&src, local)?;
        }
        Ok(())
    }

    fn read_file_stream(&self, id: &str) -> Result<Box<dyn Read + Send>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let src = self.file_path(id);
        if !src.exists() {
            return Err(StoreError::NoSuchFile(id.to_owned()).into());
        }
        Ok(Box::new(File::open(src)?))
    }

    fn read_shared_file_stream(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.root.join("shared").join(name))?))
    }

    fn delete_file(&self, id: &str) -> Result<()> {
        let path = self.file_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn file_exists(&self, id: &str) -> Result<bool> {
        Ok(self.file_path(id).exists())
    }

    fn import_file(&self, src_url: &str) -> Result<FileId> {
        self.write_file(Path::new(src_url), None)
    }

    fn export_file(&self, id: &str, dst_url: &str) -> Result<()> {
        fs::copy(self.file_path(id), dst_url)?;
        Ok(())
    }

    fn local_file_path(&self, id: &str) -> Option<PathBuf> {
        self.link.then(|| self.file_path(id))
    }

    fn local_root(&self) -> Option<&Path> {
        self.link.then_some(self.root.as_path())
    }
}

/// Run a wrapper and, depth-first, everything on its stack: children batch
/// first, follow-ons after. Once the whole workflow is done, every wrapper
/// is deleted, which also drops the files scoped to it. Returns the value
/// each job produced, in execution order.
///
#[allow(dead_code)]
pub fn run_workflow(
    store: &Arc<DiskJobStore>,
    registry: &Registry,
    root_wrapper_id: &str,
    workers_dir: &Path,
) -> Result<Vec<(String, serde_json::Value)>> {
    let mut results = vec![];
    run_wrapper(store, registry, root_wrapper_id, workers_dir, &mut results)?;

    // The leader drops a job only after it and all its transitive
    // successors have completed; for this driver that is workflow teardown.
    let ids: Vec<String> = fs::read_dir(store.root.join("jobs"))?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            e.path()
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
        })
        .collect();
    for id in ids {
        store.delete(&id)?;
    }
    Ok(results)
}

#[allow(dead_code)]
fn run_wrapper(
    store: &Arc<DiskJobStore>,
    registry: &Registry,
    wrapper_id: &str,
    workers_dir: &Path,
    results: &mut Vec<(String, serde_json::Value)>,
) -> Result<()> {
    let wrapper = store.load(wrapper_id)?;
    if wrapper.command.is_some() {
        let ctx = WorkerContext::new();
        let js: Arc<dyn JobStore> = store.clone();
        let base = workers_dir.join(wrapper_id);
        fs::create_dir_all(&base)?;
        let mut fs_store = DirectFileStore::new(js, ctx, &base, wrapper_id, None)?;
        let value = execute_job(wrapper, registry, &mut fs_store)?;
        results.push((wrapper_id.to_owned(), value));
    }

    let wrapper = store.load(wrapper_id)?;
    for batch in wrapper.stack.iter().rev() {
        for succ in batch {
            run_wrapper(store, registry, &succ.id, workers_dir, results)?;
        }
    }
    Ok(())
}
