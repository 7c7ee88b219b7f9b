//! Worker-side execution of one job.
//!
//! The worker loads the frozen body named by a wrapper's command, resolves
//! any promises baked into its arguments, runs the callable, freezes the
//! successors it created, and hands the wrapper to the file store's commit
//! protocol. A failed job leaves the wrapper untouched so the leader can
//! retry it as if it never ran.
//!

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::Result;
use serde_json::Value;
use strum::Display;
use tracing::{debug, trace};

use crate::{
    CachedFileStore, DirectFileStore, FileId, FileStore, FrozenJob, JobArg, JobBody, JobContext,
    JobGraph, JobSpec, JobStore, JobWrapper, ModuleRef, Registry, Resources, RvMap, modref,
    promise, serialize, service,
};

/// Shared state of one worker process. The original kept these as
/// module-level singletons; here the bootstrap creates exactly one context
/// and threads it through every component.
///
#[derive(Debug, Default)]
pub struct WorkerContext {
    /// File ids whose async write has not finished yet
    pending_writes: Mutex<HashSet<FileId>>,
    /// Tripped by any thread on unrecoverable failure
    terminate: AtomicBool,
    /// Files written or read by this worker that still live on local disk
    cache_locations: Mutex<HashMap<FileId, PathBuf>>,
    /// Promise files consumed by the current job, deleted after its commit
    promised_deletes: Mutex<BTreeSet<FileId>>,
}

impl WorkerContext {
    pub fn new() -> Arc<Self> {
        Arc::new(WorkerContext::default())
    }

    pub fn add_pending_write(&self, id: FileId) {
        self.pending_writes.lock().unwrap().insert(id);
    }

    pub fn remove_pending_write(&self, id: &str) {
        self.pending_writes.lock().unwrap().remove(id);
    }

    pub fn pending_writes(&self) -> HashSet<FileId> {
        self.pending_writes.lock().unwrap().clone()
    }

    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn terminated(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    pub fn record_cache_location(&self, id: &str, path: &Path) {
        self.cache_locations
            .lock()
            .unwrap()
            .insert(id.to_owned(), path.to_path_buf());
    }

    pub fn cache_location(&self, id: &str) -> Option<PathBuf> {
        self.cache_locations.lock().unwrap().get(id).cloned()
    }

    pub fn remove_cache_location(&self, id: &str) -> Option<PathBuf> {
        self.cache_locations.lock().unwrap().remove(id)
    }

    pub fn cache_locations(&self) -> Vec<(FileId, PathBuf)> {
        self.cache_locations
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn stage_promised_delete(&self, id: FileId) {
        self.promised_deletes.lock().unwrap().insert(id);
    }

    pub fn take_promised_deletes(&self) -> BTreeSet<FileId> {
        std::mem::take(&mut self.promised_deletes.lock().unwrap())
    }
}

/// Build the file store variant the workflow configuration asks for: the
/// cache-backed store by default, the plain one when the shared cache is
/// disabled.
///
pub fn make_file_store(
    store: Arc<dyn JobStore>,
    ctx: Arc<WorkerContext>,
    base_dir: &Path,
    wrapper: &JobWrapper,
    block_fn: Option<crate::BlockFn>,
) -> Result<Box<dyn FileStore>> {
    let direct = DirectFileStore::new(store.clone(), ctx, base_dir, &wrapper.id, block_fn)?;
    if store.config().disable_shared_cache {
        Ok(Box::new(direct))
    } else {
        Ok(Box::new(CachedFileStore::new(direct, wrapper)?))
    }
}

/// Phases a job goes through on a worker.
///
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum JobPhase {
    Loaded,
    Running,
    CommittingWrites,
    CommittingWrapper,
    Done,
    Failed,
}

/// A thawed job, ready to run: promises in the arguments have been replaced
/// by their values.
///
#[derive(Clone, Debug)]
pub struct LoadedJob {
    pub body: JobBody,
    pub module: ModuleRef,
    pub resources: Resources,
    pub checkpoint: bool,
    pub rvs: RvMap,
}

/// Decode a wrapper command into a runnable job.
///
/// Promise references dereference right here; the placeholder ids are queued
/// on the context for deletion once the job commits.
///
#[tracing::instrument(skip(store, registry, ctx))]
pub fn load_job(
    command: &str,
    store: &Arc<dyn JobStore>,
    registry: &Registry,
    ctx: &WorkerContext,
) -> Result<LoadedJob> {
    trace!("load_job");

    let (pickle_id, module) = modref::parse_command(command)?;
    let module = module.localize(registry)?;

    let stream = if pickle_id == modref::FIRST_JOB {
        store.read_shared_file_stream(modref::FIRST_JOB)?
    } else {
        store.read_file_stream(&pickle_id)?
    };
    let frozen: FrozenJob = serde_json::from_reader(stream)?;

    let mut body = frozen.body;
    for arg in body.args_mut() {
        match arg {
            JobArg::Value(_) => (),
            JobArg::PromiseRef(r) => {
                let value = promise::resolve(r, store.as_ref(), ctx)?;
                *arg = JobArg::Value(value);
            }
            JobArg::Promise(_) => {
                return Err(eyre::eyre!("frozen job still carries an unfrozen promise"));
            }
        }
    }

    Ok(LoadedJob {
        body,
        module,
        resources: frozen.resources,
        checkpoint: frozen.checkpoint,
        rvs: frozen.rvs,
    })
}

/// Run one job to completion and publish its effects.
///
/// On success the wrapper is updated atomically with the job's new stack,
/// services and staged deletions. On failure the terminate flag is set and
/// the wrapper is left exactly as it was.
///
#[tracing::instrument(skip_all, fields(wrapper = %wrapper.id))]
pub fn execute_job(
    mut wrapper: JobWrapper,
    registry: &Registry,
    fs: &mut dyn FileStore,
) -> Result<Value> {
    let store = fs.job_store().clone();
    let ctx = fs.context().clone();

    let command = wrapper
        .command
        .clone()
        .ok_or_else(|| eyre::eyre!("wrapper {} has no command to run", wrapper.id))?;
    let loaded = load_job(&command, &store, registry, &ctx)?;
    debug!("job {}: {}", wrapper.id, JobPhase::Loaded);

    fs.open_job(&loaded.resources.effective(store.config()))?;

    let out = run_loaded(&mut wrapper, &loaded, registry, fs, &store, &ctx);
    let closed = fs.close_job();

    match &out {
        Ok(_) => debug!("job {}: {}", wrapper.id, JobPhase::Done),
        Err(e) => {
            debug!("job {}: {} ({e})", wrapper.id, JobPhase::Failed);
            ctx.terminate();
        }
    }
    closed?;
    out
}

fn run_loaded(
    wrapper: &mut JobWrapper,
    loaded: &LoadedJob,
    registry: &Registry,
    fs: &mut dyn FileStore,
    store: &Arc<dyn JobStore>,
    ctx: &Arc<WorkerContext>,
) -> Result<Value> {
    // Rebuild the job as the root of a fresh graph so its run method can
    // wire successors under it.
    let mut graph = JobGraph::new(loaded.module.clone());
    let me = graph.add(JobSpec {
        body: loaded.body.clone(),
        resources: loaded.resources,
        checkpoint: loaded.checkpoint,
    });
    graph.node_mut(me).rvs = loaded.rvs.clone();

    let args: Vec<Value> = loaded
        .body
        .args()
        .iter()
        .map(|a| match a {
            JobArg::Value(v) => v.clone(),
            _ => Value::Null,
        })
        .collect();

    debug!("job {}: {}", wrapper.id, JobPhase::Running);
    let values = match &loaded.body {
        JobBody::Runnable { name, .. } => {
            let runnable = registry.runnable(name)?;
            let mut cx = JobContext {
                graph: &mut graph,
                current: me,
                fs: &mut *fs,
            };
            runnable.run(&mut cx, &args)?
        }
        JobBody::Function { name, .. } => {
            let f = registry.function(name)?;
            f(&args)?
        }
        JobBody::JobFunction { name, .. } => {
            let f = registry.job_function(name)?;
            let mut cx = JobContext {
                graph: &mut graph,
                current: me,
                fs: &mut *fs,
            };
            f(&mut cx, &args)?
        }
        JobBody::Service { name, config } => {
            let credentials = service::run_service(name, config, &loaded.rvs, wrapper, registry, fs)?;
            // The credentials were materialized during startup; a second
            // fulfil pass after the run must not clobber them.
            graph.node_mut(me).rvs.clear();
            // A service job never records successors of its own.
            wrapper.stack = vec![vec![], vec![]];
            credentials
        }
        JobBody::Noop => Value::Null,
    };

    serialize::serialise_existing_job(&mut graph, me, wrapper, store, &values)?;

    // Promise files this job consumed are spent; checkpoint jobs keep them
    // around for replay instead.
    let promised = ctx.take_promised_deletes();
    if loaded.checkpoint {
        wrapper.checkpoint_files_to_delete = promised.into_iter().collect();
    } else {
        for id in promised {
            fs.delete_global_file(&id)?;
        }
    }

    debug!("job {}: {}", wrapper.id, JobPhase::CommittingWrites);
    fs.commit(wrapper.clone())?;
    debug!("job {}: {}", wrapper.id, JobPhase::CommittingWrapper);
    fs.wait_for_commit()?;
    Ok(values)
}
