//! The per-job facade over the job store.
//!
//! A file store hands the running job its temporary directories, moves
//! produced files into the job store (asynchronously where possible), reads
//! global files back, stages deletions, and finally publishes the job's
//! wrapper in one atomic step once every write has landed.
//!

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use eyre::Result;
use tracing::{Level, debug, error, info, trace, warn};
use uuid::Uuid;

use atelier_common::{make_public_dir, make_read_only, make_writable, nlink};

use crate::{EffectiveResources, FileId, JobStore, JobWrapper, StoreError, WorkerContext};

/// Size of the worker pool draining the async write queue.
const WRITE_WORKERS: usize = 2;

/// Copy chunk for streaming a produced file into the store.
const COPY_CHUNK: usize = 1_000_000;

/// How long a write worker blocks on the queue before checking the
/// terminate flag.
const QUEUE_TICK: Duration = Duration::from_secs(2);

/// Called by the commit protocol before the wrapper is published; the worker
/// uses it to make sure upstream data this job consumed has itself been
/// durably recorded.
pub type BlockFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// The operations a running job (and the worker around it) performs against
/// its file store.
///
pub trait FileStore {
    fn job_store(&self) -> &Arc<dyn JobStore>;
    fn context(&self) -> &Arc<WorkerContext>;
    /// The per-invocation working directory of the current job.
    fn working_dir(&self) -> &Path;

    /// Enter a job: allocate the invocation working directory and, for the
    /// cached variant, reserve the job's disk against the cache.
    fn open_job(&mut self, reqs: &EffectiveResources) -> Result<()>;
    /// Leave a job: tear down its local files.
    fn close_job(&mut self) -> Result<()>;

    fn local_temp_dir(&mut self) -> Result<PathBuf>;
    fn local_temp_file(&mut self) -> Result<PathBuf>;
    fn local_temp_file_name(&mut self) -> Result<PathBuf>;

    fn write_global_file(&mut self, local: &Path, cleanup: bool) -> Result<FileId>;
    fn write_global_file_stream(&mut self, cleanup: bool)
    -> Result<(Box<dyn Write + Send>, FileId)>;
    fn read_global_file(
        &mut self,
        id: &str,
        user_path: Option<&Path>,
        cache: bool,
        mutable: Option<bool>,
    ) -> Result<PathBuf>;
    fn read_global_file_stream(&mut self, id: &str) -> Result<Box<dyn Read + Send>>;
    fn delete_local_file(&mut self, id: &str) -> Result<()>;
    /// Stage a global deletion; it runs only after the job has committed.
    fn delete_global_file(&mut self, id: &str) -> Result<()>;

    fn import_file(&mut self, src_url: &str) -> Result<FileId>;
    fn export_file(&mut self, id: &str, dst_url: &str) -> Result<()>;

    /// Record a message shipped to the leader with the job's commit.
    fn log_to_leader(&mut self, msg: &str, level: Level);

    fn stage_wrapper_delete(&mut self, wrapper_id: &str);

    /// Publish the job: join the writers, run the block function, then
    /// atomically update the wrapper and execute staged deletions.
    fn commit(&mut self, wrapper: JobWrapper) -> Result<()>;
    /// Block until an in-flight commit has finished and surface its result.
    fn wait_for_commit(&mut self) -> Result<()>;
}

// ------ async write pipeline ------

pub(crate) struct WriteItem {
    pub(crate) file: File,
    pub(crate) file_id: FileId,
}

/// Fixed pool of writer threads draining a queue of open file handles.
/// Handles are kept open so a source file deleted on disk still gets its
/// content committed. Shutdown is one `None` per worker.
///
pub(crate) struct WritePool {
    tx: Option<mpsc::Sender<Option<WriteItem>>>,
    workers: Vec<JoinHandle<()>>,
}

impl WritePool {
    pub(crate) fn new(store: Arc<dyn JobStore>, ctx: Arc<WorkerContext>) -> Self {
        let (tx, rx) = mpsc::channel::<Option<WriteItem>>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..WRITE_WORKERS)
            .map(|i| {
                let rx = rx.clone();
                let store = store.clone();
                let ctx = ctx.clone();
                thread::Builder::new()
                    .name(format!("write-{i}"))
                    .spawn(move || write_loop(&rx, &store, &ctx))
                    .expect("cannot spawn write worker")
            })
            .collect();
        WritePool {
            tx: Some(tx),
            workers,
        }
    }

    pub(crate) fn enqueue(&self, item: WriteItem) -> Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(Some(item))
                .map_err(|_| eyre::eyre!("write pool is gone")),
            None => Err(eyre::eyre!("write pool already shut down")),
        }
    }

    /// Poison-pill shutdown, then join every worker.
    ///
    pub(crate) fn join(mut self) -> Result<()> {
        trace!("WritePool::join");
        if let Some(tx) = self.tx.take() {
            for _ in &self.workers {
                let _ = tx.send(None);
            }
        }
        for h in self.workers.drain(..) {
            h.join().map_err(|_| eyre::eyre!("write worker panicked"))?;
        }
        Ok(())
    }
}

fn write_loop(
    rx: &Arc<Mutex<mpsc::Receiver<Option<WriteItem>>>>,
    store: &Arc<dyn JobStore>,
    ctx: &Arc<WorkerContext>,
) {
    loop {
        let msg = {
            let rx = rx.lock().unwrap();
            rx.recv_timeout(QUEUE_TICK)
        };
        match msg {
            Err(RecvTimeoutError::Timeout) => {
                if ctx.terminated() {
                    debug!("termination flag observed, write worker exiting");
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) | Ok(None) => break,
            Ok(Some(WriteItem { mut file, file_id })) => {
                match stream_to_store(&mut file, &file_id, store.as_ref()) {
                    Ok(()) => ctx.remove_pending_write(&file_id),
                    Err(e) => {
                        error!("async write of {file_id} failed: {e}");
                        ctx.terminate();
                        break;
                    }
                }
            }
        }
    }
}

fn stream_to_store(file: &mut File, id: &str, store: &dyn JobStore) -> Result<()> {
    let mut out = store.update_file_stream(id)?;
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }
    out.flush()?;
    Ok(())
}

// ------ commit gating ------

/// Single-commit gate. Held from `commit` until the commit thread has fully
/// finished, so acquiring and releasing it acts as "wait for the commit".
///
#[derive(Clone, Default)]
pub(crate) struct CommitGate(Arc<(Mutex<bool>, Condvar)>);

impl CommitGate {
    fn begin(&self) {
        let (flag, cond) = &*self.0;
        let mut busy = flag.lock().unwrap();
        while *busy {
            busy = cond.wait(busy).unwrap();
        }
        *busy = true;
    }

    fn end(&self) {
        let (flag, cond) = &*self.0;
        *flag.lock().unwrap() = false;
        cond.notify_all();
    }

    fn wait(&self) {
        let (flag, cond) = &*self.0;
        let mut busy = flag.lock().unwrap();
        while *busy {
            busy = cond.wait(busy).unwrap();
        }
    }
}

// ------ the plain file store ------

/// Baseline file store: no shared cache, files written straight to the job
/// store (asynchronously when they originate under the job's temp tree).
///
pub struct DirectFileStore {
    store: Arc<dyn JobStore>,
    ctx: Arc<WorkerContext>,
    /// Worker-level directory; invocation dirs are created below it
    base_dir: PathBuf,
    work_dir: PathBuf,
    wrapper_id: String,
    mutable_default: bool,
    reqs: Option<EffectiveResources>,
    files_to_delete: BTreeSet<FileId>,
    wrappers_to_delete: BTreeSet<String>,
    logging_messages: Vec<(String, String)>,
    pool: Option<WritePool>,
    block_fn: Option<BlockFn>,
    gate: CommitGate,
    commit_handle: Option<JoinHandle<Result<()>>>,
}

impl DirectFileStore {
    /// Build a file store bound to one wrapper. The write workers start
    /// immediately.
    ///
    pub fn new(
        store: Arc<dyn JobStore>,
        ctx: Arc<WorkerContext>,
        base_dir: &Path,
        wrapper_id: &str,
        block_fn: Option<BlockFn>,
    ) -> Result<Self> {
        trace!("DirectFileStore::new({wrapper_id})");

        let mutable_default = store.config().read_global_file_mutable_by_default;
        let pool = WritePool::new(store.clone(), ctx.clone());
        Ok(DirectFileStore {
            store,
            ctx,
            base_dir: base_dir.to_path_buf(),
            work_dir: base_dir.to_path_buf(),
            wrapper_id: wrapper_id.to_owned(),
            mutable_default,
            reqs: None,
            files_to_delete: BTreeSet::new(),
            wrappers_to_delete: BTreeSet::new(),
            logging_messages: vec![],
            pool: Some(pool),
            block_fn,
            gate: CommitGate::default(),
            commit_handle: None,
        })
    }

    pub(crate) fn abspath(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.work_dir.join(p)
        }
    }

    pub(crate) fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub(crate) fn mutable_default(&self) -> bool {
        self.mutable_default
    }

    pub(crate) fn cleanup_scope(&self, cleanup: bool) -> Option<String> {
        cleanup.then(|| self.wrapper_id.clone())
    }

    pub(crate) fn enqueue_write(&mut self, file: File, id: &FileId) -> Result<()> {
        self.ctx.add_pending_write(id.clone());
        match &self.pool {
            Some(pool) => pool.enqueue(WriteItem {
                file,
                file_id: id.clone(),
            }),
            None => Err(eyre::eyre!("file store already committed")),
        }
    }

    pub(crate) fn is_staged_for_deletion(&self, id: &str) -> bool {
        self.files_to_delete.contains(id)
    }

    pub(crate) fn stage_file_delete(&mut self, id: &str) {
        self.files_to_delete.insert(id.to_owned());
    }

    /// Messages queued for the leader, drained with the commit.
    ///
    pub fn logging_messages(&self) -> &[(String, String)] {
        &self.logging_messages
    }

    /// Remove everything under the worker directory except files registered
    /// in the local-copy map, trimming that map down to the cache budget
    /// first. Oldest files leave first.
    ///
    fn clean_local_tree(&mut self) -> Result<()> {
        let cache_size = self.reqs.map(|r| r.cache).unwrap_or(0);
        let pending = self.ctx.pending_writes();

        let mut entries = vec![];
        let mut total: u64 = 0;
        for (id, path) in self.ctx.cache_locations() {
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            total += meta.len();
            if !pending.contains(&id) {
                entries.push((meta.modified()?, meta.len(), id, path));
            }
        }
        entries.sort();
        entries.reverse();
        while total > cache_size {
            let Some((_, len, id, path)) = entries.pop() else {
                break;
            };
            debug!("evicting local copy {} for {id}", path.display());
            fs::remove_file(&path)?;
            self.ctx.remove_cache_location(&id);
            total -= len;
        }

        let keep: BTreeSet<PathBuf> = self
            .ctx
            .cache_locations()
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        clean_dir(&self.base_dir, &keep, false)?;
        Ok(())
    }
}

/// Recursively remove `dir`'s content, keeping files in `keep` and any
/// directory still holding one. Returns whether `dir` ended up removable.
///
fn clean_dir(dir: &Path, keep: &BTreeSet<PathBuf>, remove_self: bool) -> Result<bool> {
    let mut removable = true;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            removable &= clean_dir(&path, keep, true)?;
        } else if keep.contains(&path) {
            removable = false;
        } else {
            fs::remove_file(&path)?;
        }
    }
    if removable && remove_self {
        fs::remove_dir(dir)?;
    }
    Ok(removable)
}

pub(crate) fn log_at(level: Level, msg: &str) {
    match level {
        Level::ERROR => error!("LOG-TO-LEADER: {msg}"),
        Level::WARN => warn!("LOG-TO-LEADER: {msg}"),
        Level::INFO => info!("LOG-TO-LEADER: {msg}"),
        Level::DEBUG => debug!("LOG-TO-LEADER: {msg}"),
        Level::TRACE => trace!("LOG-TO-LEADER: {msg}"),
    }
}

impl FileStore for DirectFileStore {
    fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }

    fn working_dir(&self) -> &Path {
        &self.work_dir
    }

    #[tracing::instrument(skip(self))]
    fn open_job(&mut self, reqs: &EffectiveResources) -> Result<()> {
        self.work_dir = make_public_dir(&self.base_dir.join(Uuid::new_v4().to_string()))?;
        self.reqs = Some(*reqs);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn close_job(&mut self) -> Result<()> {
        self.clean_local_tree()
    }

    fn local_temp_dir(&mut self) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix("t")
            .tempdir_in(&self.work_dir)?;
        Ok(dir.into_path())
    }

    fn local_temp_file(&mut self) -> Result<PathBuf> {
        let f = tempfile::Builder::new()
            .prefix("tmp")
            .suffix(".tmp")
            .tempfile_in(&self.work_dir)?;
        let (_, path) = f.keep()?;
        Ok(path)
    }

    fn local_temp_file_name(&mut self) -> Result<PathBuf> {
        let path = self.local_temp_file()?;
        fs::remove_file(&path)?;
        Ok(path)
    }

    #[tracing::instrument(skip(self))]
    fn write_global_file(&mut self, local: &Path, cleanup: bool) -> Result<FileId> {
        let abs = self.abspath(local);
        let scope = self.cleanup_scope(cleanup);

        if abs.starts_with(&self.work_dir) {
            // Asynchronous path: keep a handle open, ship it to the writers.
            let id = self.store.get_empty_file_store_id(scope.as_deref())?;
            let file = File::open(&abs)?;
            // Guard the source against accidental modification while the
            // write is in flight. Not fatal when we don't own the file.
            let _ = make_read_only(&abs);
            self.enqueue_write(file, &id)?;
            self.ctx.record_cache_location(&id, &abs);
            Ok(id)
        } else {
            self.store.write_file(&abs, scope.as_deref())
        }
    }

    fn write_global_file_stream(
        &mut self,
        cleanup: bool,
    ) -> Result<(Box<dyn Write + Send>, FileId)> {
        let scope = self.cleanup_scope(cleanup);
        self.store.write_file_stream(scope.as_deref())
    }

    #[tracing::instrument(skip(self))]
    fn read_global_file(
        &mut self,
        id: &str,
        user_path: Option<&Path>,
        cache: bool,
        mutable: Option<bool>,
    ) -> Result<PathBuf> {
        if self.files_to_delete.contains(id) {
            return Err(StoreError::Deleted(id.to_owned()).into());
        }
        let mutable = mutable.unwrap_or(self.mutable_default);
        let user_path = user_path.map(|p| self.abspath(p));
        let cache = cache
            && user_path
                .as_ref()
                .map(|p| p.starts_with(&self.work_dir))
                .unwrap_or(true);

        if let Some(cached) = self.ctx.cache_location(id) {
            if cache && !mutable {
                return match user_path {
                    None => Ok(cached),
                    Some(up) if up == cached => Ok(cached),
                    Some(up) => {
                        if up.exists() {
                            fs::remove_file(&up)?;
                        }
                        fs::hard_link(&cached, &up)?;
                        make_read_only(&up)?;
                        Ok(up)
                    }
                };
            }
            let local = match user_path {
                Some(up) => up,
                None => self.local_temp_file()?,
            };
            fs::copy(&cached, &local)?;
            make_writable(&local)?;
            return Ok(local);
        }

        let local = match user_path {
            Some(up) => up,
            None => self.local_temp_file()?,
        };
        self.store.read_file(id, &local)?;
        if mutable {
            // A local-file store on the same device may have handed us a
            // hard link; break it so writes stay private.
            if self.store.local_root().is_some() && nlink(&local)? >= 2 {
                let tmp = PathBuf::from(format!("{}.tmp", local.display()));
                fs::copy(&local, &tmp)?;
                fs::rename(&tmp, &local)?;
            }
            make_writable(&local)?;
        } else {
            make_read_only(&local)?;
        }
        if cache {
            self.ctx.record_cache_location(id, &local);
            make_read_only(&local)?;
        }
        Ok(local)
    }

    fn read_global_file_stream(&mut self, id: &str) -> Result<Box<dyn Read + Send>> {
        if self.files_to_delete.contains(id) {
            return Err(StoreError::Deleted(id.to_owned()).into());
        }
        if let Some(cached) = self.ctx.cache_location(id) {
            return Ok(Box::new(File::open(cached)?));
        }
        self.store.read_file_stream(id)
    }

    fn delete_local_file(&mut self, id: &str) -> Result<()> {
        if let Some(path) = self.ctx.remove_cache_location(id) {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn delete_global_file(&mut self, id: &str) -> Result<()> {
        trace!("delete_global_file({id})");
        self.files_to_delete.insert(id.to_owned());
        self.ctx.remove_cache_location(id);
        Ok(())
    }

    fn import_file(&mut self, src_url: &str) -> Result<FileId> {
        self.store.import_file(src_url)
    }

    fn export_file(&mut self, id: &str, dst_url: &str) -> Result<()> {
        self.store.export_file(id, dst_url)
    }

    fn log_to_leader(&mut self, msg: &str, level: Level) {
        log_at(level, msg);
        self.logging_messages
            .push((level.to_string(), msg.to_owned()));
    }

    fn stage_wrapper_delete(&mut self, wrapper_id: &str) {
        self.wrappers_to_delete.insert(wrapper_id.to_owned());
    }

    #[tracing::instrument(skip_all, fields(wrapper = %wrapper.id))]
    fn commit(&mut self, mut wrapper: JobWrapper) -> Result<()> {
        trace!("commit({})", wrapper.id);

        self.gate.begin();
        let pool = self.pool.take();
        let block_fn = self.block_fn.take();
        let store = self.store.clone();
        let ctx = self.ctx.clone();
        let files: Vec<FileId> = self.files_to_delete.iter().cloned().collect();
        let wrappers: Vec<String> = self.wrappers_to_delete.iter().cloned().collect();
        let gate = self.gate.clone();

        let spawned = thread::Builder::new().name("commit".into()).spawn(move || {
            let res = (|| -> Result<()> {
                // 1. Everything this job wrote must be durable first.
                if let Some(pool) = pool {
                    pool.join()?;
                }
                // 2. And everything it consumed, which is the caller's call.
                if let Some(f) = block_fn {
                    f()?;
                }
                // 3. A tripped terminate flag means some writer died; the
                // wrapper must stay untouched so the leader retries cleanly.
                if ctx.terminated() {
                    eyre::bail!("the termination flag is set, exiting before update");
                }
                // 4.-5. Stamp the staged deletions and publish. This update
                // is the linearization point of the whole job.
                wrapper.files_to_delete = files.clone();
                store.update(&wrapper)?;
                // 6. Only now is it safe to actually delete.
                for w in &wrappers {
                    store.delete(w)?;
                }
                for f in &files {
                    store.delete_file(f)?;
                }
                // 7. Record that the deletions went through.
                if !files.is_empty() {
                    wrapper.files_to_delete.clear();
                    store.update(&wrapper)?;
                }
                Ok(())
            })();
            if res.is_err() {
                ctx.terminate();
            }
            gate.end();
            res
        });

        match spawned {
            Ok(handle) => {
                self.commit_handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.gate.end();
                Err(e.into())
            }
        }
    }

    fn wait_for_commit(&mut self) -> Result<()> {
        self.gate.wait();
        match self.commit_handle.take() {
            Some(h) => h.join().map_err(|_| eyre::eyre!("commit thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for DirectFileStore {
    fn drop(&mut self) {
        // Dropping the sender unblocks any worker still waiting on the
        // queue; an unjoined pool winds down on its own.
        self.pool.take();
    }
}
