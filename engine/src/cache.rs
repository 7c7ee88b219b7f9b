//! The node-wide content cache shared by every worker process.
//!
//! Cache entries are store files named by the url-safe base64 of their file
//! id. All bookkeeping lives in a single state file mutated only under an
//! advisory lock on `.cacheLock`, and every mutation upholds the caching
//! equation `cached + sigma_job <= total`. In-flight downloads are marked by
//! a hidden harbinger file so at most one worker per node fetches any given
//! file id.
//!

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use eyre::Result;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{Level, debug, info, trace, warn};
use uuid::Uuid;

use atelier_common::{
    atomic_write, make_public_dir, make_read_only, make_writable, nlink, same_device,
};

use crate::filestore::DirectFileStore;
use crate::{
    CacheError, EffectiveResources, FileId, FileStore, JobStore, JobWrapper, StoreError,
    WorkerContext, modref,
};

/// Name of the advisory lock file inside the cache directory.
const CACHE_LOCK: &str = ".cacheLock";

/// Name of the serialized cache state inside the cache directory.
const CACHE_STATE: &str = "_cacheState";

/// How long a worker sleeps between checks for a competing download.
const HARBINGER_POLL: Duration = Duration::from_secs(1);

/// Map key for a store file tracked without a local path.
fn path_key(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}

/// Hidden entries are excluded from eviction scans and size recounts.
fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

// ------ on-disk state ------

/// Disk bookkeeping of one job: its reservation, its working directory and
/// the files it touched. `job_specific_files` and `files_to_fsids` are
/// mutual inverses; a size of -1 marks a mutably owned copy, 0 a copy that
/// does not count against the cache.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobState {
    pub job_reqs: i64,
    pub job_dir: PathBuf,
    pub job_specific_files: BTreeMap<FileId, BTreeMap<String, i64>>,
    pub files_to_fsids: BTreeMap<String, BTreeSet<FileId>>,
}

impl JobState {
    /// Record a local path for a file id. With `cached` the file's size is
    /// handed back to the job's reservation.
    ///
    fn add_file(&mut self, id: &str, path: Option<&Path>, size: i64, cached: bool) -> Result<()> {
        let key = path_key(path);
        let entry = self.job_specific_files.entry(id.to_owned()).or_default();
        if entry.contains_key(&key) {
            return Err(eyre::eyre!("file {id} already recorded at {key}"));
        }
        entry.insert(key.clone(), size);
        self.files_to_fsids.entry(key).or_default().insert(id.to_owned());
        if cached {
            self.job_reqs -= size;
        }
        Ok(())
    }

    fn drop_record(&mut self, id: &str, key: &str) {
        if let Some(paths) = self.job_specific_files.get_mut(id) {
            paths.remove(key);
            if paths.is_empty() {
                self.job_specific_files.remove(id);
            }
        }
        if let Some(ids) = self.files_to_fsids.get_mut(key) {
            ids.remove(id);
            if ids.is_empty() {
                self.files_to_fsids.remove(key);
            }
        }
    }

    fn sole_owner(&self, key: &str) -> bool {
        self.files_to_fsids
            .get(key)
            .map(|ids| ids.len() <= 1)
            .unwrap_or(true)
    }
}

/// The node cache ledger, serialized to `_cacheState` with a write-rename on
/// every mutation.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheState {
    pub nlink: u32,
    pub attempt_number: u32,
    pub total: i64,
    pub cached: i64,
    pub sigma_job: i64,
    pub cache_dir: PathBuf,
    pub job_state: BTreeMap<String, JobState>,
}

impl CacheState {
    /// The caching equation: committed cache plus live reservations never
    /// exceed capacity.
    ///
    pub fn is_balanced(&self) -> bool {
        self.cached + self.sigma_job <= self.total
    }

    fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn write(&self, path: &Path) -> Result<()> {
        atomic_write(path, &serde_json::to_vec(self)?)
    }
}

// ------ the lock ------

/// Exclusive advisory lock on the cache lock file. Released on drop.
///
struct CacheLock {
    file: File,
}

impl CacheLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        trace!("obtained cache lock on {}", path.display());
        Ok(CacheLock { file })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        trace!("released cache lock");
    }
}

// ------ the cached store ------

/// Cache-enabled file store: the plain store plus the node cache.
///
pub struct CachedFileStore {
    base: DirectFileStore,
    cache_dir: PathBuf,
    lock_file: PathBuf,
    state_file: PathBuf,
    /// 2 when the job store shares a device with the cache (hard links), 1
    /// otherwise (copies)
    nlink_threshold: u32,
    /// Identity of the current job inside the shared state file
    job_key: String,
    /// Original disk reservation of the current job
    job_reqs: i64,
    cleanup_in_progress: bool,
}

impl CachedFileStore {
    /// Wrap a plain file store with the node cache, creating or adopting the
    /// cache directory next to the worker directory.
    ///
    #[tracing::instrument(skip_all, fields(wrapper = %wrapper.id))]
    pub fn new(base: DirectFileStore, wrapper: &JobWrapper) -> Result<Self> {
        let store = base.job_store().clone();
        let parent = base
            .base_dir()
            .parent()
            .ok_or_else(|| eyre::eyre!("worker directory has no parent"))?
            .to_path_buf();
        let cache_dir = parent.join(format!("cache-{}", store.config().workflow_id));

        // One job, one stable key: the pickle file id out of the command.
        let job_key = match &wrapper.command {
            Some(cmd) => modref::parse_command(cmd)?.0,
            None => wrapper.id.clone(),
        };

        let mut cached = CachedFileStore {
            lock_file: cache_dir.join(CACHE_LOCK),
            state_file: cache_dir.join(CACHE_STATE),
            cache_dir,
            base,
            nlink_threshold: 1,
            job_key,
            job_reqs: 0,
            cleanup_in_progress: false,
        };
        cached.setup_cache(&parent)?;
        Ok(cached)
    }

    /// Create the cache directory if this worker is first on the node, or
    /// adopt the existing one; a lost creation race is resolved by the
    /// rename failing against the non-empty winner.
    ///
    fn setup_cache(&mut self, parent: &Path) -> Result<()> {
        let store = self.base.job_store().clone();
        let cfg = store.config().clone();

        let threshold = match store.local_root() {
            Some(root) if same_device(root, parent)? => 2,
            _ => 1,
        };

        if !self.cache_dir.exists() {
            let personal = parent.join(format!(".ctmp-{}", Uuid::new_v4()));
            make_public_dir(&personal)?;
            fs::write(personal.join(CACHE_LOCK), b"")?;
            let state = CacheState {
                nlink: threshold,
                attempt_number: cfg.workflow_attempt_number,
                total: fs2::available_space(&personal)? as i64,
                cached: 0,
                sigma_job: 0,
                cache_dir: self.cache_dir.clone(),
                job_state: BTreeMap::new(),
            };
            state.write(&personal.join(CACHE_STATE))?;

            match fs::rename(&personal, &self.cache_dir) {
                Ok(()) => (),
                Err(e) => {
                    if self.cache_dir.exists() {
                        // Another worker won the race; clean up our own mess.
                        let _ = fs::remove_dir_all(&personal);
                    } else {
                        return Err(e.into());
                    }
                }
            }
        }

        let _lock = CacheLock::acquire(&self.lock_file)?;
        let mut state = CacheState::load(&self.state_file)?;
        if state.attempt_number != cfg.workflow_attempt_number {
            // A previous attempt left its ledger behind; recount what is
            // actually on disk and forget dead reservations.
            state.cached = if state.nlink == 2 {
                0
            } else {
                self.disk_usage()?
            };
            state.sigma_job = 0;
            state.attempt_number = cfg.workflow_attempt_number;
            state.job_state.clear();
            state.write(&self.state_file)?;
        }
        self.nlink_threshold = state.nlink;
        Ok(())
    }

    fn disk_usage(&self) -> Result<i64> {
        let mut total = 0;
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_hidden(&name) {
                total += entry.metadata()?.len() as i64;
            }
        }
        Ok(total)
    }

    /// Lock, load, mutate, write, unlock.
    ///
    fn with_state<T>(&self, f: impl FnOnce(&mut CacheState) -> Result<T>) -> Result<T> {
        let _lock = CacheLock::acquire(&self.lock_file)?;
        let mut state = CacheState::load(&self.state_file)?;
        let out = f(&mut state)?;
        state.write(&self.state_file)?;
        Ok(out)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn nlink_threshold(&self) -> u32 {
        self.nlink_threshold
    }

    /// Snapshot of the ledger, taken under the lock.
    ///
    pub fn state(&self) -> Result<CacheState> {
        let _lock = CacheLock::acquire(&self.lock_file)?;
        CacheState::load(&self.state_file)
    }

    /// Path of a file id inside the cache directory.
    ///
    pub fn encoded_file_id(&self, id: &str) -> PathBuf {
        self.cache_dir.join(URL_SAFE_NO_PAD.encode(id))
    }

    /// Inverse of `encoded_file_id` for paths inside the cache directory.
    ///
    pub fn decoded_file_id(&self, cached: &Path) -> Option<FileId> {
        let name = cached.file_name()?.to_str()?;
        let bytes = URL_SAFE_NO_PAD.decode(name).ok()?;
        String::from_utf8(bytes).ok()
    }

    fn harbinger_for(&self, id: &str) -> PathBuf {
        self.cache_dir
            .join(format!(".{}.harbinger", URL_SAFE_NO_PAD.encode(id)))
    }

    fn staging_for(&self, id: &str) -> PathBuf {
        self.cache_dir.join(format!(".{}", URL_SAFE_NO_PAD.encode(id)))
    }

    pub fn file_is_cached(&self, id: &str) -> bool {
        self.encoded_file_id(id).exists()
    }

    /// Make room for a job reserving `new_job_reqs` bytes: register the
    /// reservation, then evict least-recently-modified unreferenced entries
    /// until the equation balances.
    ///
    #[tracing::instrument(skip(self))]
    pub fn clean_cache(&mut self, new_job_reqs: i64) -> Result<()> {
        let work_dir = self.base.working_dir().to_path_buf();
        let job_key = self.job_key.clone();
        let threshold = self.nlink_threshold as u64;

        self.with_state(|state| {
            state.sigma_job += new_job_reqs;
            let js = JobState {
                job_reqs: new_job_reqs,
                job_dir: work_dir,
                ..JobState::default()
            };
            state.job_state.insert(job_key, js);

            if state.is_balanced() {
                return Ok(());
            }

            // A cache entry is evictable only when no live job links it.
            let mut candidates: Vec<(SystemTime, i64, PathBuf)> = vec![];
            for entry in fs::read_dir(&state.cache_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if is_hidden(&name) {
                    continue;
                }
                let meta = entry.metadata()?;
                if nlink(&entry.path())? == threshold {
                    candidates.push((meta.modified()?, meta.len() as i64, entry.path()));
                }
            }
            // Newest first, so the oldest pops off the end.
            candidates.sort();
            candidates.reverse();

            debug!(
                "need {new_job_reqs} bytes, have {}",
                state.total - state.cached - (state.sigma_job - new_job_reqs)
            );
            while !state.is_balanced() {
                let Some((_, size, path)) = candidates.pop() else {
                    break;
                };
                fs::remove_file(&path)?;
                if state.nlink != 2 {
                    state.cached -= size;
                }
                debug!("evicted {} ({size} bytes)", path.display());
            }
            if !state.is_balanced() {
                return Err(CacheError::OutOfCacheSpace(new_job_reqs).into());
            }
            Ok(())
        })
    }

    /// Hand a file's size back to the current job. Used after a file landed
    /// in the cache (read hit or write-through).
    ///
    fn return_file_size(
        &self,
        state: &mut CacheState,
        id: &str,
        source: &Path,
        already_cached: bool,
    ) -> Result<()> {
        let size = fs::metadata(source)?.len() as i64;
        if !already_cached && self.nlink_threshold == 1 {
            state.cached += size;
        }
        state.sigma_job -= size;
        if !state.is_balanced() {
            warn!("the cache was not balanced on returning a file size");
        }
        state
            .job_state
            .entry(self.job_key.clone())
            .or_default()
            .add_file(id, Some(source), size, true)
    }

    fn update_job_specific(
        &self,
        id: &str,
        path: Option<&Path>,
        size: i64,
        cached: bool,
    ) -> Result<()> {
        self.with_state(|state| {
            state
                .job_state
                .entry(self.job_key.clone())
                .or_default()
                .add_file(id, path, size, cached)
        })
    }

    /// A read through a same-device store handed us a hard link: the bytes
    /// are already accounted for by the store's copy, so give the size back
    /// to the job and the pool.
    ///
    fn account_for_hard_link(&self, local: &Path) -> Result<()> {
        let size = fs::metadata(local)?.len() as i64;
        self.with_state(|state| {
            state.sigma_job -= size;
            if let Some(js) = state.job_state.get_mut(&self.job_key) {
                js.job_reqs -= size;
            }
            Ok(())
        })
    }

    /// Link or copy a freshly downloaded cache entry to the caller's path
    /// and settle the books. The cache lock is already held.
    ///
    fn adopt_download(
        &self,
        id: &str,
        cached_name: &Path,
        local: &Path,
        mutable: bool,
    ) -> Result<()> {
        if mutable {
            fs::copy(cached_name, local)?;
            make_writable(local)?;
            let size = fs::metadata(cached_name)?.len() as i64;

            let mut state = CacheState::load(&self.state_file)?;
            if state.nlink != 2 {
                state.cached += size;
            }
            if !state.is_balanced() {
                // Keeping both the mutable copy and the cache entry would
                // tip the equation; the mutable copy wins.
                fs::remove_file(cached_name)?;
                if state.nlink != 2 {
                    state.cached -= size;
                }
                debug!("only the mutable copy of {id} was retained");
            }
            state
                .job_state
                .entry(self.job_key.clone())
                .or_default()
                .add_file(id, Some(local), -1, false)?;
            state.write(&self.state_file)
        } else {
            if local.exists() {
                fs::remove_file(local)?;
            }
            fs::hard_link(cached_name, local)?;
            make_read_only(cached_name)?;

            let mut state = CacheState::load(&self.state_file)?;
            self.return_file_size(&mut state, id, local, false)?;
            state.write(&self.state_file)
        }
    }

    /// Link the file a job just wrote into the cache.
    ///
    fn add_to_cache_write(&self, abs: &Path, id: &str) -> Result<()> {
        trace!("add_to_cache_write({id})");

        let _lock = CacheLock::acquire(&self.lock_file)?;
        let cached = self.encoded_file_id(id);

        let src_dir = abs.parent().unwrap_or(Path::new("/"));
        if !same_device(&self.cache_dir, src_dir)? {
            return Err(CacheError::CrossDevice {
                cache: self.cache_dir.display().to_string(),
                file: abs.display().to_string(),
            }
            .into());
        }
        if !abs.starts_with(self.base.working_dir()) {
            return Err(CacheError::NonLocalSrc(abs.display().to_string()).into());
        }

        match fs::hard_link(abs, &cached) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(CacheError::Recache(abs.display().to_string()).into());
            }
            Err(e) => return Err(e.into()),
        }
        make_read_only(&cached)?;

        let mut state = CacheState::load(&self.state_file)?;
        self.return_file_size(&mut state, id, abs, false)?;
        state.write(&self.state_file)?;
        info!("added file with id {id} to the cache");
        Ok(())
    }

    /// Forcibly drop a single cache entry; only legal when no other job
    /// holds it.
    ///
    fn remove_single_cached_file(&self, id: &str) -> Result<()> {
        let cached = self.encoded_file_id(id);
        let threshold = self.nlink_threshold;
        self.with_state(|state| {
            let links = nlink(&cached)? as u32;
            if links != threshold {
                return Err(CacheError::InUse(id.to_owned()).into());
            }
            let size = fs::metadata(&cached)?.len() as i64;
            fs::remove_file(&cached)?;
            if threshold != 2 {
                state.cached -= size;
            }
            if !state.is_balanced() {
                warn!("the cache was not balanced on removing a single file");
            }
            Ok(())
        })
    }
}

impl FileStore for CachedFileStore {
    fn job_store(&self) -> &Arc<dyn JobStore> {
        self.base.job_store()
    }

    fn context(&self) -> &Arc<WorkerContext> {
        self.base.context()
    }

    fn working_dir(&self) -> &Path {
        self.base.working_dir()
    }

    #[tracing::instrument(skip(self))]
    fn open_job(&mut self, reqs: &EffectiveResources) -> Result<()> {
        self.base.open_job(reqs)?;

        // A crashed earlier attempt of this very job may have left its entry
        // behind; its reservation and working directory die here.
        let work_dir = self.base.working_dir().to_path_buf();
        let job_key = self.job_key.clone();
        self.with_state(|state| {
            if let Some(js) = state.job_state.remove(&job_key) {
                if js.job_dir != work_dir && js.job_dir.exists() {
                    let _ = fs::remove_dir_all(&js.job_dir);
                }
                state.sigma_job -= js.job_reqs;
            }
            Ok(())
        })?;

        self.job_reqs = reqs.disk as i64;
        self.cleanup_in_progress = false;
        self.clean_cache(self.job_reqs)
    }

    #[tracing::instrument(skip(self))]
    fn close_job(&mut self) -> Result<()> {
        self.cleanup_in_progress = true;

        let ids: Vec<FileId> = self.with_state(|state| {
            Ok(state
                .job_state
                .get(&self.job_key)
                .map(|js| js.job_specific_files.keys().cloned().collect())
                .unwrap_or_default())
        })?;
        for id in ids {
            self.delete_local_file(&id)?;
        }

        let job_key = self.job_key.clone();
        let job_reqs = self.job_reqs;
        self.with_state(|state| {
            state.sigma_job -= job_reqs;
            state.job_state.remove(&job_key);
            Ok(())
        })?;

        let work_dir = self.base.working_dir();
        if work_dir.exists() {
            fs::remove_dir_all(work_dir)?;
        }
        Ok(())
    }

    fn local_temp_dir(&mut self) -> Result<PathBuf> {
        self.base.local_temp_dir()
    }

    fn local_temp_file(&mut self) -> Result<PathBuf> {
        self.base.local_temp_file()
    }

    fn local_temp_file_name(&mut self) -> Result<PathBuf> {
        self.base.local_temp_file_name()
    }

    #[tracing::instrument(skip(self))]
    fn write_global_file(&mut self, local: &Path, cleanup: bool) -> Result<FileId> {
        let abs = self.base.abspath(local);
        let scope = self.base.cleanup_scope(cleanup);
        let store = self.base.job_store().clone();
        let work_dir = self.base.working_dir().to_path_buf();

        if !abs.starts_with(&work_dir) {
            // Files from outside the temp tree are written through and only
            // tracked, never cached.
            let id = store.write_file(&abs, scope.as_deref())?;
            self.update_job_specific(&id, None, 0, false)?;
            return Ok(id);
        }

        // A path that came out of an earlier read must not be hard-linked
        // or re-cached; the store needs a copy of its own.
        let prev_read = CacheState::load(&self.state_file)?
            .job_state
            .get(&self.job_key)
            .map(|js| js.files_to_fsids.contains_key(&path_key(Some(&abs))))
            .unwrap_or(false);

        let id = if self.nlink_threshold == 2 && !prev_read {
            // Same device as a local-file store: link straight into it.
            let id = store.get_empty_file_store_id(scope.as_deref())?;
            let store_path = store
                .local_file_path(&id)
                .ok_or_else(|| eyre::eyre!("store advertised no local path for {id}"))?;
            fs::remove_file(&store_path)?;
            fs::hard_link(&abs, &store_path)?;
            id
        } else if store.config().use_async {
            let id = store.get_empty_file_store_id(scope.as_deref())?;
            let file = File::open(&abs)?;
            self.base.enqueue_write(file, &id)?;
            id
        } else {
            store.write_file(&abs, scope.as_deref())?
        };

        if prev_read {
            self.update_job_specific(&id, Some(&abs), 0, false)?;
        } else {
            self.add_to_cache_write(&abs, &id)?;
        }
        Ok(id)
    }

    fn write_global_file_stream(
        &mut self,
        cleanup: bool,
    ) -> Result<(Box<dyn Write + Send>, FileId)> {
        self.base.write_global_file_stream(cleanup)
    }

    #[tracing::instrument(skip(self))]
    fn read_global_file(
        &mut self,
        id: &str,
        user_path: Option<&Path>,
        cache: bool,
        mutable: Option<bool>,
    ) -> Result<PathBuf> {
        if self.base.is_staged_for_deletion(id) {
            return Err(StoreError::Deleted(id.to_owned()).into());
        }
        let mutable = mutable.unwrap_or(self.base.mutable_default());
        let store = self.base.job_store().clone();
        let work_dir = self.base.working_dir().to_path_buf();

        let cached_name = self.encoded_file_id(id);
        let harbinger = self.harbinger_for(id);

        let (local, file_is_local) = match user_path {
            Some(p) => {
                let abs = self.base.abspath(p);
                if abs.exists() {
                    return Err(StoreError::Exists(abs.display().to_string()).into());
                }
                let is_local = abs.starts_with(&work_dir);
                (abs, is_local)
            }
            None => (self.base.local_temp_file_name()?, true),
        };

        loop {
            let lock = CacheLock::acquire(&self.lock_file)?;

            if file_is_local && cached_name.exists() {
                info!("cache hit on file with id {id}");
                if mutable {
                    fs::copy(&cached_name, &local)?;
                    make_writable(&local)?;
                    let mut state = CacheState::load(&self.state_file)?;
                    state
                        .job_state
                        .entry(self.job_key.clone())
                        .or_default()
                        .add_file(id, Some(&local), -1, false)?;
                    state.write(&self.state_file)?;
                } else {
                    fs::hard_link(&cached_name, &local)?;
                    let mut state = CacheState::load(&self.state_file)?;
                    self.return_file_size(&mut state, id, &local, true)?;
                    state.write(&self.state_file)?;
                }
                return Ok(local);
            }

            if file_is_local && harbinger.exists() {
                // Someone else is downloading this very file; wait our turn.
                info!("waiting for another worker to download file with id {id}");
                drop(lock);
                thread::sleep(HARBINGER_POLL);
                continue;
            }

            if file_is_local && cache {
                debug!("cache miss on file with id {id}");
                fs::write(&harbinger, b"")?;
                drop(lock);

                // The download happens without the lock; the harbinger keeps
                // competitors out.
                let staging = self.staging_for(id);
                let downloaded = store.read_file(id, &staging);

                let lock = CacheLock::acquire(&self.lock_file)?;
                let adopted = match downloaded {
                    Ok(()) => {
                        fs::rename(&staging, &cached_name)
                            .map_err(Into::into)
                            .and_then(|()| self.adopt_download(id, &cached_name, &local, mutable))
                    }
                    Err(e) => {
                        let _ = fs::remove_file(&staging);
                        Err(e)
                    }
                };
                // The harbinger goes away on every path out of here.
                let _ = fs::remove_file(&harbinger);
                drop(lock);
                adopted?;
                return Ok(local);
            }

            // Caching is off or the target is foreign; bypass the cache.
            drop(lock);
            store.read_file(id, &local)?;
            if mutable {
                if self.nlink_threshold == 2 && nlink(&local)? >= 2 {
                    // Undo the store's hard link with a copy-rename so
                    // writes stay private.
                    let tmp = PathBuf::from(format!("{}.tmp", local.display()));
                    fs::copy(&local, &tmp)?;
                    fs::rename(&tmp, &local)?;
                }
                make_writable(&local)?;
                self.update_job_specific(id, Some(&local), -1, false)?;
            } else {
                make_read_only(&local)?;
                if self.nlink_threshold == 2 {
                    self.account_for_hard_link(&local)?;
                }
                self.update_job_specific(id, Some(&local), 0, false)?;
            }
            return Ok(local);
        }
    }

    fn read_global_file_stream(&mut self, id: &str) -> Result<Box<dyn Read + Send>> {
        if self.base.is_staged_for_deletion(id) {
            return Err(StoreError::Deleted(id.to_owned()).into());
        }
        if self.file_is_cached(id) {
            info!("cache hit on file with id {id}");
            return Ok(Box::new(File::open(self.encoded_file_id(id))?));
        }
        debug!("cache miss on file with id {id}");
        self.base.job_store().read_file_stream(id)
    }

    #[tracing::instrument(skip(self))]
    fn delete_local_file(&mut self, id: &str) -> Result<()> {
        let cached_name = self.encoded_file_id(id);
        let threshold = self.nlink_threshold;
        let cleanup = self.cleanup_in_progress;
        let job_key = self.job_key.clone();

        self.with_state(|state| {
            let mut js = state
                .job_state
                .get(&job_key)
                .cloned()
                .ok_or_else(|| eyre::eyre!("no cache state for the current job"))?;
            let files = js
                .job_specific_files
                .get(id)
                .cloned()
                .ok_or_else(|| eyre::eyre!("attempting to delete a non-local file {id}"))?;

            let mut last_cached_size = 0i64;
            for (key, size) in files {
                if key.is_empty() {
                    // Tracked without a local path, nothing on disk to drop.
                    js.drop_record(id, &key);
                    continue;
                }
                let path = PathBuf::from(&key);
                if size == 0 || size == -1 {
                    if js.sole_owner(&key) {
                        match fs::remove_file(&path) {
                            Ok(()) => (),
                            Err(e) if e.kind() == ErrorKind::NotFound && size == -1 => {
                                debug!("{key} was read mutably and deleted by the user");
                            }
                            Err(e) if e.kind() == ErrorKind::NotFound => {
                                return Err(CacheError::TrackedFileDeleted(key).into());
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    js.drop_record(id, &key);
                    continue;
                }
                // A cached file: removing the link returns its size to the
                // reservation.
                if !path.exists() {
                    return Err(CacheError::TrackedFileDeleted(key).into());
                }
                let real = fs::metadata(&path)?.len() as i64;
                if real != size {
                    warn!("size on record differs from the real size by {} bytes", size - real);
                }
                if js.sole_owner(&key) {
                    fs::remove_file(&path)?;
                }
                state.sigma_job += size;
                js.job_reqs += size;
                js.drop_record(id, &key);
                last_cached_size = size;
            }

            if !cleanup && cached_name.exists() {
                // Keep the cached copy while other jobs link it or while it
                // costs nothing; evict it otherwise.
                let links = nlink(&cached_name)? as u32;
                if !state.is_balanced() && links == threshold {
                    fs::remove_file(&cached_name)?;
                    state.cached -= last_cached_size;
                }
            }

            state.job_state.insert(job_key.clone(), js);
            Ok(())
        })?;

        self.base.context().remove_cache_location(id);
        self.base
            .log_to_leader(&format!("deleted local copies of file with id {id}"), Level::DEBUG);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn delete_global_file(&mut self, id: &str) -> Result<()> {
        let tracked = self.with_state(|state| {
            Ok(state
                .job_state
                .get(&self.job_key)
                .map(|js| js.job_specific_files.contains_key(id))
                .unwrap_or(false))
        })?;
        if tracked {
            self.delete_local_file(id)?;
        }
        // A surviving cache entry is only removable when no other job holds
        // it; otherwise deleting the global file would pull their data away.
        if self.file_is_cached(id) {
            self.remove_single_cached_file(id)?;
        }
        self.base.stage_file_delete(id);
        self.base.log_to_leader(
            &format!("added file with id {id} to the list of files to be deleted globally"),
            Level::DEBUG,
        );
        Ok(())
    }

    fn import_file(&mut self, src_url: &str) -> Result<FileId> {
        self.base.import_file(src_url)
    }

    fn export_file(&mut self, id: &str, dst_url: &str) -> Result<()> {
        self.base.export_file(id, dst_url)
    }

    fn log_to_leader(&mut self, msg: &str, level: Level) {
        self.base.log_to_leader(msg, level);
    }

    fn stage_wrapper_delete(&mut self, wrapper_id: &str) {
        self.base.stage_wrapper_delete(wrapper_id);
    }

    fn commit(&mut self, wrapper: JobWrapper) -> Result<()> {
        self.base.commit(wrapper)
    }

    fn wait_for_commit(&mut self) -> Result<()> {
        self.base.wait_for_commit()
    }
}
