//! Service lifecycle: readiness broadcast, credential promises, clean and
//! failed shutdown, stop on every path.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use eyre::Result;
use serde_json::{Value, json};
use tempfile::TempDir;

use atelier_engine::{
    DirectFileStore, FileStore, JobArg, JobGraph, JobSpec, JobStore, ModuleRef, Registry, Service,
    ServiceSpec, WorkerContext, execute_job, serialise_first_job,
};

use common::DiskJobStore;

fn module() -> ModuleRef {
    ModuleRef::new("tests", "/tmp")
}

/// Writes a marker file on stop so tests can observe the stop guarantee.
struct MarkerService {
    config: Value,
}

impl Service for MarkerService {
    fn start(&mut self, _fs: &mut dyn FileStore) -> Result<Value> {
        Ok(json!({"endpoint": "localhost:5432"}))
    }

    fn check(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn stop(&mut self, _fs: &mut dyn FileStore) -> Result<()> {
        let marker = self.config["marker"].as_str().unwrap();
        fs::write(marker, b"stopped")?;
        Ok(())
    }
}

fn marker_service(config: &Value) -> Box<dyn Service> {
    Box::new(MarkerService {
        config: config.clone(),
    })
}

fn identity(args: &[Value]) -> Result<Value> {
    Ok(args[0].clone())
}

fn nothing(_args: &[Value]) -> Result<Value> {
    Ok(Value::Null)
}

fn registry() -> Registry {
    let mut r = Registry::new(module());
    r.register_fn("identity", identity)
        .register_fn("nothing", nothing)
        .register_service("db", marker_service);
    r
}

fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if probe() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn worker_fs(store: &Arc<DiskJobStore>, workers: &Path, wrapper_id: &str) -> DirectFileStore {
    let js: Arc<dyn JobStore> = store.clone();
    let base = workers.join(wrapper_id);
    fs::create_dir_all(&base).unwrap();
    DirectFileStore::new(js, WorkerContext::new(), &base, wrapper_id, None).unwrap()
}

struct ServiceFixture {
    store: Arc<DiskJobStore>,
    root_id: String,
    child_id: String,
    svc: atelier_engine::ServiceRef,
    marker: std::path::PathBuf,
}

fn build_fixture(dir: &Path) -> ServiceFixture {
    let store = DiskJobStore::new(&dir.join("store"));
    let marker = dir.join("stopped.marker");

    let mut g = JobGraph::new(module());
    let root = g.add(JobSpec::wrap_fn("nothing", vec![]));
    let mut spec = ServiceSpec::new("db", json!({"marker": marker.display().to_string()}));
    let (_, credentials) = g.add_service(root, &mut spec, None).unwrap();
    let child = g.add(JobSpec::wrap_fn("identity", vec![JobArg::from(credentials)]));
    g.add_child(root, child).unwrap();

    let js: Arc<dyn JobStore> = store.clone();
    let wrapper = serialise_first_job(&mut g, root, &js).unwrap();

    let svc = wrapper.services[0][0].clone();
    let child_id = wrapper.stack[1][0].id.clone();
    ServiceFixture {
        store,
        root_id: wrapper.id,
        child_id,
        svc,
        marker,
    }
}

#[test]
fn test_service_clean_lifecycle() {
    let dir = TempDir::new().unwrap();
    let fx = build_fixture(dir.path());
    let workers = dir.path().join("workers");

    // The owning job runs first.
    let mut root_fs = worker_fs(&fx.store, &workers, &fx.root_id);
    let root_wrapper = fx.store.load(&fx.root_id).unwrap();
    execute_job(root_wrapper, &registry(), &mut root_fs).unwrap();

    // Host the service on its own thread, like a separate worker would.
    let store = fx.store.clone();
    let svc_id = fx.svc.id.clone();
    let workers2 = workers.clone();
    let host = thread::spawn(move || {
        let mut svc_fs = worker_fs(&store, &workers2, &svc_id);
        let wrapper = store.load(&svc_id).unwrap();
        execute_job(wrapper, &registry(), &mut svc_fs)
    });

    // Readiness is broadcast by deleting the start flag.
    assert!(wait_until(Duration::from_secs(5), || {
        !fx.store.file_exists(&fx.svc.start_file).unwrap()
    }));

    // With the service up, the child can consume the start credentials.
    let mut child_fs = worker_fs(&fx.store, &workers, &fx.child_id);
    let child_wrapper = fx.store.load(&fx.child_id).unwrap();
    let seen = execute_job(child_wrapper, &registry(), &mut child_fs).unwrap();
    assert_eq!(seen, json!({"endpoint": "localhost:5432"}));

    // Clean shutdown: drop the error flag, then the terminate flag.
    fx.store.delete_file(&fx.svc.error_file).unwrap();
    fx.store.delete_file(&fx.svc.terminate_file).unwrap();

    host.join().unwrap().unwrap();
    assert!(fx.marker.exists(), "stop must have run");
}

#[test]
fn test_service_error_flag_means_failure() {
    let dir = TempDir::new().unwrap();
    let fx = build_fixture(dir.path());
    let workers = dir.path().join("workers");

    let mut root_fs = worker_fs(&fx.store, &workers, &fx.root_id);
    execute_job(fx.store.load(&fx.root_id).unwrap(), &registry(), &mut root_fs).unwrap();

    let store = fx.store.clone();
    let svc_id = fx.svc.id.clone();
    let workers2 = workers.clone();
    let host = thread::spawn(move || {
        let mut svc_fs = worker_fs(&store, &workers2, &svc_id);
        let wrapper = store.load(&svc_id).unwrap();
        execute_job(wrapper, &registry(), &mut svc_fs)
    });

    assert!(wait_until(Duration::from_secs(5), || {
        !fx.store.file_exists(&fx.svc.start_file).unwrap()
    }));

    // The terminate flag vanishes while the error flag is still present:
    // the workflow failed and the service must report it.
    fx.store.delete_file(&fx.svc.terminate_file).unwrap();

    let outcome = host.join().unwrap();
    assert!(outcome.is_err());
    // stop still ran.
    assert!(fx.marker.exists());
}
