//! Long-running sidecars attached to jobs.
//!
//! A service is started before the owning job's successors run and stopped
//! once they are done. Coordination with the leader goes through three files
//! in the job store: the start file (deleted by the service host once
//! `start()` returned, broadcasting readiness), the terminate file (its
//! disappearance requests shutdown) and the error file (still present at
//! shutdown means the workflow failed and the service exits with an error).
//!

use std::thread;

use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;
use tracing::{debug, trace};

use crate::{FileStore, JobWrapper, Registry, Resources, RvMap, promise};

/// The interface a sidecar implements.
///
pub trait Service: Send + Sync {
    /// Start the service. The returned value describes how to reach it and
    /// is handed to consumers through the promise made by `add_service`.
    fn start(&mut self, fs: &mut dyn FileStore) -> Result<Value>;

    /// Liveness probe. `Ok(true)` keeps the service running, `Ok(false)`
    /// ends it successfully, an error marks it failed.
    fn check(&mut self) -> Result<bool>;

    /// Stop the service. Called on every exit path once it was started.
    fn stop(&mut self, fs: &mut dyn FileStore) -> Result<()>;
}

/// Builds a fresh service instance from its serialized configuration.
pub type ServiceCtor = fn(&Value) -> Box<dyn Service>;

/// Authoring-time description of a service: the registered constructor name,
/// its configuration and resource needs.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub config: Value,
    pub resources: Resources,
    #[serde(skip)]
    pub(crate) attached: bool,
}

impl ServiceSpec {
    pub fn new(name: &str, config: Value) -> Self {
        ServiceSpec {
            name: name.to_owned(),
            config,
            resources: Resources::default(),
            attached: false,
        }
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }
}

/// Lifecycle of a hosted service.
///
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ServiceState {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Host one service run to completion.
///
/// Starts the service, materializes its start credentials into the promise
/// placeholders, deletes the start file, then polls the terminate file and
/// the service's own `check` until shutdown is requested or the service
/// ends. `stop()` runs whatever the loop outcome was.
///
#[tracing::instrument(skip_all, fields(name = name))]
pub fn run_service(
    name: &str,
    config: &Value,
    rvs: &RvMap,
    wrapper: &JobWrapper,
    registry: &Registry,
    fs: &mut dyn FileStore,
) -> Result<Value> {
    trace!("service {name}: {}", ServiceState::Pending);

    let ctor = registry.service(name)?;
    let mut service = ctor(config);

    trace!("service {name}: {}", ServiceState::Starting);
    let credentials = service.start(fs)?;

    let run = service_loop(name, rvs, wrapper, fs, service.as_mut(), &credentials);

    // The stop method is always called once the service was started.
    trace!("service {name}: {}", ServiceState::Stopping);
    let stopped = service.stop(fs);

    match run.and(stopped) {
        Ok(()) => {
            trace!("service {name}: {}", ServiceState::Stopped);
            Ok(credentials)
        }
        Err(e) => {
            debug!("service {name}: {} ({e})", ServiceState::Failed);
            Err(e)
        }
    }
}

fn service_loop(
    name: &str,
    rvs: &RvMap,
    wrapper: &JobWrapper,
    fs: &mut dyn FileStore,
    service: &mut dyn Service,
    credentials: &Value,
) -> Result<()> {
    let store = fs.job_store().clone();
    let interval = store.config().polling_interval();

    // The credentials must reach consumers while the service is running, so
    // the promises are fulfilled right here rather than after the run.
    promise::fulfil(rvs, credentials, store.as_ref())?;

    // Broadcast readiness by removing the start flag.
    let start_file = wrapper
        .start_file
        .as_ref()
        .ok_or_else(|| eyre::eyre!("service wrapper {} carries no start file", wrapper.id))?;
    if store.file_exists(start_file)? {
        store.delete_file(start_file)?;
    }

    trace!("service {name}: {}", ServiceState::Running);

    let terminate_file = wrapper
        .terminate_file
        .as_ref()
        .ok_or_else(|| eyre::eyre!("service wrapper {} carries no terminate file", wrapper.id))?;
    let error_file = wrapper
        .error_file
        .as_ref()
        .ok_or_else(|| eyre::eyre!("service wrapper {} carries no error file", wrapper.id))?;

    loop {
        // Shutdown is requested by removing the terminate flag.
        if !store.file_exists(terminate_file)? {
            debug!("terminate flag of service {name} is gone");
            if store.file_exists(error_file)? {
                return Err(eyre::eyre!("service {name} shut down with an error"));
            }
            break;
        }

        match service.check() {
            Ok(true) => (),
            Ok(false) => {
                debug!("service {name} has finished okay");
                break;
            }
            Err(e) => return Err(e),
        }

        thread::sleep(interval);
    }
    Ok(())
}
