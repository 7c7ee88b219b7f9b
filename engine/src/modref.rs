//! User-module references and the callable registry.
//!
//! A job ships with an opaque handle naming the module that defined its
//! callable. The handle survives serialization and, on the receiving worker,
//! is resolved against the `Registry` the worker bootstrap populated. A
//! module that was the submitting process entry point is tagged as such so
//! that references to it rebind to whatever module the peer registered,
//! rather than to the engine itself.
//!

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::{FileId, JobContext, JobError, Runnable, ServiceCtor};

/// First token of every serialized job command.
pub const COMMAND_MAGIC: &str = "_toil";

/// Shared-file name under which the bootstrap job is stored.
pub const FIRST_JOB: &str = "firstJob";

/// Reference to the user module that defined a callable.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRef {
    /// Name the module registered itself under
    pub name: String,
    /// Directory the module was loaded from on the submitting host
    pub dir_path: PathBuf,
    /// Whether the module was the submitting process entry point
    pub entry_point: bool,
}

impl ModuleRef {
    pub fn new(name: &str, dir_path: &str) -> Self {
        ModuleRef {
            name: name.to_owned(),
            dir_path: PathBuf::from(dir_path),
            entry_point: false,
        }
    }

    /// A reference to the module that is the running process itself.
    ///
    pub fn for_entry_point(name: &str, dir_path: &str) -> Self {
        ModuleRef {
            entry_point: true,
            ..ModuleRef::new(name, dir_path)
        }
    }

    /// Form suitable for shipping with a serialized job. Entry-point refs
    /// keep their tag so the peer knows to rebind them.
    ///
    pub fn globalize(&self) -> ModuleRef {
        self.clone()
    }

    /// Resolve this reference against the local registry. Entry-point refs
    /// rebind to the module the local bootstrap registered; anything else
    /// must match that module by name.
    ///
    pub fn localize(&self, registry: &Registry) -> Result<ModuleRef> {
        trace!("localize({})", self.name);

        let local = registry.module();
        if self.entry_point || self.name == local.name {
            return Ok(local.clone());
        }
        Err(JobError::UnknownModule(self.name.clone()).into())
    }

    fn to_tokens(&self) -> String {
        format!(
            "{} {} {}",
            self.name,
            self.dir_path.display(),
            u8::from(self.entry_point)
        )
    }

    fn from_tokens(tokens: &[&str]) -> Result<Self> {
        if tokens.len() != 3 {
            return Err(JobError::BadCommand(tokens.join(" ")).into());
        }
        Ok(ModuleRef {
            name: tokens[0].to_owned(),
            dir_path: PathBuf::from(tokens[1]),
            entry_point: tokens[2] == "1",
        })
    }
}

/// Assemble the command string recorded on a wrapper.
///
pub fn encode_command(pickle_id: &str, module: &ModuleRef) -> String {
    format!("{COMMAND_MAGIC} {pickle_id} {}", module.to_tokens())
}

/// Split a wrapper command back into the pickle file id and the module ref.
///
pub fn parse_command(command: &str) -> Result<(FileId, ModuleRef)> {
    let tokens = command.split_whitespace().collect::<Vec<_>>();
    if tokens.len() != 5 || tokens[0] != COMMAND_MAGIC {
        return Err(JobError::BadCommand(command.to_owned()).into());
    }
    let module = ModuleRef::from_tokens(&tokens[2..])?;
    Ok((tokens[1].to_owned(), module))
}

/// Plain wrapped function: gets the decoded arguments, returns a value.
pub type PlainFn = fn(&[Value]) -> Result<Value>;

/// Job function: additionally receives the job context so it can wire
/// successors and use the file store.
pub type JobFn = fn(&mut JobContext<'_>, &[Value]) -> Result<Value>;

/// Everything a worker can run, registered under stable names by the user
/// module during bootstrap.
///
pub struct Registry {
    module: ModuleRef,
    runnables: HashMap<String, Arc<dyn Runnable>>,
    functions: HashMap<String, PlainFn>,
    job_functions: HashMap<String, JobFn>,
    services: HashMap<String, ServiceCtor>,
}

impl Registry {
    pub fn new(module: ModuleRef) -> Self {
        Registry {
            module,
            runnables: HashMap::new(),
            functions: HashMap::new(),
            job_functions: HashMap::new(),
            services: HashMap::new(),
        }
    }

    /// The module this registry was populated by.
    ///
    pub fn module(&self) -> &ModuleRef {
        &self.module
    }

    pub fn register_runnable(&mut self, name: &str, job: Arc<dyn Runnable>) -> &mut Self {
        self.runnables.insert(name.to_owned(), job);
        self
    }

    pub fn register_fn(&mut self, name: &str, f: PlainFn) -> &mut Self {
        self.functions.insert(name.to_owned(), f);
        self
    }

    pub fn register_job_fn(&mut self, name: &str, f: JobFn) -> &mut Self {
        self.job_functions.insert(name.to_owned(), f);
        self
    }

    pub fn register_service(&mut self, name: &str, ctor: ServiceCtor) -> &mut Self {
        self.services.insert(name.to_owned(), ctor);
        self
    }

    pub fn runnable(&self, name: &str) -> Result<Arc<dyn Runnable>> {
        self.runnables
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::Unregistered(name.to_owned()).into())
    }

    pub fn function(&self, name: &str) -> Result<PlainFn> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| JobError::Unregistered(name.to_owned()).into())
    }

    pub fn job_function(&self, name: &str) -> Result<JobFn> {
        self.job_functions
            .get(name)
            .copied()
            .ok_or_else(|| JobError::Unregistered(name.to_owned()).into())
    }

    pub fn service(&self, name: &str) -> Result<ServiceCtor> {
        self.services
            .get(name)
            .copied()
            .ok_or_else(|| JobError::Unregistered(name.to_owned()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_command_round_trip() {
        let m = ModuleRef::new("pipelines", "/opt/wf");
        let cmd = encode_command("file-42", &m);
        let (pickle, back) = parse_command(&cmd).unwrap();
        assert_eq!(pickle, "file-42");
        assert_eq!(back, m);
    }

    #[test]
    fn test_command_entry_point_round_trip() {
        let m = ModuleRef::for_entry_point("main", "/home/user");
        let (_, back) = parse_command(&encode_command(FIRST_JOB, &m)).unwrap();
        assert!(back.entry_point);
    }

    #[rstest]
    #[case("")]
    #[case("_other a b c d")]
    #[case("_toil onlyone")]
    #[case("_toil a b c d e f")]
    fn test_parse_command_rejects(#[case] cmd: &str) {
        assert!(parse_command(cmd).is_err());
    }

    #[test]
    fn test_localize_rebinds_entry_point() {
        let local = ModuleRef::new("pipelines", "/opt/wf");
        let registry = Registry::new(local.clone());

        let shipped = ModuleRef::for_entry_point("whatever", "/somewhere/else");
        let bound = shipped.localize(&registry).unwrap();
        assert_eq!(bound, local);

        let foreign = ModuleRef::new("other", "/elsewhere");
        assert!(foreign.localize(&registry).is_err());
    }
}
