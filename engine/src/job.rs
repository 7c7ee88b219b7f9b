//! The in-memory job graph: authoring, validation and ordering.
//!
//! Jobs live in an arena owned by `JobGraph` and are referred to by `JobId`
//! handles. Forward edges (`children`, `follow_ons`) are handle lists, the
//! reverse predecessor edges a handle set used only for validation and
//! lookup. A follow-on runs after the source job *and* everything reachable
//! from its children has completed, which is what the augmented-graph cycle
//! check below encodes.
//!

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use derive_builder::Builder;
use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::{
    FileId, FileStore, GraphError, JobError, JobStore, ModuleRef, Promise, PromiseError,
    PromiseRef, Resources, RvMap, ServiceSpec,
};

/// Handle of a job inside its graph.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub(crate) usize);

/// What a job actually runs, dispatched through the worker registry.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JobBody {
    /// A registered `Runnable` trait object
    Runnable { name: String, args: Vec<JobArg> },
    /// A registered plain function
    Function { name: String, args: Vec<JobArg> },
    /// A registered function that also receives the job context
    JobFunction { name: String, args: Vec<JobArg> },
    /// A long-running sidecar, see the service module
    Service { name: String, config: Value },
    /// Does nothing; used by `encapsulate`
    Noop,
}

impl JobBody {
    /// Short identifier used in error messages and traces.
    ///
    pub fn label(&self) -> &str {
        match self {
            JobBody::Runnable { name, .. }
            | JobBody::Function { name, .. }
            | JobBody::JobFunction { name, .. }
            | JobBody::Service { name, .. } => name,
            JobBody::Noop => "noop",
        }
    }

    pub(crate) fn args(&self) -> &[JobArg] {
        match self {
            JobBody::Runnable { args, .. }
            | JobBody::Function { args, .. }
            | JobBody::JobFunction { args, .. } => args,
            _ => &[],
        }
    }

    pub(crate) fn args_mut(&mut self) -> &mut [JobArg] {
        match self {
            JobBody::Runnable { args, .. }
            | JobBody::Function { args, .. }
            | JobBody::JobFunction { args, .. } => args,
            _ => &mut [],
        }
    }
}

/// One argument of a job body: either a literal value or a reference to a
/// predecessor's return value.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JobArg {
    Value(Value),
    /// Authoring-time promise, replaced by `PromiseRef` when frozen
    Promise(Promise),
    PromiseRef(PromiseRef),
}

impl JobArg {
    pub fn value(v: impl Into<Value>) -> Self {
        JobArg::Value(v.into())
    }
}

impl From<Promise> for JobArg {
    fn from(p: Promise) -> Self {
        JobArg::Promise(p)
    }
}

/// Everything needed to add a job to a graph.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Builder)]
#[builder(pattern = "owned", setter(into))]
pub struct JobSpec {
    pub body: JobBody,
    #[builder(default)]
    pub resources: Resources,
    /// Re-run this job when any successor exhausts its retries
    #[builder(default)]
    pub checkpoint: bool,
}

impl JobSpec {
    pub fn runnable(name: &str, args: Vec<JobArg>) -> Self {
        JobSpec {
            body: JobBody::Runnable {
                name: name.to_owned(),
                args,
            },
            resources: Resources::default(),
            checkpoint: false,
        }
    }

    /// Wrap a registered plain function as a job.
    ///
    pub fn wrap_fn(name: &str, args: Vec<JobArg>) -> Self {
        JobSpec {
            body: JobBody::Function {
                name: name.to_owned(),
                args,
            },
            resources: Resources::default(),
            checkpoint: false,
        }
    }

    /// Wrap a registered job function as a job.
    ///
    pub fn wrap_job_fn(name: &str, args: Vec<JobArg>) -> Self {
        JobSpec {
            body: JobBody::JobFunction {
                name: name.to_owned(),
                args,
            },
            resources: Resources::default(),
            checkpoint: false,
        }
    }

    pub(crate) fn noop() -> Self {
        JobSpec {
            body: JobBody::Noop,
            resources: Resources::default(),
            checkpoint: false,
        }
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self
    }
}

/// Bookkeeping of one encapsulated sub-graph.
///
#[derive(Clone, Copy, Debug)]
pub(crate) struct Encapsulated {
    pub(crate) inner: JobId,
    pub(crate) follow_on: JobId,
}

pub(crate) struct JobNode {
    pub(crate) spec: JobSpec,
    pub(crate) children: Vec<JobId>,
    pub(crate) follow_ons: Vec<JobId>,
    /// Root services of this job's service forest
    pub(crate) services: Vec<JobId>,
    /// For a service node, its child services
    pub(crate) service_children: Vec<JobId>,
    pub(crate) predecessors: BTreeSet<JobId>,
    pub(crate) rvs: RvMap,
    /// Set only while a serialization is in flight
    pub(crate) promise_store: Option<Arc<dyn JobStore>>,
    pub(crate) is_service: bool,
    pub(crate) encapsulated: Option<Encapsulated>,
}

impl JobNode {
    fn new(spec: JobSpec) -> Self {
        JobNode {
            spec,
            children: vec![],
            follow_ons: vec![],
            services: vec![],
            service_children: vec![],
            predecessors: BTreeSet::new(),
            rvs: RvMap::default(),
            promise_store: None,
            is_service: false,
            encapsulated: None,
        }
    }
}

/// The mutable job DAG under construction, plus the module its callables
/// come from.
///
pub struct JobGraph {
    nodes: Vec<JobNode>,
    module: ModuleRef,
}

impl JobGraph {
    pub fn new(module: ModuleRef) -> Self {
        trace!("JobGraph::new");
        JobGraph {
            nodes: vec![],
            module,
        }
    }

    pub fn module(&self) -> &ModuleRef {
        &self.module
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a free-standing job. Wire it afterwards with `add_child` and
    /// friends.
    ///
    pub fn add(&mut self, spec: JobSpec) -> JobId {
        let id = JobId(self.nodes.len());
        self.nodes.push(JobNode::new(spec));
        id
    }

    pub(crate) fn node(&self, id: JobId) -> &JobNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: JobId) -> &mut JobNode {
        &mut self.nodes[id.0]
    }

    /// Name used for a job in error messages.
    ///
    pub fn display_name(&self, id: JobId) -> String {
        format!("{}#{}", self.node(id).spec.body.label(), id.0)
    }

    /// Where successor edges of `job` actually land: an encapsulating job
    /// redirects them to its follow-on proxy.
    ///
    fn attach_target(&self, job: JobId) -> JobId {
        match self.node(job).encapsulated {
            Some(e) => e.follow_on,
            None => job,
        }
    }

    fn add_predecessor(&mut self, job: JobId, predecessor: JobId) -> Result<()> {
        let node = self.node_mut(job);
        if !node.predecessors.insert(predecessor) {
            return Err(JobError::DuplicatePredecessor.into());
        }
        Ok(())
    }

    /// Make `child` run directly after `parent` completes.
    ///
    pub fn add_child(&mut self, parent: JobId, child: JobId) -> Result<JobId> {
        let parent = self.attach_target(parent);
        self.add_predecessor(child, parent)?;
        self.node_mut(parent).children.push(child);
        Ok(child)
    }

    /// Whether `child` already is a direct child of `parent`.
    ///
    pub fn has_child(&self, parent: JobId, child: JobId) -> bool {
        self.node(parent).children.contains(&child)
    }

    /// Make `follow_on` run after `parent`'s children and all their
    /// transitive successors have completed.
    ///
    pub fn add_follow_on(&mut self, parent: JobId, follow_on: JobId) -> Result<JobId> {
        let parent = self.attach_target(parent);
        self.add_predecessor(follow_on, parent)?;
        self.node_mut(parent).follow_ons.push(follow_on);
        Ok(follow_on)
    }

    /// Add a registered plain function as a child job.
    ///
    pub fn add_child_fn(&mut self, parent: JobId, name: &str, args: Vec<JobArg>) -> Result<JobId> {
        let child = self.add(JobSpec::wrap_fn(name, args));
        self.add_child(parent, child)
    }

    /// Add a registered plain function as a follow-on job.
    ///
    pub fn add_follow_on_fn(
        &mut self,
        parent: JobId,
        name: &str,
        args: Vec<JobArg>,
    ) -> Result<JobId> {
        let follow_on = self.add(JobSpec::wrap_fn(name, args));
        self.add_follow_on(parent, follow_on)
    }

    /// Attach a service to `job`, or, with `parent` given, as a child of an
    /// existing service of that same job. Returns the service's handle and a
    /// promise of its start credentials.
    ///
    #[tracing::instrument(skip(self, service))]
    pub fn add_service(
        &mut self,
        job: JobId,
        service: &mut ServiceSpec,
        parent: Option<JobId>,
    ) -> Result<(JobId, Promise)> {
        trace!("add_service({})", service.name);

        if service.attached {
            return Err(JobError::ServiceAlreadyAttached.into());
        }

        let job = self.attach_target(job);
        if let Some(parent) = parent {
            // The parent must be part of this job's own service forest.
            if !self.service_forest(job).contains(&parent) {
                return Err(JobError::ForeignParentService.into());
            }
            service.attached = true;
            let id = self.push_service_node(service);
            self.node_mut(parent).service_children.push(id);
            Ok((id, Promise { job: id, index: None }))
        } else {
            service.attached = true;
            let id = self.push_service_node(service);
            self.node_mut(job).services.push(id);
            Ok((id, Promise { job: id, index: None }))
        }
    }

    fn push_service_node(&mut self, service: &ServiceSpec) -> JobId {
        let spec = JobSpec {
            body: JobBody::Service {
                name: service.name.clone(),
                config: service.config.clone(),
            },
            resources: service.resources,
            checkpoint: false,
        };
        let id = self.add(spec);
        self.node_mut(id).is_service = true;
        id
    }

    /// DFS over the service forest rooted at `job`'s own services.
    ///
    pub(crate) fn service_forest(&self, job: JobId) -> BTreeSet<JobId> {
        let mut out = BTreeSet::new();
        let mut stack = self.node(job).services.clone();
        while let Some(s) = stack.pop() {
            if out.insert(s) {
                stack.extend(self.node(s).service_children.iter().copied());
            }
        }
        out
    }

    /// Hide the sub-graph rooted at `job` behind a single vertex: the
    /// returned job has `job` as its only child plus a no-op follow-on, and
    /// successor wiring against it lands on that follow-on.
    ///
    pub fn encapsulate(&mut self, job: JobId) -> Result<JobId> {
        trace!("encapsulate({})", self.display_name(job));

        let outer = self.add(JobSpec::noop());
        let follow_on = self.add(JobSpec::noop());
        self.add_child(outer, job)?;
        self.add_follow_on(outer, follow_on)?;
        self.node_mut(outer).encapsulated = Some(Encapsulated {
            inner: job,
            follow_on,
        });
        Ok(outer)
    }

    /// A promise of (a slice of) `job`'s return value. For an encapsulating
    /// job this delegates to the encapsulated root.
    ///
    pub fn rv(&self, job: JobId, index: Option<usize>) -> Promise {
        match self.node(job).encapsulated {
            Some(e) => self.rv(e.inner, index),
            None => Promise { job, index },
        }
    }

    /// Lazily allocate a placeholder file for a promise on `job`. Only legal
    /// while a serialization has attached a store to the promising job.
    ///
    pub(crate) fn allocate_promise_file(
        &mut self,
        job: JobId,
        index: Option<usize>,
    ) -> Result<PromiseRef> {
        let store = self
            .node(job)
            .promise_store
            .clone()
            .ok_or(PromiseError::Misuse)?;
        let file_id: FileId = store.get_empty_file_store_id(None)?;
        self.node_mut(job).rvs.push(index, file_id.clone());
        Ok(PromiseRef {
            job_store: store.config().job_store.clone(),
            file_id,
        })
    }

    // ------ validation ------

    /// Run the three submission checks: connectedness, acyclicity of the
    /// augmented graph, and the new-checkpoint constraint.
    ///
    #[tracing::instrument(skip(self))]
    pub fn check_for_deadlocks(&self, job: JobId) -> Result<()> {
        trace!("check_for_deadlocks");

        let roots = self.root_jobs(job);
        self.check_connected(&roots)?;
        self.check_acyclic(&roots)?;
        self.check_new_checkpoints_are_leaves(&roots)?;
        Ok(())
    }

    /// Roots (predecessor-free jobs) of the connected component containing
    /// `job`.
    ///
    pub fn root_jobs(&self, job: JobId) -> BTreeSet<JobId> {
        let mut component = BTreeSet::new();
        let mut stack = vec![job];
        while let Some(j) = stack.pop() {
            if component.insert(j) {
                let node = self.node(j);
                stack.extend(node.predecessors.iter().copied());
                stack.extend(node.children.iter().copied());
                stack.extend(node.follow_ons.iter().copied());
            }
        }
        component
            .into_iter()
            .filter(|j| self.node(*j).predecessors.is_empty())
            .collect()
    }

    fn check_connected(&self, roots: &BTreeSet<JobId>) -> Result<()> {
        match roots.len() {
            1 => Ok(()),
            0 => Err(GraphError::NoRoots.into()),
            _ => {
                let names = roots.iter().map(|j| self.display_name(*j)).collect();
                Err(GraphError::MultipleRoots(names).into())
            }
        }
    }

    /// All jobs reachable from `job` over child and follow-on edges,
    /// including `job` itself.
    ///
    fn reachable(&self, job: JobId, out: &mut BTreeSet<JobId>) {
        if out.insert(job) {
            let node = self.node(job);
            for s in node.children.iter().chain(node.follow_ons.iter()) {
                self.reachable(*s, out);
            }
        }
    }

    /// The implied child edges of the augmented graph: for every follow-on
    /// edge (A, B), every job reachable from A through an initial child edge
    /// gains an edge to B.
    ///
    fn implied_edges(&self, roots: &BTreeSet<JobId>) -> BTreeMap<JobId, Vec<JobId>> {
        let mut nodes = BTreeSet::new();
        for r in roots {
            self.reachable(*r, &mut nodes);
        }

        let mut extra: BTreeMap<JobId, Vec<JobId>> =
            nodes.iter().map(|j| (*j, vec![])).collect();
        for j in &nodes {
            let node = self.node(*j);
            if node.follow_ons.is_empty() {
                continue;
            }
            let mut descendants = BTreeSet::new();
            for c in &node.children {
                self.reachable(*c, &mut descendants);
            }
            for d in descendants {
                extra
                    .get_mut(&d)
                    .map(|v| v.extend(node.follow_ons.iter().copied()));
            }
        }
        extra
    }

    fn check_acyclic(&self, roots: &BTreeSet<JobId>) -> Result<()> {
        if roots.is_empty() {
            return Err(GraphError::NoRoots.into());
        }
        let extra = self.implied_edges(roots);
        let mut visited = BTreeSet::new();
        let mut stack = vec![];
        for r in roots {
            self.cycle_dfs(*r, &mut stack, &mut visited, &extra)?;
        }
        Ok(())
    }

    fn cycle_dfs(
        &self,
        job: JobId,
        stack: &mut Vec<JobId>,
        visited: &mut BTreeSet<JobId>,
        extra: &BTreeMap<JobId, Vec<JobId>>,
    ) -> Result<()> {
        if !visited.contains(&job) {
            visited.insert(job);
            stack.push(job);
            let node = self.node(job);
            let successors = node
                .children
                .iter()
                .chain(node.follow_ons.iter())
                .chain(extra.get(&job).into_iter().flatten())
                .copied()
                .collect::<Vec<_>>();
            for s in successors {
                self.cycle_dfs(s, stack, visited, extra)?;
            }
            stack.pop();
        }
        if stack.contains(&job) {
            let mut path = stack.iter().map(|j| self.display_name(*j)).collect::<Vec<_>>();
            path.push(self.display_name(job));
            return Err(GraphError::Cycle(path).into());
        }
        Ok(())
    }

    /// A checkpoint job added to a graph it is not already a root of must
    /// not carry successors. The historical check requires children,
    /// follow-ons *and* services to all be non-empty before it fires.
    ///
    fn check_new_checkpoints_are_leaves(&self, roots: &BTreeSet<JobId>) -> Result<()> {
        let mut jobs = BTreeSet::new();
        for r in roots {
            self.reachable(*r, &mut jobs);
        }
        for j in jobs {
            let node = self.node(j);
            if node.spec.checkpoint && !roots.contains(&j) {
                if !node.children.is_empty()
                    && !node.follow_ons.is_empty()
                    && !node.services.is_empty()
                {
                    return Err(GraphError::CheckpointNotLeaf(self.display_name(j)).into());
                }
            }
        }
        Ok(())
    }

    /// Jobs in an order where every job appears after all of its direct
    /// predecessors.
    ///
    pub fn topological_order(&self, from: JobId) -> Vec<JobId> {
        let mut ordering = vec![];
        let mut visited = BTreeSet::new();
        self.run_order(from, &mut ordering, &mut visited);
        ordering
    }

    fn run_order(&self, job: JobId, ordering: &mut Vec<JobId>, visited: &mut BTreeSet<JobId>) {
        // A job joins the ordering only once all its predecessors have.
        for p in &self.node(job).predecessors {
            if !visited.contains(p) {
                return;
            }
        }
        if visited.insert(job) {
            ordering.push(job);
            let node = self.node(job);
            let successors = node
                .children
                .iter()
                .chain(node.follow_ons.iter())
                .copied()
                .collect::<Vec<_>>();
            for s in successors {
                self.run_order(s, ordering, visited);
            }
        }
    }
}

/// Anything that can be `run()` as a job body.
///
pub trait Runnable: Send + Sync {
    fn run(&self, ctx: &mut JobContext<'_>, args: &[Value]) -> Result<Value>;
}

/// Handed to a running job: file operations plus the ability to wire
/// successor jobs that will run once this one commits.
///
pub struct JobContext<'a> {
    pub(crate) graph: &'a mut JobGraph,
    pub(crate) current: JobId,
    pub(crate) fs: &'a mut dyn FileStore,
}

impl<'a> JobContext<'a> {
    pub fn file_store(&mut self) -> &mut dyn FileStore {
        &mut *self.fs
    }

    pub fn add_child(&mut self, spec: JobSpec) -> Result<JobId> {
        let child = self.graph.add(spec);
        self.graph.add_child(self.current, child)
    }

    pub fn add_follow_on(&mut self, spec: JobSpec) -> Result<JobId> {
        let follow_on = self.graph.add(spec);
        self.graph.add_follow_on(self.current, follow_on)
    }

    pub fn add_child_fn(&mut self, name: &str, args: Vec<JobArg>) -> Result<JobId> {
        self.graph.add_child_fn(self.current, name, args)
    }

    pub fn add_follow_on_fn(&mut self, name: &str, args: Vec<JobArg>) -> Result<JobId> {
        self.graph.add_follow_on_fn(self.current, name, args)
    }

    pub fn add_service(
        &mut self,
        service: &mut ServiceSpec,
        parent: Option<JobId>,
    ) -> Result<(JobId, Promise)> {
        self.graph.add_service(self.current, service, parent)
    }

    /// A promise of another job's return value, for wiring into successors.
    ///
    pub fn rv(&self, job: JobId, index: Option<usize>) -> Promise {
        self.graph.rv(job, index)
    }

    /// Full access to the graph being grown under the current job.
    ///
    pub fn graph(&mut self) -> &mut JobGraph {
        self.graph
    }
}
