//! Freezing a job graph into the job store.
//!
//! Every job gets a wrapper and a frozen body blob. Jobs are frozen in
//! reverse topological order so that a consumer holding a promise is frozen
//! before its producer: by the time the producer goes out, the placeholder
//! files for all its consumers exist and are recorded in its `rvs`, and the
//! producer's worker can fill them the moment `run` returns.
//!

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use eyre::{Result, ensure};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    FileId, JobArg, JobBody, JobGraph, JobId, JobStore, JobWrapper, ModuleRef, Resources, RvMap,
    ServiceRef, SuccessorRef, modref, promise,
};

/// The wire form of one job: what lands in the pickle blob.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrozenJob {
    pub body: JobBody,
    pub module: ModuleRef,
    pub resources: Resources,
    pub checkpoint: bool,
    /// Placeholder files awaiting this job's return value
    pub rvs: RvMap,
}

/// Serialize the root job of a freshly authored graph, then everything
/// reachable from it. Returns the root wrapper; the store's root-job marker
/// is set so the workflow can be restarted.
///
#[tracing::instrument(skip_all)]
pub fn serialise_first_job(
    graph: &mut JobGraph,
    root: JobId,
    store: &Arc<dyn JobStore>,
) -> Result<JobWrapper> {
    trace!("serialise_first_job");

    let eff = graph.node(root).spec.resources.effective(store.config());
    let mut wrapper = store.create(None, 0, &eff)?;
    serialise_graph(graph, root, &mut wrapper, store, None, true)?;
    store.update(&wrapper)?;
    store.set_root_job(&wrapper.id)?;
    Ok(wrapper)
}

/// Serialize the successors a finished job created during its run, and
/// materialize the job's return values into its promise files. The wrapper
/// is mutated in place; persisting it is the commit protocol's business.
///
#[tracing::instrument(skip_all)]
pub fn serialise_existing_job(
    graph: &mut JobGraph,
    root: JobId,
    wrapper: &mut JobWrapper,
    store: &Arc<dyn JobStore>,
    return_values: &Value,
) -> Result<()> {
    trace!("serialise_existing_job({})", wrapper.id);

    serialise_graph(graph, root, wrapper, store, Some(return_values), false)?;

    // The job has run, its command is spent.
    wrapper.command = None;

    // Merge the batches recorded by the first serialization with the ones
    // this run added, preserving "follow-ons run after all children".
    ensure!(
        wrapper.stack.len() >= 4,
        "expected at least four stack batches on {}, got {}",
        wrapper.id,
        wrapper.stack.len()
    );
    let new_children = wrapper.stack.pop().unwrap_or_default();
    let new_follow_ons = wrapper.stack.pop().unwrap_or_default();
    let old_children = wrapper.stack.pop().unwrap_or_default();
    let old_follow_ons = wrapper.stack.pop().unwrap_or_default();

    let mut combined_follow_ons = new_follow_ons;
    combined_follow_ons.extend(old_follow_ons);
    let mut combined_children = new_children;
    combined_children.extend(old_children);

    if !combined_follow_ons.is_empty() {
        wrapper.stack.push(combined_follow_ons);
    }
    if !combined_children.is_empty() {
        wrapper.stack.push(combined_children);
    }
    Ok(())
}

fn serialise_graph(
    graph: &mut JobGraph,
    root: JobId,
    root_wrapper: &mut JobWrapper,
    store: &Arc<dyn JobStore>,
    return_values: Option<&Value>,
    first_job: bool,
) -> Result<()> {
    graph.check_for_deadlocks(root)?;

    let mut wrappers = BTreeMap::new();
    make_root_batches(graph, root, store, root_wrapper, &mut wrappers)?;

    let mut ordering = graph.topological_order(root);
    ensure!(
        ordering.len() == wrappers.len() + 1,
        "ordering covers {} jobs but {} wrappers were made",
        ordering.len(),
        wrappers.len() + 1
    );

    // Producers last.
    ordering.reverse();
    ensure!(ordering.last() == Some(&root), "root must close the ordering");

    // Any promise frozen from here on may allocate placeholder files against
    // these jobs, including their services.
    for j in ordering.clone() {
        graph.node_mut(j).promise_store = Some(store.clone());
        for s in graph.service_forest(j) {
            graph.node_mut(s).promise_store = Some(store.clone());
        }
    }

    let outcome = if first_job {
        serialise_all(graph, &ordering, root_wrapper, &mut wrappers, store)
    } else {
        serialise_successors(
            graph,
            root,
            &ordering,
            root_wrapper,
            &mut wrappers,
            store,
            return_values.unwrap_or(&Value::Null),
        )
    };

    // The serialization window is over, promises can no longer allocate.
    for i in 0..graph.len() {
        graph.node_mut(JobId(i)).promise_store = None;
    }
    outcome
}

fn serialise_all(
    graph: &mut JobGraph,
    ordering: &[JobId],
    root_wrapper: &mut JobWrapper,
    wrappers: &mut BTreeMap<JobId, JobWrapper>,
    store: &Arc<dyn JobStore>,
) -> Result<()> {
    let root_id = root_wrapper.id.clone();
    let Some((&root, rest)) = ordering.split_last() else {
        return Ok(());
    };

    for &j in rest {
        let mut w = wrappers
            .remove(&j)
            .ok_or_else(|| eyre::eyre!("no wrapper for job {}", graph.display_name(j)))?;
        serialise_services(graph, j, &mut w, &root_id, store)?;
        serialise_job(graph, j, &mut w, &root_id, store)?;
        wrappers.insert(j, w);
    }
    serialise_services(graph, root, root_wrapper, &root_id, store)?;
    serialise_job(graph, root, root_wrapper, &root_id, store)
}

#[allow(clippy::too_many_arguments)]
fn serialise_successors(
    graph: &mut JobGraph,
    root: JobId,
    ordering: &[JobId],
    root_wrapper: &mut JobWrapper,
    wrappers: &mut BTreeMap<JobId, JobWrapper>,
    store: &Arc<dyn JobStore>,
    return_values: &Value,
) -> Result<()> {
    let root_id = root_wrapper.id.clone();

    // Fill the placeholder files recorded against this job before anything
    // else is frozen: a successor frozen below may itself promise a value
    // that indirectly reads these.
    let before: BTreeSet<FileId> = graph.node(root).rvs.file_ids().into_iter().collect();
    promise::fulfil(&graph.node(root).rvs.clone(), return_values, store.as_ref())?;

    for &j in &ordering[..ordering.len() - 1] {
        let mut w = wrappers
            .remove(&j)
            .ok_or_else(|| eyre::eyre!("no wrapper for job {}", graph.display_name(j)))?;
        serialise_services(graph, j, &mut w, &root_id, store)?;
        serialise_job(graph, j, &mut w, &root_id, store)?;
        wrappers.insert(j, w);
    }

    // Services this job added during its run.
    serialise_services(graph, root, root_wrapper, &root_id, store)?;

    // Freezing the successors may have registered fresh placeholders against
    // this very job; fill those too so the values are visible the moment the
    // wrapper commits.
    let mut fresh = RvMap::default();
    let rvs_after = graph.node(root).rvs.clone();
    for (index, ids) in rvs_after.iter() {
        for id in ids {
            if !before.contains(id) {
                fresh.push(*index, id.clone());
            }
        }
    }
    if !fresh.is_empty() {
        debug!("filling {} late promise files", fresh.file_ids().len());
        promise::fulfil(&fresh, return_values, store.as_ref())?;
    }
    Ok(())
}

/// Create wrappers for every successor of the root, recording the stack
/// batches as they are discovered. The follow-on batch is pushed before the
/// child batch, so children sit on top.
///
fn make_root_batches(
    graph: &JobGraph,
    root: JobId,
    store: &Arc<dyn JobStore>,
    root_wrapper: &mut JobWrapper,
    wrappers: &mut BTreeMap<JobId, JobWrapper>,
) -> Result<()> {
    let node = graph.node(root);
    for successors in [node.follow_ons.clone(), node.children.clone()] {
        let mut batch = vec![];
        for s in successors {
            batch.push(make_successor(graph, s, store, wrappers)?);
        }
        root_wrapper.stack.push(batch);
    }
    Ok(())
}

fn make_successor(
    graph: &JobGraph,
    job: JobId,
    store: &Arc<dyn JobStore>,
    wrappers: &mut BTreeMap<JobId, JobWrapper>,
) -> Result<SuccessorRef> {
    if !wrappers.contains_key(&job) {
        let node = graph.node(job);
        let eff = node.spec.resources.effective(store.config());
        let wrapper = store.create(None, node.predecessors.len() as u32, &eff)?;
        wrappers.insert(job, wrapper);

        for successors in [node.follow_ons.clone(), node.children.clone()] {
            let mut batch = vec![];
            for s in successors {
                batch.push(make_successor(graph, s, store, wrappers)?);
            }
            if let Some(w) = wrappers.get_mut(&job) {
                w.stack.push(batch);
            }
        }
    }

    let w = &wrappers[&job];
    // The tag lets the leader tell multiple completions of the same
    // predecessor apart; single-predecessor successors need none.
    let predecessor_tag = (w.predecessor_number > 1).then(|| Uuid::new_v4().to_string());
    Ok(SuccessorRef {
        id: w.id.clone(),
        memory: w.memory,
        cores: w.cores,
        disk: w.disk,
        preemptable: w.preemptable,
        predecessor_tag,
    })
}

/// Freeze one job body into the store and point the wrapper's command at it.
///
fn serialise_job(
    graph: &mut JobGraph,
    job: JobId,
    wrapper: &mut JobWrapper,
    root_wrapper_id: &str,
    store: &Arc<dyn JobStore>,
) -> Result<()> {
    trace!("serialise_job({})", graph.display_name(job));

    // Freeze the arguments: every authoring-time promise becomes a reference
    // to a lazily allocated placeholder file.
    let mut body = graph.node(job).spec.body.clone();
    for arg in body.args_mut() {
        if let JobArg::Promise(p) = arg {
            let r = graph.allocate_promise_file(p.job, p.index)?;
            *arg = JobArg::PromiseRef(r);
        }
    }

    let node = graph.node(job);
    let frozen = FrozenJob {
        body,
        module: graph.module().globalize(),
        resources: node.spec.resources,
        checkpoint: node.spec.checkpoint,
        rvs: node.rvs.clone(),
    };

    // Frozen bodies live and die with the root wrapper of their graph.
    let (mut out, pickle_id) = store.write_file_stream(Some(root_wrapper_id))?;
    serde_json::to_writer(&mut out, &frozen)?;
    out.flush()?;
    drop(out);

    wrapper.command = Some(modref::encode_command(&pickle_id, &frozen.module));
    store.update(wrapper)?;

    graph.node_mut(job).promise_store = None;
    Ok(())
}

/// Give every service of `job` (and recursively their children) a wrapper of
/// its own, with fresh start/terminate/error flags, grouped by depth on the
/// owning wrapper.
///
fn serialise_services(
    graph: &mut JobGraph,
    job: JobId,
    wrapper: &mut JobWrapper,
    root_wrapper_id: &str,
    store: &Arc<dyn JobStore>,
) -> Result<()> {
    let roots = graph.node(job).services.clone();
    for s in roots {
        process_service(graph, s, 0, wrapper, root_wrapper_id, store)?;
    }
    graph.node_mut(job).services.clear();
    Ok(())
}

fn process_service(
    graph: &mut JobGraph,
    service: JobId,
    depth: usize,
    owner: &mut JobWrapper,
    root_wrapper_id: &str,
    store: &Arc<dyn JobStore>,
) -> Result<()> {
    trace!("process_service({}, depth {depth})", graph.display_name(service));

    if depth == owner.services.len() {
        owner.services.push(vec![]);
    }

    // Children first so deeper levels are registered before this one is
    // frozen without them.
    for c in graph.node(service).service_children.clone() {
        process_service(graph, c, depth + 1, owner, root_wrapper_id, store)?;
    }

    let eff = graph
        .node(service)
        .spec
        .resources
        .effective(store.config());
    let mut wrapper = store.create(None, 1, &eff)?;
    wrapper.start_file = Some(store.get_empty_file_store_id(None)?);
    wrapper.terminate_file = Some(store.get_empty_file_store_id(None)?);
    wrapper.error_file = Some(store.get_empty_file_store_id(None)?);

    if let Some(batch) = owner.services.get_mut(depth) {
        batch.push(ServiceRef {
            id: wrapper.id.clone(),
            memory: wrapper.memory,
            cores: wrapper.cores,
            disk: wrapper.disk,
            start_file: wrapper.start_file.clone().unwrap_or_default(),
            terminate_file: wrapper.terminate_file.clone().unwrap_or_default(),
            error_file: wrapper.error_file.clone().unwrap_or_default(),
        });
    }

    // A frozen service body never drags its child services along; they have
    // wrappers of their own by now.
    graph.node_mut(service).service_children.clear();

    serialise_job(graph, service, &mut wrapper, root_wrapper_id, store)
}
