//! Lazy references to return values of jobs that have not run yet.
//!
//! At authoring time a promise is just `(job, index)`. When the consumer job
//! is frozen into the store, the promise turns into a `PromiseRef` naming a
//! placeholder file that the producer fills with its return value. On the
//! worker that runs the consumer, the reference dereferences straight to the
//! value; no promise object survives thawing.
//!

use std::io::Read;

use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::{FileId, JobId, JobStore, PromiseError, WorkerContext};

/// Authoring-time reference to a return value: the promising job and an
/// optional index into its (array) return value. `None` selects the whole
/// value.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    pub job: JobId,
    pub index: Option<usize>,
}

/// Frozen form of a promise: coordinates of the placeholder file.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseRef {
    pub job_store: String,
    pub file_id: FileId,
}

/// Return-value registrations of one job: which placeholder files await
/// which slice of the return value.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RvMap(Vec<(Option<usize>, Vec<FileId>)>);

impl RvMap {
    pub fn push(&mut self, index: Option<usize>, id: FileId) {
        match self.0.iter_mut().find(|(i, _)| *i == index) {
            Some((_, ids)) => ids.push(id),
            None => self.0.push((index, vec![id])),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Option<usize>, &Vec<FileId>)> {
        self.0.iter().map(|(i, ids)| (i, ids))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// All registered placeholder file ids.
    pub fn file_ids(&self) -> Vec<FileId> {
        self.0.iter().flat_map(|(_, ids)| ids.clone()).collect()
    }
}

/// Write `values` into every placeholder file registered in `rvs`.
///
/// A placeholder that no longer exists is skipped: this happens when a
/// service is re-run after the consumer of its credentials already finished.
///
#[tracing::instrument(skip(rvs, values, store))]
pub fn fulfil(rvs: &RvMap, values: &Value, store: &dyn JobStore) -> Result<()> {
    trace!("fulfilling {} promise slots", rvs.0.len());

    for (index, ids) in rvs.iter() {
        let promised = match index {
            None => values.clone(),
            Some(i) => values
                .as_array()
                .and_then(|a| a.get(*i))
                .cloned()
                .ok_or(PromiseError::BadIndex(*i))?,
        };
        for id in ids {
            if store.file_exists(id)? {
                let mut out = store.update_file_stream(id)?;
                serde_json::to_writer(&mut out, &promised)?;
                out.flush()?;
            } else {
                debug!("placeholder {id} is gone, skipping");
            }
        }
    }
    Ok(())
}

/// Dereference a frozen promise: read and decode the placeholder file.
///
/// The file id is queued on the worker context for deletion after the
/// consumer commits. An empty placeholder means the consumer ran before the
/// producer wrote it, which is a protocol violation and fatal for the
/// consumer.
///
pub fn resolve(r: &PromiseRef, store: &dyn JobStore, ctx: &WorkerContext) -> Result<Value> {
    trace!("resolving promise file {}", r.file_id);

    if store.config().job_store != r.job_store {
        return Err(eyre::eyre!(
            "promise references a foreign job store {}",
            r.job_store
        ));
    }
    ctx.stage_promised_delete(r.file_id.clone());

    let mut data = vec![];
    let mut stream = store
        .read_file_stream(&r.file_id)
        .map_err(|_| PromiseError::Unfulfilled(r.file_id.clone()))?;
    stream.read_to_end(&mut data)?;
    if data.is_empty() {
        return Err(PromiseError::Unfulfilled(r.file_id.clone()).into());
    }
    let value =
        serde_json::from_slice(&data).map_err(|_| PromiseError::Decode(r.file_id.clone()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rvmap_groups_by_index() {
        let mut rvs = RvMap::default();
        rvs.push(None, "f1".into());
        rvs.push(Some(0), "f2".into());
        rvs.push(None, "f3".into());

        let whole = rvs.iter().find(|(i, _)| i.is_none()).unwrap().1;
        assert_eq!(whole, &vec!["f1".to_string(), "f3".to_string()]);
        assert_eq!(rvs.file_ids().len(), 3);
    }
}
