//! Owner index
//!
//! Secondary index from a Table's `(namespace, name)` to the CRDs it
//! controls. Fed by a CRD watcher started once before the controller, read
//! by every reconciliation.

use crate::crds::{Table, TableKey};
use crate::synth::{MANAGED_BY, MANAGED_BY_LABEL, TABLE_NAMESPACE_LABEL};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Resource, ResourceExt,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("owner index has not completed its initial list")]
    NotSynced,
}

/// Label selector matching CRDs written by this operator.
pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY}")
}

/// Index extractor: the Table controlling `crd`, if any.
///
/// Only a controller reference of kind `Table` in `db.k8sasdb.org/v1`
/// counts, and the namespace comes from the table-namespace label since
/// CRDs are cluster-scoped.
pub fn owner_key(crd: &CustomResourceDefinition) -> Option<TableKey> {
    let owner = crd
        .owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true))?;
    if owner.kind != Table::kind(&()) || owner.api_version != Table::api_version(&()) {
        return None;
    }
    let namespace = crd.labels().get(TABLE_NAMESPACE_LABEL)?;
    Some(TableKey::new(namespace.as_str(), owner.name.as_str()))
}

#[derive(Default)]
struct IndexState {
    by_owner: HashMap<TableKey, BTreeMap<String, Arc<CustomResourceDefinition>>>,
    owner_of: HashMap<String, TableKey>,
    /// Objects collected during a relist, swapped in on `InitDone`.
    relist: Option<Vec<CustomResourceDefinition>>,
    synced: bool,
}

impl IndexState {
    fn upsert(&mut self, crd: CustomResourceDefinition) {
        let name = crd.name_any();
        self.remove(&name);
        if let Some(key) = owner_key(&crd) {
            self.by_owner
                .entry(key.clone())
                .or_default()
                .insert(name.clone(), Arc::new(crd));
            self.owner_of.insert(name, key);
        }
    }

    fn remove(&mut self, name: &str) {
        let Some(key) = self.owner_of.remove(name) else {
            return;
        };
        if let Some(owned) = self.by_owner.get_mut(&key) {
            owned.remove(name);
            if owned.is_empty() {
                self.by_owner.remove(&key);
            }
        }
    }

    fn apply(&mut self, event: watcher::Event<CustomResourceDefinition>) {
        match event {
            watcher::Event::Apply(crd) => self.upsert(crd),
            watcher::Event::Delete(crd) => self.remove(&crd.name_any()),
            watcher::Event::Init => self.relist = Some(Vec::new()),
            watcher::Event::InitApply(crd) => match self.relist.as_mut() {
                Some(buffer) => buffer.push(crd),
                None => self.upsert(crd),
            },
            watcher::Event::InitDone => {
                self.by_owner.clear();
                self.owner_of.clear();
                for crd in self.relist.take().unwrap_or_default() {
                    self.upsert(crd);
                }
                self.synced = true;
            }
        }
    }
}

/// Shared handle to the owner index.
#[derive(Clone, Default)]
pub struct OwnerIndex {
    state: Arc<RwLock<IndexState>>,
}

impl OwnerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one watcher event into the index.
    pub async fn apply_event(&self, event: watcher::Event<CustomResourceDefinition>) {
        self.state.write().await.apply(event);
    }

    /// CRDs controlled by `key`, ordered by name.
    pub async fn get(&self, key: &TableKey) -> Result<Vec<CustomResourceDefinition>, IndexError> {
        let state = self.state.read().await;
        if !state.synced {
            return Err(IndexError::NotSynced);
        }
        Ok(state
            .by_owner
            .get(key)
            .map(|owned| owned.values().map(|crd| crd.as_ref().clone()).collect())
            .unwrap_or_default())
    }

    #[cfg(test)]
    async fn is_synced(&self) -> bool {
        self.state.read().await.synced
    }

    /// Keep the index in sync with managed CRDs until the watch ends.
    pub async fn run(self, api: Api<CustomResourceDefinition>) {
        let config = watcher::Config::default().labels(&managed_selector());
        info!(selector = %managed_selector(), "Starting owner index watcher");

        let mut events = watcher(api, config).default_backoff().boxed();
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    if matches!(event, watcher::Event::InitDone) {
                        debug!("Owner index synced");
                    }
                    self.apply_event(event).await;
                }
                Err(e) => warn!(error = %e, "Owner index watch error"),
            }
        }
    }
}
