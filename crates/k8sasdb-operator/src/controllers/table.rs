//! Table controller

use super::Context;
use crate::cluster::{ClusterApi, CreateOutcome, KubeApi};
use crate::crds::{Table, TableKey};
use crate::index::{managed_selector, owner_key, IndexError, OwnerIndex};
use crate::synth::{matches_desired, synthesize, SynthesisConfig};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher::Config,
    },
    Client, ResourceExt,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to fetch Table {table}: {source}")]
    Fetch {
        table: TableKey,
        #[source]
        source: kube::Error,
    },
    #[error("failed to query owner index for Table {table}: {source}")]
    IndexQuery {
        table: TableKey,
        #[source]
        source: IndexError,
    },
    #[error("failed to create CRD {crd}: {source}")]
    Create {
        crd: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to read CRD {crd}: {source}")]
    Lookup {
        crd: String,
        #[source]
        source: kube::Error,
    },
    #[error("CRD {crd} reported as existing but not found")]
    Vanished { crd: String },
    #[error("CRD {crd} is controlled by {owner}, not Table {table}")]
    Ownership {
        crd: String,
        table: TableKey,
        owner: String,
    },
    #[error("failed to update CRD {crd}: {source}")]
    Update {
        crd: String,
        #[source]
        source: kube::Error,
    },
}

/// What a reconciliation pass did to the derived CRD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Result of a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The Table was deleted before the pass ran.
    TableGone,
    /// The Table cannot produce a CRD until it changes.
    SynthesisFailed,
    Applied(ApplyOutcome),
}

/// Converges the derived CRD of one Table per call.
///
/// Holds no state of its own; everything observed comes from the cluster.
pub struct Reconciler<C> {
    cluster: C,
    synthesis: SynthesisConfig,
}

impl<C: ClusterApi> Reconciler<C> {
    pub fn new(cluster: C, synthesis: SynthesisConfig) -> Self {
        Self { cluster, synthesis }
    }

    #[cfg(test)]
    fn cluster(&self) -> &C {
        &self.cluster
    }

    /// One reconciliation pass, mapped to a requeue directive.
    ///
    /// Errors are returned to the caller, which requeues with backoff.
    pub async fn reconcile(&self, key: &TableKey) -> Result<Action, ReconcileError> {
        self.reconcile_table(key).await?;
        Ok(Action::await_change())
    }

    #[instrument(skip_all, fields(table = %key))]
    pub async fn reconcile_table(&self, key: &TableKey) -> Result<Outcome, ReconcileError> {
        let Some(table) = self
            .cluster
            .get_table(key)
            .await
            .map_err(|source| ReconcileError::Fetch {
                table: key.clone(),
                source,
            })?
        else {
            debug!("Table no longer exists");
            return Ok(Outcome::TableGone);
        };

        let owned = self
            .cluster
            .list_owned(key)
            .await
            .map_err(|source| ReconcileError::IndexQuery {
                table: key.clone(),
                source,
            })?;

        let desired = match synthesize(&table, &self.synthesis) {
            Ok(crd) => crd,
            Err(e) => {
                // Retrying cannot help until the Table changes.
                error!(error = %e, "Unable to build CRD for Table");
                return Ok(Outcome::SynthesisFailed);
            }
        };
        let crd_name = desired.name_any();

        let observed = owned.into_iter().find(|crd| crd.name_any() == crd_name);
        let outcome = self.apply(&table, desired, observed).await?;
        match outcome {
            ApplyOutcome::Created => info!(crd = %crd_name, "Created CRD for Table"),
            ApplyOutcome::Updated => info!(crd = %crd_name, "Updated CRD for Table"),
            ApplyOutcome::Unchanged => debug!(crd = %crd_name, "CRD up to date"),
        }
        Ok(Outcome::Applied(outcome))
    }

    async fn apply(
        &self,
        table: &Table,
        desired: CustomResourceDefinition,
        observed: Option<CustomResourceDefinition>,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let observed = match observed {
            Some(observed) => observed,
            None => match self.cluster.create(&desired).await {
                Ok(CreateOutcome::Created) => return Ok(ApplyOutcome::Created),
                Ok(CreateOutcome::AlreadyExists) => self.fetch_existing(table, &desired).await?,
                Err(source) => {
                    return Err(ReconcileError::Create {
                        crd: desired.name_any(),
                        source,
                    })
                }
            },
        };

        if matches_desired(&observed, &desired) && owner_key(&observed) == owner_key(&desired) {
            return Ok(ApplyOutcome::Unchanged);
        }

        let mut updated = observed;
        updated.spec = desired.spec;
        updated.metadata.labels = desired.metadata.labels;
        updated.metadata.owner_references = desired.metadata.owner_references;
        updated.status = None;
        self.cluster
            .replace(&updated)
            .await
            .map(|_| ApplyOutcome::Updated)
            .map_err(|source| ReconcileError::Update {
                crd: updated.name_any(),
                source,
            })
    }

    /// Read a CRD the index does not know about and make sure `table`
    /// controls it.
    async fn fetch_existing(
        &self,
        table: &Table,
        desired: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, ReconcileError> {
        let crd = desired.name_any();
        warn!(crd = %crd, "CRD exists but is missing from the owner index");

        let existing = self
            .cluster
            .get_crd(&crd)
            .await
            .map_err(|source| ReconcileError::Lookup {
                crd: crd.clone(),
                source,
            })?
            .ok_or_else(|| ReconcileError::Vanished { crd: crd.clone() })?;

        if controlled_by(&existing, table) {
            return Ok(existing);
        }
        Err(ReconcileError::Ownership {
            owner: owner_key(&existing)
                .map(|key| format!("Table {key}"))
                .unwrap_or_else(|| "an unknown owner".to_string()),
            table: TableKey::from(table),
            crd,
        })
    }
}

/// Whether `table` is the controller of `crd`, by index key or, when the
/// table-namespace label is gone, by owner uid.
fn controlled_by(crd: &CustomResourceDefinition, table: &Table) -> bool {
    if owner_key(crd) == Some(TableKey::from(table)) {
        return true;
    }
    let Some(uid) = table.uid() else {
        return false;
    };
    crd.owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}

/// Maps a watched CRD to the Table that should be reconciled.
fn table_for_crd(crd: CustomResourceDefinition) -> Option<ObjectRef<Table>> {
    owner_key(&crd).map(|key| key.object_ref())
}

pub struct TableController;

impl TableController {
    /// Start the owner index, then run the controller until shutdown.
    pub async fn run(client: Client, ctx: Arc<Context<KubeApi>>, index: OwnerIndex) {
        let tables: Api<Table> = Api::all(client.clone());
        let crds: Api<CustomResourceDefinition> = Api::all(client);

        tokio::spawn(index.run(crds.clone()));

        Controller::new(tables, Config::default())
            .watches(
                crds,
                Config::default().labels(&managed_selector()),
                table_for_crd,
            )
            .shutdown_on_signal()
            .run(
                |table, ctx| async move { reconcile(table, ctx).await },
                error_policy,
                ctx,
            )
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!(table = %obj, "Reconciled Table"),
                    Err(e) => error!(error = %e, "Reconcile error"),
                }
            })
            .await;
    }
}

async fn reconcile<C: ClusterApi>(
    table: Arc<Table>,
    ctx: Arc<Context<C>>,
) -> Result<Action, ReconcileError> {
    ctx.reconciler.reconcile(&TableKey::from(table.as_ref())).await
}

fn error_policy<C: ClusterApi>(
    table: Arc<Table>,
    error: &ReconcileError,
    ctx: Arc<Context<C>>,
) -> Action {
    error!(table = %TableKey::from(table.as_ref()), error = %error, "Reconcile failed");
    Action::requeue(ctx.error_requeue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ColumnSpec, TableSpec};
    use crate::synth::TABLE_NAMESPACE_LABEL;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::core::ErrorResponse;
    use kube::runtime::watcher;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// In-memory API server: tables by key, CRDs by name, with the owner
    /// index fed the way the watcher would.
    #[derive(Default)]
    struct FakeCluster {
        tables: Mutex<HashMap<TableKey, Table>>,
        crds: Mutex<HashMap<String, CustomResourceDefinition>>,
        index: OwnerIndex,
        creates: Mutex<usize>,
        replaces: Mutex<usize>,
        fail_fetch: bool,
        fail_create: bool,
        /// Creates succeed on the server but never reach the index.
        stale_index: bool,
    }

    impl FakeCluster {
        async fn new() -> Self {
            let cluster = Self::default();
            cluster.index.apply_event(watcher::Event::Init).await;
            cluster.index.apply_event(watcher::Event::InitDone).await;
            cluster
        }

        async fn put_table(&self, table: Table) {
            self.tables.lock().await.insert(TableKey::from(&table), table);
        }

        async fn crd(&self, name: &str) -> Option<CustomResourceDefinition> {
            self.crds.lock().await.get(name).cloned()
        }
    }

    fn server_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    impl ClusterApi for FakeCluster {
        async fn get_table(&self, key: &TableKey) -> Result<Option<Table>, kube::Error> {
            if self.fail_fetch {
                return Err(server_error(500, "InternalError"));
            }
            Ok(self.tables.lock().await.get(key).cloned())
        }

        async fn list_owned(
            &self,
            key: &TableKey,
        ) -> Result<Vec<CustomResourceDefinition>, IndexError> {
            self.index.get(key).await
        }

        async fn get_crd(
            &self,
            name: &str,
        ) -> Result<Option<CustomResourceDefinition>, kube::Error> {
            Ok(self.crd(name).await)
        }

        async fn create(&self, crd: &CustomResourceDefinition) -> Result<CreateOutcome, kube::Error> {
            *self.creates.lock().await += 1;
            if self.fail_create {
                return Err(server_error(500, "InternalError"));
            }
            let mut crds = self.crds.lock().await;
            let name = crd.name_any();
            if crds.contains_key(&name) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            let mut stored = crd.clone();
            stored.metadata.resource_version = Some("1".to_string());
            crds.insert(name, stored.clone());
            if !self.stale_index {
                self.index.apply_event(watcher::Event::Apply(stored)).await;
            }
            Ok(CreateOutcome::Created)
        }

        async fn replace(
            &self,
            crd: &CustomResourceDefinition,
        ) -> Result<CustomResourceDefinition, kube::Error> {
            *self.replaces.lock().await += 1;
            let mut crds = self.crds.lock().await;
            let name = crd.name_any();
            let current = crds
                .get(&name)
                .ok_or_else(|| server_error(404, "NotFound"))?;
            if current.metadata.resource_version != crd.metadata.resource_version {
                return Err(server_error(409, "Conflict"));
            }
            let version: u64 = current
                .metadata
                .resource_version
                .as_deref()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let mut stored = crd.clone();
            stored.metadata.resource_version = Some((version + 1).to_string());
            crds.insert(name, stored.clone());
            self.index.apply_event(watcher::Event::Apply(stored.clone())).await;
            Ok(stored)
        }
    }

    fn orders() -> Table {
        let mut table = Table::new(
            "orders",
            TableSpec {
                columns: vec![ColumnSpec::new("id", "string"), ColumnSpec::new("total", "number")],
                custom_group: None,
            },
        );
        table.metadata.namespace = Some("shop".to_string());
        table.metadata.uid = Some("5b1a7c3e-0000-4000-8000-000000000001".to_string());
        table
    }

    fn key() -> TableKey {
        TableKey::new("shop", "orders")
    }

    const CRD_NAME: &str = "orderss.user.k8sasdb.org";

    fn reconciler(cluster: FakeCluster) -> Reconciler<FakeCluster> {
        Reconciler::new(cluster, SynthesisConfig::default())
    }

    #[tokio::test]
    async fn test_missing_table_is_noop() {
        let r = reconciler(FakeCluster::new().await);
        assert_eq!(r.reconcile_table(&key()).await.unwrap(), Outcome::TableGone);
        assert_eq!(r.reconcile(&key()).await.unwrap(), Action::await_change());
        assert_eq!(*r.cluster().creates.lock().await, 0);
    }

    #[tokio::test]
    async fn test_creates_crd() {
        let cluster = FakeCluster::new().await;
        cluster.put_table(orders()).await;
        let r = reconciler(cluster);

        assert_eq!(
            r.reconcile_table(&key()).await.unwrap(),
            Outcome::Applied(ApplyOutcome::Created)
        );
        let crd = r.cluster().crd(CRD_NAME).await.unwrap();
        assert_eq!(crd.spec.names.kind, "Orders");
        assert_eq!(owner_key(&crd), Some(key()));
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let cluster = FakeCluster::new().await;
        cluster.put_table(orders()).await;
        let r = reconciler(cluster);

        r.reconcile(&key()).await.unwrap();
        assert_eq!(
            r.reconcile_table(&key()).await.unwrap(),
            Outcome::Applied(ApplyOutcome::Unchanged)
        );
        assert_eq!(*r.cluster().creates.lock().await, 1);
        assert_eq!(*r.cluster().replaces.lock().await, 0);
    }

    fn printer_column_count(crd: &CustomResourceDefinition) -> usize {
        crd.spec.versions[0]
            .additional_printer_columns
            .as_ref()
            .map_or(0, Vec::len)
    }

    #[tokio::test]
    async fn test_already_exists_unchanged_is_success() {
        let cluster = FakeCluster {
            stale_index: true,
            ..FakeCluster::new().await
        };
        cluster.put_table(orders()).await;
        let r = reconciler(cluster);

        r.reconcile(&key()).await.unwrap();
        assert_eq!(
            r.reconcile_table(&key()).await.unwrap(),
            Outcome::Applied(ApplyOutcome::Unchanged)
        );
        assert_eq!(r.reconcile(&key()).await.unwrap(), Action::await_change());
        assert_eq!(*r.cluster().replaces.lock().await, 0);
    }

    #[tokio::test]
    async fn test_lagging_index_still_applies_column_change() {
        let cluster = FakeCluster {
            stale_index: true,
            ..FakeCluster::new().await
        };
        cluster.put_table(orders()).await;
        let r = reconciler(cluster);
        r.reconcile(&key()).await.unwrap();

        let mut changed = orders();
        changed.spec.columns.push(ColumnSpec::new("note", "string"));
        r.cluster().put_table(changed).await;

        assert_eq!(
            r.reconcile_table(&key()).await.unwrap(),
            Outcome::Applied(ApplyOutcome::Updated)
        );
        let crd = r.cluster().crd(CRD_NAME).await.unwrap();
        assert_eq!(printer_column_count(&crd), 3);
        assert_eq!(*r.cluster().replaces.lock().await, 1);
    }

    #[tokio::test]
    async fn test_removed_namespace_label_is_restored() {
        let cluster = FakeCluster::new().await;
        cluster.put_table(orders()).await;
        let r = reconciler(cluster);
        r.reconcile(&key()).await.unwrap();

        // Someone strips the label; the CRD drops out of the index.
        let mut stripped = r.cluster().crd(CRD_NAME).await.unwrap();
        stripped
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .remove(TABLE_NAMESPACE_LABEL);
        r.cluster()
            .crds
            .lock()
            .await
            .insert(CRD_NAME.to_string(), stripped.clone());
        r.cluster()
            .index
            .apply_event(watcher::Event::Apply(stripped))
            .await;
        assert!(r.cluster().list_owned(&key()).await.unwrap().is_empty());

        assert_eq!(
            r.reconcile_table(&key()).await.unwrap(),
            Outcome::Applied(ApplyOutcome::Updated)
        );
        let crd = r.cluster().crd(CRD_NAME).await.unwrap();
        assert_eq!(owner_key(&crd), Some(key()));
        assert_eq!(r.cluster().list_owned(&key()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_name_in_other_namespace_is_error() {
        let cluster = FakeCluster::new().await;
        cluster.put_table(orders()).await;
        let mut billing = orders();
        billing.metadata.namespace = Some("billing".to_string());
        billing.metadata.uid = Some("5b1a7c3e-0000-4000-8000-000000000002".to_string());
        cluster.put_table(billing).await;
        let r = reconciler(cluster);

        r.reconcile(&key()).await.unwrap();
        let billing_key = TableKey::new("billing", "orders");
        let err = r.reconcile(&billing_key).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Ownership { ref crd, ref table, ref owner }
                if crd == CRD_NAME && *table == billing_key && owner == "Table shop/orders"
        ));

        // The existing CRD is left with its owner.
        let crd = r.cluster().crd(CRD_NAME).await.unwrap();
        assert_eq!(owner_key(&crd), Some(key()));
        assert_eq!(*r.cluster().replaces.lock().await, 0);
    }

    #[test]
    fn test_table_for_crd() {
        let crd = synthesize(&orders(), &SynthesisConfig::default()).unwrap();
        let obj = table_for_crd(crd.clone()).unwrap();
        assert_eq!(obj.name, "orders");
        assert_eq!(obj.namespace.as_deref(), Some("shop"));

        let mut foreign = crd;
        foreign.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "orders".to_string(),
            uid: "5b1a7c3e-0000-4000-8000-000000000001".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        assert!(table_for_crd(foreign).is_none());
    }

    #[test]
    fn test_controlled_by_uid_without_label() {
        let table = orders();
        let mut crd = synthesize(&table, &SynthesisConfig::default()).unwrap();
        crd.metadata.labels = None;
        assert!(controlled_by(&crd, &table));

        let mut other = orders();
        other.metadata.uid = Some("5b1a7c3e-0000-4000-8000-000000000003".to_string());
        assert!(!controlled_by(&crd, &other));
    }

    #[tokio::test]
    async fn test_column_change_updates_crd() {
        let cluster = FakeCluster::new().await;
        cluster.put_table(orders()).await;
        let r = reconciler(cluster);
        r.reconcile(&key()).await.unwrap();

        let mut changed = orders();
        changed.spec.columns.push(ColumnSpec::new("note", "string"));
        r.cluster().put_table(changed).await;

        assert_eq!(
            r.reconcile_table(&key()).await.unwrap(),
            Outcome::Applied(ApplyOutcome::Updated)
        );
        let crd = r.cluster().crd(CRD_NAME).await.unwrap();
        let columns = crd.spec.versions[0].additional_printer_columns.as_ref().unwrap();
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[2].json_path, ".spec.note");
        assert_eq!(crd.metadata.resource_version.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_synthesis_failure_does_not_requeue() {
        let cluster = FakeCluster::new().await;
        let mut table = orders();
        table.metadata.uid = None;
        cluster.put_table(table).await;
        let r = reconciler(cluster);

        assert_eq!(r.reconcile_table(&key()).await.unwrap(), Outcome::SynthesisFailed);
        assert_eq!(r.reconcile(&key()).await.unwrap(), Action::await_change());
        assert_eq!(*r.cluster().creates.lock().await, 0);
    }

    #[tokio::test]
    async fn test_create_failure_is_error() {
        let cluster = FakeCluster {
            fail_create: true,
            ..FakeCluster::new().await
        };
        cluster.put_table(orders()).await;
        let r = reconciler(cluster);

        let err = r.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Create { ref crd, .. } if crd == CRD_NAME));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_error() {
        let cluster = FakeCluster {
            fail_fetch: true,
            ..FakeCluster::new().await
        };
        let r = reconciler(cluster);
        assert!(matches!(
            r.reconcile(&key()).await.unwrap_err(),
            ReconcileError::Fetch { .. }
        ));
    }

    #[tokio::test]
    async fn test_unsynced_index_is_error() {
        let cluster = FakeCluster::default();
        cluster.put_table(orders()).await;
        let r = reconciler(cluster);

        let err = r.reconcile(&key()).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::IndexQuery {
                source: IndexError::NotSynced,
                ..
            }
        ));
        assert_eq!(*r.cluster().creates.lock().await, 0);
    }

    #[tokio::test]
    async fn test_error_policy_requeues() {
        let ctx = Arc::new(Context {
            reconciler: Reconciler::new(FakeCluster::new().await, SynthesisConfig::default()),
            error_requeue: Duration::from_secs(15),
        });
        let action = error_policy(
            Arc::new(orders()),
            &ReconcileError::IndexQuery {
                table: key(),
                source: IndexError::NotSynced,
            },
            ctx,
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(15)));
    }
}
