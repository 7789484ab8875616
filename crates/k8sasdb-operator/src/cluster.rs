//! Cluster access
//!
//! The operations reconciliation needs from the API server, behind a trait
//! so the reconciler can run against an in-memory cluster in tests.

use crate::crds::{Table, TableKey};
use crate::index::{IndexError, OwnerIndex};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, PostParams},
    Client, ResourceExt,
};
use std::future::Future;

/// Result of a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

pub trait ClusterApi: Send + Sync {
    /// Fetch a Table, `None` when it no longer exists.
    fn get_table(
        &self,
        key: &TableKey,
    ) -> impl Future<Output = Result<Option<Table>, kube::Error>> + Send;

    /// CRDs controlled by the Table, from the owner index.
    fn list_owned(
        &self,
        key: &TableKey,
    ) -> impl Future<Output = Result<Vec<CustomResourceDefinition>, IndexError>> + Send;

    /// Read a CRD straight from the API server, bypassing the index.
    fn get_crd(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<CustomResourceDefinition>, kube::Error>> + Send;

    fn create(
        &self,
        crd: &CustomResourceDefinition,
    ) -> impl Future<Output = Result<CreateOutcome, kube::Error>> + Send;

    /// Replace an existing CRD. `crd` carries the observed resourceVersion.
    fn replace(
        &self,
        crd: &CustomResourceDefinition,
    ) -> impl Future<Output = Result<CustomResourceDefinition, kube::Error>> + Send;
}

/// `true` for the 409 the API server returns when a create hits an
/// existing object.
pub fn is_already_exists(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists")
}

/// [`ClusterApi`] backed by a live API server.
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
    index: OwnerIndex,
}

impl KubeApi {
    pub fn new(client: Client, index: OwnerIndex) -> Self {
        Self { client, index }
    }

    fn crds(&self) -> Api<CustomResourceDefinition> {
        Api::all(self.client.clone())
    }
}

impl ClusterApi for KubeApi {
    async fn get_table(&self, key: &TableKey) -> Result<Option<Table>, kube::Error> {
        Api::<Table>::namespaced(self.client.clone(), &key.namespace)
            .get_opt(&key.name)
            .await
    }

    async fn list_owned(&self, key: &TableKey) -> Result<Vec<CustomResourceDefinition>, IndexError> {
        self.index.get(key).await
    }

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, kube::Error> {
        self.crds().get_opt(name).await
    }

    async fn create(&self, crd: &CustomResourceDefinition) -> Result<CreateOutcome, kube::Error> {
        match self.crds().create(&PostParams::default(), crd).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) if is_already_exists(&e) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    async fn replace(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, kube::Error> {
        self.crds()
            .replace(&crd.name_any(), &PostParams::default(), crd)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_is_already_exists() {
        assert!(is_already_exists(&api_error(409, "AlreadyExists")));
        assert!(!is_already_exists(&api_error(409, "Conflict")));
        assert!(!is_already_exists(&api_error(500, "InternalError")));
    }
}
