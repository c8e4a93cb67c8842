//! K8s API access used by the reconcile engine.
//!
//! All engine reads and writes go through the [`ClusterApi`] trait so that the
//! engine can be driven against an in-memory implementation in tests. Writes
//! use K8s [Server-Side Apply](https://kubernetes.io/docs/reference/using-api/server-side-apply/)
//! (SSA), so a stale update is rejected by the API server rather than
//! clobbering concurrent writers.

use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use serde_json::json;
use tokio::time::timeout;

use helmsman_core::crd::{Cluster, ClusterClass, ControlPlane, Machine, MachineDeployment, MachinePool, RequiredMetadata};
use helmsman_core::{ApiError, LABEL_CLUSTER};

use crate::k8s::APP_NAME;

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// The API surface needed by the reconcile engine.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Get the named cluster, `None` if it does not exist.
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, ApiError>;
    /// Get the named cluster class, `None` if it does not exist.
    async fn get_cluster_class(&self, namespace: &str, name: &str) -> Result<Option<ClusterClass>, ApiError>;
    /// Get the named control plane, `None` if it does not exist.
    async fn get_control_plane(&self, namespace: &str, name: &str) -> Result<Option<ControlPlane>, ApiError>;
    /// List the MachineDeployments belonging to the given cluster.
    async fn list_machine_deployments(&self, namespace: &str, cluster: &str) -> Result<Vec<MachineDeployment>, ApiError>;
    /// List the MachinePools belonging to the given cluster.
    async fn list_machine_pools(&self, namespace: &str, cluster: &str) -> Result<Vec<MachinePool>, ApiError>;
    /// List the Machines belonging to the given cluster.
    async fn list_machines(&self, namespace: &str, cluster: &str) -> Result<Vec<Machine>, ApiError>;

    /// Apply the given control plane spec & metadata, creating the object as needed.
    async fn apply_control_plane(&self, cp: &ControlPlane) -> Result<(), ApiError>;
    /// Apply the given control plane's status subresource.
    async fn apply_control_plane_status(&self, cp: &ControlPlane) -> Result<(), ApiError>;
    /// Apply the given MachineDeployment spec & metadata, creating the object as needed.
    async fn apply_machine_deployment(&self, md: &MachineDeployment) -> Result<(), ApiError>;
    /// Apply the given MachinePool spec & metadata, creating the object as needed.
    async fn apply_machine_pool(&self, mp: &MachinePool) -> Result<(), ApiError>;
    /// Apply the given cluster's status subresource.
    async fn apply_cluster_status(&self, cluster: &Cluster) -> Result<(), ApiError>;
}

/// The production [`ClusterApi`] backed by a kube client.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn cluster_selector(cluster: &str) -> ListParams {
        ListParams {
            label_selector: Some(format!("{}={}", LABEL_CLUSTER, cluster)),
            ..Default::default()
        }
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, ApiError>
    where
        K: kube::Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let res = timeout(API_TIMEOUT, api.get(name)).await.map_err(|_| ApiError::Timeout)?;
        match res {
            Ok(obj) => Ok(Some(obj)),
            Err(err) => match ApiError::from(err) {
                ApiError::NotFound => Ok(None),
                err => Err(err),
            },
        }
    }

    async fn list<K>(&self, namespace: &str, cluster: &str) -> Result<Vec<K>, ApiError>
    where
        K: kube::Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let res = timeout(API_TIMEOUT, api.list(&Self::cluster_selector(cluster)))
            .await
            .map_err(|_| ApiError::Timeout)?;
        res.map(|list| list.items).map_err(ApiError::from)
    }

    async fn apply<K>(&self, namespace: &str, name: &str, obj: &K) -> Result<(), ApiError>
    where
        K: kube::Resource<DynamicType = ()> + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let mut obj = obj.clone();
        obj.meta_mut().managed_fields = None;
        let params = PatchParams::apply(APP_NAME).force();
        let res = timeout(API_TIMEOUT, api.patch(name, &params, &Patch::Apply(&obj)))
            .await
            .map_err(|_| ApiError::Timeout)?;
        res.map(|_| ()).map_err(ApiError::from)
    }

    async fn apply_status<K, S>(&self, namespace: &str, name: &str, status: &S) -> Result<(), ApiError>
    where
        K: kube::Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
        S: serde::Serialize,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(APP_NAME).force();
        let patch = json!({
            "apiVersion": K::api_version(&()),
            "kind": K::kind(&()),
            "status": status,
        });
        let res = timeout(API_TIMEOUT, api.patch_status(name, &params, &Patch::Apply(&patch)))
            .await
            .map_err(|_| ApiError::Timeout)?;
        res.map(|_| ()).map_err(ApiError::from)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, ApiError> {
        self.get_opt(namespace, name).await
    }

    async fn get_cluster_class(&self, namespace: &str, name: &str) -> Result<Option<ClusterClass>, ApiError> {
        self.get_opt(namespace, name).await
    }

    async fn get_control_plane(&self, namespace: &str, name: &str) -> Result<Option<ControlPlane>, ApiError> {
        self.get_opt(namespace, name).await
    }

    async fn list_machine_deployments(&self, namespace: &str, cluster: &str) -> Result<Vec<MachineDeployment>, ApiError> {
        self.list(namespace, cluster).await
    }

    async fn list_machine_pools(&self, namespace: &str, cluster: &str) -> Result<Vec<MachinePool>, ApiError> {
        self.list(namespace, cluster).await
    }

    async fn list_machines(&self, namespace: &str, cluster: &str) -> Result<Vec<Machine>, ApiError> {
        self.list(namespace, cluster).await
    }

    async fn apply_control_plane(&self, cp: &ControlPlane) -> Result<(), ApiError> {
        self.apply(cp.namespace(), cp.name(), cp).await
    }

    async fn apply_control_plane_status(&self, cp: &ControlPlane) -> Result<(), ApiError> {
        self.apply_status::<ControlPlane, _>(cp.namespace(), cp.name(), &cp.status).await
    }

    async fn apply_machine_deployment(&self, md: &MachineDeployment) -> Result<(), ApiError> {
        self.apply(md.namespace(), md.name(), md).await
    }

    async fn apply_machine_pool(&self, mp: &MachinePool) -> Result<(), ApiError> {
        self.apply(mp.namespace(), mp.name(), mp).await
    }

    async fn apply_cluster_status(&self, cluster: &Cluster) -> Result<(), ApiError> {
        self.apply_status::<Cluster, _>(cluster.namespace(), cluster.name(), &cluster.status).await
    }
}
