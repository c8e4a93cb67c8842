//! Kubernetes controller.
//!
//! This controller watches the topology CRDs, maps each event to the cluster
//! which owns the changed object, and feeds the owning cluster's name into a
//! reconcile queue drained by the engine. Objects are cached so that watcher
//! echoes of our own writes do not schedule redundant passes. A periodic full
//! pass re-lists all clusters to recover from any missed events.

pub(crate) mod client;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::prelude::*;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::Resource;
use kube_runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::engine::ReconcileEngine;
use crate::hooks::NoopHooks;
use crate::k8s::client::KubeClusterApi;
use helmsman_core::crd::{
    Cluster, ClusterClass, ControlPlane, Machine, MachineDeployment, MachinePool, RequiredMetadata,
};
use helmsman_core::LABEL_CLUSTER;

/// The app name used by the operator, also its SSA field manager name.
pub(crate) const APP_NAME: &str = "helmsman-operator";
/// The timeout duration used before rescheduling a failed reconcile task.
const RESCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);

const METRIC_RECONCILES_SCHEDULED: &str = "reconciles_scheduled";
const METRIC_WATCHER_ERRORS: &str = "watcher_errors";

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// A queued reconcile of a single cluster.
struct ReconcileTask {
    namespace: String,
    name: String,
}

/// Kubernetes controller for watching Helmsman CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The reconcile engine driven by this controller.
    engine: Arc<ReconcileEngine>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of reconcile tasks.
    tasks_tx: mpsc::Sender<ReconcileTask>,
    /// A channel of reconcile tasks.
    tasks_rx: ReceiverStream<ReconcileTask>,

    /// All known cluster objects.
    clusters: HashMap<Arc<String>, Cluster>,
    /// All known cluster class objects.
    classes: HashMap<Arc<String>, ClusterClass>,
    /// All known control plane objects.
    control_planes: HashMap<Arc<String>, ControlPlane>,
    /// All known MachineDeployment objects.
    machine_deployments: HashMap<Arc<String>, MachineDeployment>,
    /// All known MachinePool objects.
    machine_pools: HashMap<Arc<String>, MachinePool>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_RECONCILES_SCHEDULED, metrics::Unit::Count, "the number of cluster reconcile tasks scheduled");
        metrics::register_counter!(METRIC_WATCHER_ERRORS, metrics::Unit::Count, "the number of errors received from k8s watcher streams");
        let api = Arc::new(KubeClusterApi::new(client.clone()));
        let engine = Arc::new(ReconcileEngine::new(api, Arc::new(NoopHooks), (*config).clone()));
        let (tasks_tx, tasks_rx) = mpsc::channel(1000);
        Self {
            client,
            config,
            engine,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            tasks_tx,
            tasks_rx: ReceiverStream::new(tasks_rx),
            clusters: Default::default(),
            classes: Default::default(),
            control_planes: Default::default(),
            machine_deployments: Default::default(),
            machine_pools: Default::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        // Build watcher streams.
        let params_all = ListParams::default();
        let params_owned = self.list_params_cluster_owned();
        let clusters: Api<Cluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let clusters_watcher = watcher(clusters, params_all.clone());
        let classes: Api<ClusterClass> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let classes_watcher = watcher(classes, params_all.clone());
        let control_planes: Api<ControlPlane> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let control_planes_watcher = watcher(control_planes, params_owned.clone());
        let machine_deployments: Api<MachineDeployment> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let machine_deployments_watcher = watcher(machine_deployments, params_owned.clone());
        let machine_pools: Api<MachinePool> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let machine_pools_watcher = watcher(machine_pools, params_owned.clone());
        let machines: Api<Machine> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let machines_watcher = watcher(machines, params_owned.clone());
        tokio::pin!(
            clusters_watcher,
            classes_watcher,
            control_planes_watcher,
            machine_deployments_watcher,
            machine_pools_watcher,
            machines_watcher
        );

        let mut full_pass = tokio::time::interval(Duration::from_secs(self.config.full_reconciliation_seconds));
        full_pass.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = clusters_watcher.next() => self.handle_cluster_event(k8s_event_res).await,
                Some(k8s_event_res) = classes_watcher.next() => self.handle_class_event(k8s_event_res).await,
                Some(k8s_event_res) = control_planes_watcher.next() => self.handle_control_plane_event(k8s_event_res).await,
                Some(k8s_event_res) = machine_deployments_watcher.next() => self.handle_machine_deployment_event(k8s_event_res).await,
                Some(k8s_event_res) = machine_pools_watcher.next() => self.handle_machine_pool_event(k8s_event_res).await,
                Some(k8s_event_res) = machines_watcher.next() => self.handle_machine_event(k8s_event_res).await,
                _ = full_pass.tick() => self.full_reconciliation().await,
                Some(task) = self.tasks_rx.next() => self.handle_reconcile_task(task).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Re-list all clusters and schedule a reconcile for each.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn full_reconciliation(&mut self) {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let clusters = match api.list(&ListParams::default()).await.context("error fetching clusters") {
            Ok(clusters) => clusters,
            Err(err) => {
                tracing::error!(error = ?err, "error performing full reconciliation pass");
                return;
            }
        };
        for cluster in clusters.items {
            self.schedule_cluster(cluster.namespace(), cluster.name());
        }
    }

    /// Drive one queued reconcile through the engine, rescheduling on error.
    #[tracing::instrument(level = "debug", skip(self, task))]
    async fn handle_reconcile_task(&mut self, task: ReconcileTask) {
        if let Err(err) = self.engine.reconcile(&task.namespace, &task.name).await {
            tracing::error!(error = ?err, namespace = %task.namespace, cluster = %task.name, "error reconciling cluster");
            self.spawn_reconcile_task(task, true);
        }
    }

    /// Schedule a reconcile of the named cluster.
    fn schedule_cluster(&self, namespace: &str, name: &str) {
        if name.is_empty() {
            return;
        }
        metrics::increment_counter!(METRIC_RECONCILES_SCHEDULED);
        self.spawn_reconcile_task(ReconcileTask { namespace: namespace.to_string(), name: name.to_string() }, false);
    }

    /// Spawn a task which emits a new reconcile task.
    ///
    /// This indirection is used to ensure that we don't use an unlimited amount of memory with an
    /// unbounded queue, and also so that we do not block the controller from making progress and
    /// dead-locking when we hit the reconcile task queue cap.
    fn spawn_reconcile_task(&self, task: ReconcileTask, is_retry: bool) {
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            if is_retry {
                tokio::time::sleep(RESCHEDULE_TIMEOUT).await;
            }
            let _res = tx.send(task).await;
        });
    }

    /// Create a list params object which selects only objects belonging to some cluster.
    fn list_params_cluster_owned(&self) -> ListParams {
        ListParams {
            label_selector: Some(LABEL_CLUSTER.into()),
            ..Default::default()
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Cluster Events ////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `Cluster` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_cluster_event(&mut self, res: EventResult<Cluster>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Cluster k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS);
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.cluster_applied(obj),
            Event::Deleted(obj) => self.cluster_deleted(obj),
            Event::Restarted(objs) => {
                for obj in objs {
                    self.cluster_applied(obj);
                }
            }
        }
    }

    fn cluster_applied(&mut self, cluster: Cluster) {
        let name_str = match cluster.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.clusters.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &cluster {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        let namespace = cluster.namespace().to_string();
        self.clusters.insert(name.clone(), cluster);
        self.schedule_cluster(&namespace, &name);
    }

    fn cluster_deleted(&mut self, cluster: Cluster) {
        let name_str = match cluster.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        if self.clusters.remove(name_str).is_none() {
            return;
        }
        self.schedule_cluster(cluster.namespace(), name_str);
    }
}

//////////////////////////////////////////////////////////////////////////////
// ClusterClass Events ///////////////////////////////////////////////////////
impl Controller {
    /// Handle `ClusterClass` watcher event.
    ///
    /// A class change affects every cluster whose topology is stamped from it,
    /// so those clusters are found from the cluster cache and rescheduled.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_class_event(&mut self, res: EventResult<ClusterClass>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from ClusterClass k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS);
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.class_applied(obj),
            Event::Deleted(obj) => {
                if let Some(name) = obj.meta().name.as_ref() {
                    self.classes.remove(name);
                    self.schedule_class_clusters(name);
                }
            }
            Event::Restarted(objs) => {
                for obj in objs {
                    self.class_applied(obj);
                }
            }
        }
    }

    fn class_applied(&mut self, class: ClusterClass) {
        let name_str = match class.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.classes.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &class {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        self.classes.insert(name.clone(), class);
        self.schedule_class_clusters(&name);
    }

    fn schedule_class_clusters(&self, class: &str) {
        let affected: Vec<(String, String)> = self
            .clusters
            .values()
            .filter(|cluster| {
                cluster.spec.topology.as_ref().map(|topology| topology.class == class).unwrap_or(false)
            })
            .map(|cluster| (cluster.namespace().to_string(), cluster.name().to_string()))
            .collect();
        for (namespace, name) in affected {
            self.schedule_cluster(&namespace, &name);
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Owned Object Events ///////////////////////////////////////////////////////
impl Controller {
    /// Handle `ControlPlane` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_control_plane_event(&mut self, res: EventResult<ControlPlane>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from ControlPlane k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS);
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.control_plane_applied(obj),
            Event::Deleted(obj) => {
                if let Some(name) = obj.meta().name.as_ref() {
                    self.control_planes.remove(name);
                }
                self.schedule_owner(obj.meta());
            }
            Event::Restarted(objs) => {
                for obj in objs {
                    self.control_plane_applied(obj);
                }
            }
        }
    }

    fn control_plane_applied(&mut self, cp: ControlPlane) {
        let name_str = match cp.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.control_planes.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &cp {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        self.schedule_owner(cp.meta());
        self.control_planes.insert(name, cp);
    }

    /// Handle `MachineDeployment` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_machine_deployment_event(&mut self, res: EventResult<MachineDeployment>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from MachineDeployment k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS);
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.machine_deployment_applied(obj),
            Event::Deleted(obj) => {
                if let Some(name) = obj.meta().name.as_ref() {
                    self.machine_deployments.remove(name);
                }
                self.schedule_owner(obj.meta());
            }
            Event::Restarted(objs) => {
                for obj in objs {
                    self.machine_deployment_applied(obj);
                }
            }
        }
    }

    fn machine_deployment_applied(&mut self, md: MachineDeployment) {
        let name_str = match md.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.machine_deployments.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &md {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        self.schedule_owner(md.meta());
        self.machine_deployments.insert(name, md);
    }

    /// Handle `MachinePool` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_machine_pool_event(&mut self, res: EventResult<MachinePool>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from MachinePool k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS);
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.machine_pool_applied(obj),
            Event::Deleted(obj) => {
                if let Some(name) = obj.meta().name.as_ref() {
                    self.machine_pools.remove(name);
                }
                self.schedule_owner(obj.meta());
            }
            Event::Restarted(objs) => {
                for obj in objs {
                    self.machine_pool_applied(obj);
                }
            }
        }
    }

    fn machine_pool_applied(&mut self, mp: MachinePool) {
        let name_str = match mp.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.machine_pools.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &mp {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        self.schedule_owner(mp.meta());
        self.machine_pools.insert(name, mp);
    }

    /// Handle `Machine` watcher event.
    ///
    /// Machines are not cached: their condition changes come from other
    /// controllers and every one of them feeds the status roll-ups.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_machine_event(&mut self, res: EventResult<Machine>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Machine k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS);
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) | Event::Deleted(obj) => self.schedule_owner(obj.meta()),
            Event::Restarted(objs) => {
                for obj in objs {
                    self.schedule_owner(obj.meta());
                }
            }
        }
    }

    /// Schedule a reconcile of the cluster named by the object's cluster label.
    fn schedule_owner(&self, meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) {
        let cluster = meta.labels.as_ref().and_then(|labels| labels.get(LABEL_CLUSTER));
        let namespace = meta.namespace.as_deref().unwrap_or(&self.config.namespace);
        if let Some(cluster) = cluster {
            self.schedule_cluster(namespace, cluster);
        }
    }
}
