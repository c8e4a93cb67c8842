//! The reconcile engine.
//!
//! One pass per cluster: snapshot the observed objects, resolve the blueprint,
//! record hook responses, plan the upgrade, propagate spec changes to the
//! targets allowed to change this pass, and synthesize status. A pass owns its
//! scope exclusively; all API access goes through the [`ClusterApi`] trait.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use helmsman_core::conditions;
use helmsman_core::crd::{
    Cluster, ControlPlane, ControlPlaneSpec, Machine, MachineDeployment, MachineDeploymentSpec, MachinePool,
    MachinePoolSpec, MachineTemplate, RequiredMetadata, MACHINE_COMPONENT_CONDITIONS,
    MACHINE_CONDITION_ETCD_MEMBER_HEALTHY,
};
use helmsman_core::{ApiError, BlueprintError, LABEL_CLUSTER};

use crate::blueprint::{self, ClusterBlueprint, WorkerBlueprint};
use crate::config::Config;
use crate::hooks::{annotation_hook_response, LifecycleHooks, HOOK_BEFORE_CLUSTER_UPGRADE};
use crate::k8s::client::ClusterApi;
use crate::remediation;
use crate::scope::Scope;
use crate::snapshot;
use crate::status::control_plane::{self as cp_status, PreflightCheckResults};
use crate::status::{machine_noun, topology, StatusPolicy};

const METRIC_RECONCILE_PASSES: &str = "reconcile_passes";
const METRIC_RECONCILE_ERRORS: &str = "reconcile_errors";
const METRIC_RECONCILE_CONFLICTS: &str = "reconcile_conflicts";

/// A conflicting concurrent writer invalidates the whole pass; retry it from
/// scratch a few times before handing back to the scheduler.
const MAX_CONFLICT_RETRIES: usize = 3;

/// The engine which reconciles a single cluster per call.
pub struct ReconcileEngine {
    api: Arc<dyn ClusterApi>,
    hooks: Arc<dyn LifecycleHooks>,
    config: Config,
    policy: StatusPolicy,
}

impl ReconcileEngine {
    /// Create a new instance.
    pub fn new(api: Arc<dyn ClusterApi>, hooks: Arc<dyn LifecycleHooks>, config: Config) -> Self {
        metrics::register_counter!(METRIC_RECONCILE_PASSES, metrics::Unit::Count, "the number of cluster reconcile passes started");
        metrics::register_counter!(METRIC_RECONCILE_ERRORS, metrics::Unit::Count, "the number of cluster reconcile passes which failed");
        metrics::register_counter!(METRIC_RECONCILE_CONFLICTS, metrics::Unit::Count, "the number of reconcile passes retried after a write conflict");
        let policy = StatusPolicy::from_config(&config);
        Self { api, hooks, config, policy }
    }

    /// Reconcile the named cluster.
    ///
    /// Write conflicts retry the whole pass; any other error propagates to the
    /// scheduler for requeue.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<()> {
        let mut attempt = 0;
        loop {
            metrics::increment_counter!(METRIC_RECONCILE_PASSES);
            match self.reconcile_pass(namespace, name, Utc::now()).await {
                Err(err) if is_conflict(&err) && attempt < MAX_CONFLICT_RETRIES => {
                    metrics::increment_counter!(METRIC_RECONCILE_CONFLICTS);
                    tracing::debug!(namespace, name, "write conflict, retrying reconcile pass");
                    attempt += 1;
                }
                Err(err) => {
                    metrics::increment_counter!(METRIC_RECONCILE_ERRORS);
                    return Err(err);
                }
                Ok(()) => return Ok(()),
            }
        }
    }

    async fn reconcile_pass(&self, namespace: &str, name: &str, now: DateTime<Utc>) -> Result<()> {
        let cluster = match self.api.get_cluster(namespace, name).await.context("error fetching cluster")? {
            Some(cluster) => cluster,
            None => return Ok(()),
        };
        if cluster.spec.topology.is_none() {
            tracing::debug!(namespace, name, "cluster has no topology stanza, skipping");
            return Ok(());
        }
        let mut scope = Scope::new(cluster);

        // Deletion pre-empts everything else.
        if scope.cluster.meta().deletion_timestamp.is_some() {
            topology::set_topology_reconciled_condition(&mut scope, None, now);
            self.api.apply_cluster_status(&scope.cluster).await.context("error applying cluster status")?;
            return Ok(());
        }

        let outcome = self.reconcile_topology(&mut scope, now).await;
        let error_text = outcome.as_ref().err().map(|err| format!("{:#}", err));
        topology::set_topology_reconciled_condition(&mut scope, error_text.as_deref(), now);
        self.api.apply_cluster_status(&scope.cluster).await.context("error applying cluster status")?;

        match outcome {
            Ok(()) => Ok(()),
            // Invalid inputs are surfaced on the condition; only a change to
            // the input objects can resolve them, so the pass itself succeeds.
            Err(err) if err.downcast_ref::<BlueprintError>().is_some() => {
                tracing::warn!(namespace, name, error = %err, "topology not reconcilable");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn reconcile_topology(&self, scope: &mut Scope, now: DateTime<Utc>) -> Result<()> {
        scope.current = snapshot::build(self.api.as_ref(), &scope.cluster).await.context("error building cluster snapshot")?;

        let class_name = scope
            .cluster
            .spec
            .topology
            .as_ref()
            .map(|topology| topology.class.clone())
            .unwrap_or_default();
        let class = self
            .api
            .get_cluster_class(scope.cluster.namespace(), &class_name)
            .await
            .context("error fetching cluster class")?
            .ok_or(BlueprintError::MissingClass(class_name))?;
        scope.blueprint = Some(blueprint::resolve(&scope.cluster, &class)?);

        self.call_hooks(scope).await?;
        self.compute_upgrade_plan(scope);
        self.reconcile_control_plane(scope, now).await?;
        self.reconcile_workers(scope).await?;
        Ok(())
    }

    /// Record BeforeClusterUpgrade responses when a version upgrade is pending.
    ///
    /// Blocking annotations on the cluster take precedence over the runtime
    /// extension system, which is only consulted when enabled.
    async fn call_hooks(&self, scope: &mut Scope) -> Result<()> {
        let target = match scope.blueprint.as_ref() {
            Some(blueprint) => blueprint.version.clone(),
            None => return Ok(()),
        };
        let current = match scope.current.control_plane.as_ref() {
            Some(state) if state.object.spec.version != target => state.object.spec.version.clone(),
            _ => return Ok(()),
        };
        if let Some(response) = annotation_hook_response(&scope.cluster) {
            scope.hook_responses.add(HOOK_BEFORE_CLUSTER_UPGRADE, response);
            return Ok(());
        }
        if self.config.runtime_hooks_enabled {
            let response = self
                .hooks
                .before_cluster_upgrade(&scope.cluster, &current, &target)
                .await
                .context("error calling BeforeClusterUpgrade hook")?;
            scope.hook_responses.add(HOOK_BEFORE_CLUSTER_UPGRADE, response);
        }
        Ok(())
    }

    /// Populate the upgrade tracker for this pass.
    ///
    /// The control plane always gates workers: a pool may only pick up the new
    /// version once the control plane has fully settled on it. The gate runs
    /// both ways: the control plane does not pick up a new version while any
    /// worker pool is still rolling machines. Pools beyond the concurrency
    /// budget are held pending behind the pools already upgrading; pools with
    /// the defer annotation are held explicitly.
    fn compute_upgrade_plan(&self, scope: &mut Scope) {
        let blueprint = match scope.blueprint.as_ref() {
            Some(blueprint) => blueprint,
            None => return,
        };
        let target = blueprint.version.as_str();
        let hook_blocking = scope.hook_responses.is_blocking(HOOK_BEFORE_CLUSTER_UPGRADE);

        let (cp_version, provisioning, cp_machines_upgrading) = match scope.current.control_plane.as_ref() {
            Some(state) => (Some(state.object.spec.version.clone()), state.is_provisioning(), state.is_upgrading()),
            None => (None, true, false),
        };
        let cp_version_behind = cp_version.as_deref().map(|version| version != target).unwrap_or(false);

        let tracker = &mut scope.upgrade_tracker;
        for (name, state) in &scope.current.machine_deployments {
            if state.is_upgrading() {
                tracker.machine_deployments.mark_upgrading(name);
            }
        }
        for (name, state) in &scope.current.machine_pools {
            if state.is_upgrading() {
                tracker.machine_pools.mark_upgrading(name);
            }
        }
        let workers_upgrading =
            tracker.machine_deployments.is_any_upgrading() || tracker.machine_pools.is_any_upgrading();

        tracker.control_plane.is_provisioning = provisioning;
        tracker.control_plane.is_upgrading = cp_machines_upgrading;
        tracker.control_plane.is_pending_upgrade =
            cp_version_behind && (provisioning || cp_machines_upgrading || workers_upgrading || hook_blocking);
        if cp_version_behind && !tracker.control_plane.is_pending_upgrade {
            // Picks up the new version this pass.
            tracker.control_plane.is_upgrading = true;
        }

        let workers_eligible =
            !cp_version_behind && !provisioning && !tracker.control_plane.is_upgrading && !hook_blocking;

        let mut upgrading = tracker.machine_deployments.upgrading_count() + tracker.machine_pools.upgrading_count();

        for (name, worker) in &blueprint.machine_deployments {
            let current = match scope.current.machine_deployments.get(name) {
                Some(state) => state.object.spec.version.as_deref(),
                None => continue,
            };
            if current == Some(target) {
                continue;
            }
            // A pool mid-rollout to its current version pends the next hop
            // until that rollout completes.
            if tracker.machine_deployments.is_upgrading(name) || !workers_eligible {
                tracker.machine_deployments.mark_pending(name);
            } else if worker.defer_upgrade {
                tracker.machine_deployments.mark_deferred(name);
            } else if upgrading >= self.config.max_concurrent_pool_upgrades {
                tracker.machine_deployments.mark_pending(name);
            } else {
                tracker.machine_deployments.mark_upgrading(name);
                upgrading += 1;
            }
        }
        for (name, worker) in &blueprint.machine_pools {
            let current = match scope.current.machine_pools.get(name) {
                Some(state) => state.object.spec.version.as_deref(),
                None => continue,
            };
            if current == Some(target) {
                continue;
            }
            if tracker.machine_pools.is_upgrading(name) || !workers_eligible {
                tracker.machine_pools.mark_pending(name);
            } else if worker.defer_upgrade {
                tracker.machine_pools.mark_deferred(name);
            } else if upgrading >= self.config.max_concurrent_pool_upgrades {
                tracker.machine_pools.mark_pending(name);
            } else {
                tracker.machine_pools.mark_upgrading(name);
                upgrading += 1;
            }
        }
    }

    /// Propagate the desired control plane spec and synthesize its status.
    async fn reconcile_control_plane(&self, scope: &Scope, now: DateTime<Utc>) -> Result<()> {
        let blueprint = match scope.blueprint.as_ref() {
            Some(blueprint) => blueprint,
            None => return Ok(()),
        };
        let current = scope.current.control_plane.as_ref();
        let hold_version = scope.upgrade_tracker.control_plane.is_pending_upgrade;
        let desired = desired_control_plane(&scope.cluster, blueprint, current.map(|state| &state.object), hold_version);
        self.api.apply_control_plane(&desired).await.context("error applying control plane")?;

        // Status synthesis needs the provider's observations; a control plane
        // created this pass has none yet.
        let state = match current {
            Some(state) => state,
            None => return Ok(()),
        };
        let mut cp = state.object.clone();
        cp.spec = desired.spec.clone();
        remediation::set_last_remediation(&mut cp, &state.machines);
        let preflight = self.preflight_checks(scope, blueprint);
        let deletion_message;
        let deletion = if cp.meta().deletion_timestamp.is_some() {
            let count = state.machines.len();
            deletion_message = format!("Deleting {} {}", count, machine_noun(count));
            Some(("WaitingForMachineDeletion", deletion_message.as_str()))
        } else {
            None
        };
        cp_status::update(&mut cp, &state.machines, &preflight, deletion, &self.policy, now);
        self.api.apply_control_plane_status(&cp).await.context("error applying control plane status")?;
        Ok(())
    }

    /// Evaluate the preflight checks gating control plane scale & rollout.
    fn preflight_checks(&self, scope: &Scope, blueprint: &ClusterBlueprint) -> PreflightCheckResults {
        let state = match scope.current.control_plane.as_ref() {
            Some(state) => state,
            None => return PreflightCheckResults::default(),
        };
        let cp = &state.object;
        let machines = &state.machines;
        let managed = cp.is_etcd_managed();

        let topology_version_pending = if scope.upgrade_tracker.control_plane.is_pending_upgrade {
            Some(blueprint.version.clone())
        } else {
            None
        };
        let has_deleting_machine = machines.iter().any(|machine| machine.meta().deletion_timestamp.is_some());

        let component_types: Vec<&str> =
            MACHINE_COMPONENT_CONDITIONS.iter().copied().filter(|type_| managed || *type_ != "EtcdPodHealthy").collect();
        let control_plane_components_unhealthy = machines.iter().any(|machine| {
            component_types.iter().any(|type_| !machine_condition_is_true(machine, type_))
        });

        let etcd_cluster_unhealthy = managed && {
            let status = cp.status.as_ref();
            status.map(|status| status.etcd_members.is_none()).unwrap_or(true)
                || status.and_then(|status| status.etcd_members_agree_with_machines) != Some(true)
                || machines.iter().any(|machine| !machine_condition_is_true(machine, MACHINE_CONDITION_ETCD_MEMBER_HEALTHY))
        };

        let infra_template_missing = match &blueprint.control_plane.infrastructure_ref {
            Some(_) => None,
            None => Some("InfrastructureMachineTemplate".to_string()),
        };

        PreflightCheckResults {
            topology_version_pending,
            has_deleting_machine,
            control_plane_components_unhealthy,
            etcd_cluster_unhealthy,
            infra_template_missing,
        }
    }

    /// Propagate desired worker pool specs, honoring upgrade holds.
    async fn reconcile_workers(&self, scope: &Scope) -> Result<()> {
        let blueprint = match scope.blueprint.as_ref() {
            Some(blueprint) => blueprint,
            None => return Ok(()),
        };
        let md_tracker = &scope.upgrade_tracker.machine_deployments;
        let md_held: Vec<String> =
            md_tracker.pending_names().into_iter().chain(md_tracker.deferred_names()).collect();
        for (name, worker) in &blueprint.machine_deployments {
            let current = scope.current.machine_deployments.get(name).map(|state| &state.object);
            let version = if md_held.contains(name) {
                current.and_then(|md| md.spec.version.clone()).unwrap_or_else(|| worker.version.clone())
            } else {
                worker.version.clone()
            };
            let desired = desired_machine_deployment(&scope.cluster, worker, version);
            self.api.apply_machine_deployment(&desired).await.context("error applying machine deployment")?;
        }

        let mp_tracker = &scope.upgrade_tracker.machine_pools;
        let mp_held: Vec<String> =
            mp_tracker.pending_names().into_iter().chain(mp_tracker.deferred_names()).collect();
        for (name, worker) in &blueprint.machine_pools {
            let current = scope.current.machine_pools.get(name).map(|state| &state.object);
            let version = if mp_held.contains(name) {
                current.and_then(|mp| mp.spec.version.clone()).unwrap_or_else(|| worker.version.clone())
            } else {
                worker.version.clone()
            };
            let desired = desired_machine_pool(&scope.cluster, worker, version);
            self.api.apply_machine_pool(&desired).await.context("error applying machine pool")?;
        }
        Ok(())
    }
}

fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ApiError>(), Some(ApiError::Conflict))
}

fn machine_condition_is_true(machine: &Machine, type_: &str) -> bool {
    machine
        .status
        .as_ref()
        .map(|status| conditions::is_true(&status.conditions, type_))
        .unwrap_or(false)
}

fn owned_meta(cluster: &Cluster, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(cluster.namespace().to_string()),
        labels: Some(vec![(LABEL_CLUSTER.to_string(), cluster.name().to_string())].into_iter().collect()),
        ..Default::default()
    }
}

fn desired_control_plane(
    cluster: &Cluster, blueprint: &ClusterBlueprint, current: Option<&ControlPlane>, hold_version: bool,
) -> ControlPlane {
    let version = match current {
        Some(cp) if hold_version => cp.spec.version.clone(),
        _ => blueprint.control_plane.version.clone(),
    };
    let name = snapshot::control_plane_name(cluster);
    let mut cp = ControlPlane::new(
        &name,
        ControlPlaneSpec {
            version,
            replicas: blueprint.control_plane.replicas,
            machine_template: MachineTemplate { infrastructure_ref: blueprint.control_plane.infrastructure_ref.clone() },
            external_etcd_endpoints: current.and_then(|cp| cp.spec.external_etcd_endpoints.clone()),
        },
    );
    cp.metadata = owned_meta(cluster, &name);
    cp
}

fn desired_machine_deployment(cluster: &Cluster, worker: &WorkerBlueprint, version: String) -> MachineDeployment {
    let mut md = MachineDeployment::new(
        &worker.name,
        MachineDeploymentSpec {
            replicas: worker.replicas,
            version: Some(version),
            failure_domain: worker.failure_domain.clone(),
        },
    );
    md.metadata = owned_meta(cluster, &worker.name);
    md
}

fn desired_machine_pool(cluster: &Cluster, worker: &WorkerBlueprint, version: String) -> MachinePool {
    let mut mp = MachinePool::new(
        &worker.name,
        MachinePoolSpec {
            replicas: worker.replicas,
            version: Some(version),
            failure_domain: worker.failure_domain.clone(),
        },
    );
    mp.metadata = owned_meta(cluster, &worker.name);
    mp
}
