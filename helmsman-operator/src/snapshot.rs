//! Cluster state snapshots.
//!
//! A snapshot is a point-in-time read of all objects belonging to a cluster,
//! bucketed by owner. Missing sub-resources produce an empty state rather than
//! an error; only transient read failures propagate.

use helmsman_core::crd::{Cluster, Machine, RequiredMetadata};
use helmsman_core::{ApiError, LABEL_CONTROL_PLANE, LABEL_DEPLOYMENT_NAME, LABEL_POOL_NAME};

use crate::k8s::client::ClusterApi;
use crate::scope::{ClusterState, ControlPlaneState, MachineDeploymentState, MachinePoolState};

/// The name of the cluster's control plane object.
pub fn control_plane_name(cluster: &Cluster) -> String {
    cluster
        .spec
        .control_plane_ref
        .as_ref()
        .map(|reference| reference.name.clone())
        .unwrap_or_else(|| format!("{}-control-plane", cluster.name()))
}

/// Build a snapshot of the given cluster's objects.
pub async fn build(api: &dyn ClusterApi, cluster: &Cluster) -> Result<ClusterState, ApiError> {
    let namespace = cluster.namespace();
    let name = cluster.name();

    let control_plane = api.get_control_plane(namespace, &control_plane_name(cluster)).await?;
    let machine_deployments = api.list_machine_deployments(namespace, name).await?;
    let machine_pools = api.list_machine_pools(namespace, name).await?;
    let mut machines = api.list_machines(namespace, name).await?;
    machines.sort_by(|a, b| a.name().cmp(b.name()));

    let mut state = ClusterState::default();
    if let Some(object) = control_plane {
        let owned = take_machines(&mut machines, |machine| has_label(machine, LABEL_CONTROL_PLANE));
        state.control_plane = Some(ControlPlaneState { object, machines: owned });
    }
    for object in machine_deployments {
        let pool_name = object.name().to_string();
        let owned = take_machines(&mut machines, |machine| label_value(machine, LABEL_DEPLOYMENT_NAME) == Some(pool_name.as_str()));
        state.machine_deployments.insert(pool_name, MachineDeploymentState { object, machines: owned });
    }
    for object in machine_pools {
        let pool_name = object.name().to_string();
        let owned = take_machines(&mut machines, |machine| label_value(machine, LABEL_POOL_NAME) == Some(pool_name.as_str()));
        state.machine_pools.insert(pool_name, MachinePoolState { object, machines: owned });
    }

    Ok(state)
}

fn take_machines(machines: &mut Vec<Machine>, pred: impl Fn(&Machine) -> bool) -> Vec<Machine> {
    let mut owned = vec![];
    let mut idx = 0;
    while idx < machines.len() {
        if pred(&machines[idx]) {
            owned.push(machines.remove(idx));
        } else {
            idx += 1;
        }
    }
    owned
}

fn has_label(machine: &Machine, label: &str) -> bool {
    use kube::Resource;
    machine.meta().labels.as_ref().map(|labels| labels.contains_key(label)).unwrap_or(false)
}

fn label_value<'a>(machine: &'a Machine, label: &str) -> Option<&'a str> {
    use kube::Resource;
    machine.meta().labels.as_ref().and_then(|labels| labels.get(label)).map(String::as_str)
}
