//! Blueprint resolution.
//!
//! A blueprint is the fully resolved desired shape of a cluster: the topology
//! stanza joined with its ClusterClass, with variables validated and defaults
//! applied. Resolution is deterministic, identical inputs always produce an
//! identical blueprint.

use std::collections::BTreeMap;

use kube::Resource;
use lazy_static::lazy_static;
use regex::Regex;

use helmsman_core::crd::{Cluster, ClusterClass, ClusterClassVariable, ClusterTopology, ClusterVariable, ObjectRef};
use helmsman_core::{BlueprintError, ANNOTATION_DEFER_UPGRADE};

lazy_static! {
    static ref VERSION_RE: Regex = Regex::new(r"^v\d+\.\d+\.\d+$").expect("failed to compile version regex");
}

/// The fully resolved desired shape of a cluster.
#[derive(Debug)]
pub struct ClusterBlueprint {
    /// The topology stanza this blueprint was resolved from.
    pub topology: ClusterTopology,
    /// The desired Kubernetes version of the whole cluster.
    pub version: String,
    /// Desired control plane shape.
    pub control_plane: ControlPlaneBlueprint,
    /// Desired MachineDeployments by topology name.
    pub machine_deployments: BTreeMap<String, WorkerBlueprint>,
    /// Desired MachinePools by topology name.
    pub machine_pools: BTreeMap<String, WorkerBlueprint>,
    /// Resolved variable values by name.
    pub variables: BTreeMap<String, serde_json::Value>,
}

/// Desired control plane shape.
#[derive(Debug)]
pub struct ControlPlaneBlueprint {
    /// The desired version.
    pub version: String,
    /// The desired number of replicas.
    pub replicas: Option<i32>,
    /// The infrastructure machine template from the ClusterClass.
    pub infrastructure_ref: Option<ObjectRef>,
}

/// Desired shape of a single worker pool.
#[derive(Debug)]
pub struct WorkerBlueprint {
    /// The topology name of the pool.
    pub name: String,
    /// The worker class the pool is stamped from.
    pub class: String,
    /// The desired version.
    pub version: String,
    /// The desired number of replicas.
    pub replicas: Option<i32>,
    /// The failure domain, from the topology entry or the worker class default.
    pub failure_domain: Option<String>,
    /// Whether the pool's version upgrade is explicitly deferred.
    pub defer_upgrade: bool,
}

/// Resolve the blueprint for the given cluster & class.
///
/// The cluster must carry a topology stanza referencing the given class.
pub fn resolve(cluster: &Cluster, class: &ClusterClass) -> Result<ClusterBlueprint, BlueprintError> {
    let topology = match &cluster.spec.topology {
        Some(topology) => topology,
        None => {
            return Err(BlueprintError::InvalidVariable {
                name: "topology".into(),
                reason: "cluster has no topology stanza".into(),
            })
        }
    };

    // A class whose controller has not observed the current generation may
    // reference stale templates, refuse to resolve against it.
    let generation = class.meta().generation.unwrap_or(0);
    let observed = class.status.as_ref().and_then(|status| status.observed_generation).unwrap_or(0);
    if generation != observed {
        return Err(BlueprintError::ClusterClassNotReconciled);
    }

    if !VERSION_RE.is_match(&topology.version) {
        return Err(BlueprintError::InvalidVersion(topology.version.clone()));
    }

    let variables = resolve_variables(&topology.variables, &class.spec.variables)?;

    let mut machine_deployments = BTreeMap::new();
    for entry in &topology.workers.machine_deployments {
        let worker_class = class
            .spec
            .workers
            .machine_deployments
            .iter()
            .find(|candidate| candidate.class == entry.class)
            .ok_or_else(|| BlueprintError::UnknownWorkerClass {
                class: topology.class.clone(),
                worker_class: entry.class.clone(),
            })?;
        machine_deployments.insert(
            entry.name.clone(),
            WorkerBlueprint {
                name: entry.name.clone(),
                class: entry.class.clone(),
                version: topology.version.clone(),
                replicas: entry.replicas,
                failure_domain: entry.failure_domain.clone().or_else(|| worker_class.failure_domain.clone()),
                defer_upgrade: entry.annotations.contains_key(ANNOTATION_DEFER_UPGRADE),
            },
        );
    }

    let mut machine_pools = BTreeMap::new();
    for entry in &topology.workers.machine_pools {
        let worker_class = class
            .spec
            .workers
            .machine_pools
            .iter()
            .find(|candidate| candidate.class == entry.class)
            .ok_or_else(|| BlueprintError::UnknownWorkerClass {
                class: topology.class.clone(),
                worker_class: entry.class.clone(),
            })?;
        machine_pools.insert(
            entry.name.clone(),
            WorkerBlueprint {
                name: entry.name.clone(),
                class: entry.class.clone(),
                version: topology.version.clone(),
                replicas: entry.replicas,
                failure_domain: entry.failure_domain.clone().or_else(|| worker_class.failure_domain.clone()),
                defer_upgrade: entry.annotations.contains_key(ANNOTATION_DEFER_UPGRADE),
            },
        );
    }

    Ok(ClusterBlueprint {
        topology: topology.clone(),
        version: topology.version.clone(),
        control_plane: ControlPlaneBlueprint {
            version: topology.version.clone(),
            replicas: topology.control_plane.replicas,
            infrastructure_ref: class.spec.control_plane.machine_infrastructure.clone(),
        },
        machine_deployments,
        machine_pools,
        variables,
    })
}

/// Validate topology variables against their class schemas and apply defaults.
fn resolve_variables(
    values: &[ClusterVariable], schemas: &[ClusterClassVariable],
) -> Result<BTreeMap<String, serde_json::Value>, BlueprintError> {
    let mut resolved = BTreeMap::new();
    for value in values {
        let schema = schemas.iter().find(|schema| schema.name == value.name).ok_or_else(|| BlueprintError::InvalidVariable {
            name: value.name.clone(),
            reason: "variable is not defined by the ClusterClass".into(),
        })?;
        if !value_matches_type(&value.value, &schema.schema.type_) {
            return Err(BlueprintError::InvalidVariable {
                name: value.name.clone(),
                reason: format!("value does not match schema type {}", schema.schema.type_),
            });
        }
        resolved.insert(value.name.clone(), value.value.clone());
    }
    for schema in schemas {
        if resolved.contains_key(&schema.name) {
            continue;
        }
        match (&schema.schema.default, schema.required) {
            (Some(default), _) => {
                resolved.insert(schema.name.clone(), default.clone());
            }
            (None, true) => {
                return Err(BlueprintError::InvalidVariable {
                    name: schema.name.clone(),
                    reason: "required variable has no value and no default".into(),
                });
            }
            (None, false) => (),
        }
    }
    Ok(resolved)
}

fn value_matches_type(value: &serde_json::Value, type_: &str) -> bool {
    match type_ {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => false,
    }
}
