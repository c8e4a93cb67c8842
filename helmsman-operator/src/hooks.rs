//! Lifecycle hooks & the hook response tracker.
//!
//! Hooks gate specific points of the reconcile loop, currently only
//! BeforeClusterUpgrade. Responses come from two sources: the runtime
//! extension system (behind the `runtime_hooks_enabled` config flag), and
//! blocking annotations on the cluster object itself.

use async_trait::async_trait;
use std::collections::BTreeMap;

use anyhow::Result;
use helmsman_core::crd::Cluster;
use helmsman_core::ANNOTATION_HOOK_BEFORE_UPGRADE_PREFIX;
use kube::Resource;

/// The name of the hook called before a cluster upgrade is started.
pub const HOOK_BEFORE_CLUSTER_UPGRADE: &str = "BeforeClusterUpgrade";

/// A response to a lifecycle hook call.
#[derive(Clone, Debug, PartialEq)]
pub struct HookResponse {
    /// Seconds after which the hook should be retried. Non-zero blocks the gated operation.
    pub retry_after_seconds: i32,
    /// A human readable message describing the response.
    pub message: String,
}

impl HookResponse {
    /// A response which does not block.
    pub fn proceed() -> Self {
        Self { retry_after_seconds: 0, message: String::new() }
    }

    /// Check if this response blocks the gated operation.
    pub fn is_blocking(&self) -> bool {
        self.retry_after_seconds > 0
    }
}

/// The latest response observed for each hook during a reconcile pass.
#[derive(Default)]
pub struct HookResponseTracker {
    responses: BTreeMap<String, HookResponse>,
}

impl HookResponseTracker {
    /// Record the response for the given hook, replacing any earlier response.
    pub fn add(&mut self, hook: &str, response: HookResponse) {
        self.responses.insert(hook.to_string(), response);
    }

    /// Check if the given hook is blocking.
    pub fn is_blocking(&self, hook: &str) -> bool {
        self.responses.get(hook).map(HookResponse::is_blocking).unwrap_or(false)
    }

    /// The blocking message of the given hook, if it is blocking.
    pub fn blocking_message(&self, hook: &str) -> Option<&str> {
        self.responses.get(hook).filter(|response| response.is_blocking()).map(|response| response.message.as_str())
    }
}

/// External lifecycle hook callers.
#[async_trait]
pub trait LifecycleHooks: Send + Sync + 'static {
    /// Call the BeforeClusterUpgrade hook for the given upgrade.
    async fn before_cluster_upgrade(&self, cluster: &Cluster, from_version: &str, to_version: &str) -> Result<HookResponse>;
}

/// A hook implementation which always allows the gated operation to proceed.
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {
    async fn before_cluster_upgrade(&self, _cluster: &Cluster, _from_version: &str, _to_version: &str) -> Result<HookResponse> {
        Ok(HookResponse::proceed())
    }
}

/// Synthesize a BeforeClusterUpgrade response from blocking annotations on the cluster.
///
/// Any annotation under the hook prefix blocks the upgrade until removed.
pub fn annotation_hook_response(cluster: &Cluster) -> Option<HookResponse> {
    let annotations = cluster.meta().annotations.as_ref()?;
    let keys: Vec<&str> = annotations
        .keys()
        .filter(|key| key.starts_with(ANNOTATION_HOOK_BEFORE_UPGRADE_PREFIX))
        .map(String::as_str)
        .collect();
    if keys.is_empty() {
        return None;
    }
    let message = if keys.len() == 1 {
        format!("annotation [{}] is set", keys[0])
    } else {
        format!("annotations [{}] are set", keys.join(", "))
    };
    Some(HookResponse { retry_after_seconds: 60, message })
}

#[cfg(test)]
mod test {
    use super::*;
    use kube::core::ObjectMeta;

    use helmsman_core::crd::ClusterSpec;

    fn cluster_with_annotations(keys: &[&str]) -> Cluster {
        let mut cluster = Cluster::new("cluster1", ClusterSpec { control_plane_ref: None, topology: None });
        cluster.metadata = ObjectMeta {
            name: Some("cluster1".into()),
            namespace: Some("default".into()),
            annotations: Some(keys.iter().map(|key| (key.to_string(), "".to_string())).collect()),
            ..Default::default()
        };
        cluster
    }

    #[test]
    fn no_annotations_no_response() {
        let cluster = cluster_with_annotations(&["unrelated.io/annotation"]);
        assert_eq!(annotation_hook_response(&cluster), None);
    }

    #[test]
    fn single_annotation_blocks_with_singular_message() {
        let cluster = cluster_with_annotations(&["hooks.helmsman.rs/before-cluster-upgrade-test"]);
        let response = annotation_hook_response(&cluster).unwrap();
        assert!(response.is_blocking());
        assert_eq!(response.message, "annotation [hooks.helmsman.rs/before-cluster-upgrade-test] is set");
    }

    #[test]
    fn multiple_annotations_block_with_plural_message() {
        let cluster = cluster_with_annotations(&[
            "hooks.helmsman.rs/before-cluster-upgrade-a",
            "hooks.helmsman.rs/before-cluster-upgrade-b",
        ]);
        let response = annotation_hook_response(&cluster).unwrap();
        assert_eq!(
            response.message,
            "annotations [hooks.helmsman.rs/before-cluster-upgrade-a, hooks.helmsman.rs/before-cluster-upgrade-b] are set"
        );
    }

    #[test]
    fn tracker_reports_blocking_state() {
        let mut tracker = HookResponseTracker::default();
        tracker.add(HOOK_BEFORE_CLUSTER_UPGRADE, HookResponse::proceed());
        assert!(!tracker.is_blocking(HOOK_BEFORE_CLUSTER_UPGRADE));
        tracker.add(HOOK_BEFORE_CLUSTER_UPGRADE, HookResponse { retry_after_seconds: 30, message: "hold".into() });
        assert!(tracker.is_blocking(HOOK_BEFORE_CLUSTER_UPGRADE));
        assert_eq!(tracker.blocking_message(HOOK_BEFORE_CLUSTER_UPGRADE), Some("hold"));
    }
}
