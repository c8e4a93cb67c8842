//! Helmsman error abstractions.

use thiserror::Error;

/// Error variants arising from Kubernetes API interactions.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The target object does not exist.
    #[error("the target object was not found")]
    NotFound,
    /// A write conflicted with a concurrent update of the same object.
    #[error("write conflict with a concurrent update")]
    Conflict,
    /// The API call did not complete within its deadline.
    #[error("timeout while awaiting response from the K8s API")]
    Timeout,
    /// Any other API error, assumed to be retryable.
    #[error("transient K8s API error: {0}")]
    Transient(String),
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(status) if status.code == 404 => ApiError::NotFound,
            kube::Error::Api(status) if status.code == 409 => ApiError::Conflict,
            _ => ApiError::Transient(err.to_string()),
        }
    }
}

/// Error variants arising from blueprint resolution.
///
/// These indicate invalid or not-yet-ready inputs. They are surfaced on the
/// cluster's TopologyReconciled condition and are not retried with backoff, as
/// only a change to the input objects can resolve them.
#[derive(Debug, Error)]
pub enum BlueprintError {
    /// The referenced ClusterClass does not exist.
    #[error("ClusterClass {0} was not found")]
    MissingClass(String),
    /// The referenced ClusterClass has not reconciled the current generation.
    #[error(
        "ClusterClass not reconciled. If this condition persists please check ClusterClass status. \
        A ClusterClass is reconciled if .status.observedGeneration == .metadata.generation is true. \
        If this is not the case either ClusterClass reconciliation failed or the ClusterClass is paused"
    )]
    ClusterClassNotReconciled,
    /// A topology variable failed validation against its ClusterClass schema.
    #[error("invalid topology variable {name}: {reason}")]
    InvalidVariable { name: String, reason: String },
    /// A version string does not have the expected `vX.Y.Z` form.
    #[error("invalid version {0}, expected the form vX.Y.Z")]
    InvalidVersion(String),
    /// A worker topology entry references a class its ClusterClass does not define.
    #[error("ClusterClass {class} does not define worker class {worker_class}")]
    UnknownWorkerClass { class: String, worker_class: String },
}
