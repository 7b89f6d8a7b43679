use aurora_runtime::ObjectKey;
use thiserror::Error;

/// Failures of a single reconcile, all of them are retried
#[derive(Debug, Error)]
pub enum Error {
    /// Adding the pull secret reference to a service account failed
    #[error("failed to update service account {key}: {source}")]
    UpdateServiceAccount {
        /// The object that was written
        key: ObjectKey,
        /// What the API server said
        #[source]
        source: kube::Error,
    },
    /// Provisioning the registry secret in a namespace failed
    #[error("failed to create secret {key}: {source}")]
    CreateSecret {
        /// The object that was written
        key: ObjectKey,
        /// What the API server said
        #[source]
        source: kube::Error,
    },
    /// Restoring a drifted registry secret failed
    #[error("failed to update secret {key}: {source}")]
    UpdateSecret {
        /// The object that was written
        key: ObjectKey,
        /// What the API server said
        #[source]
        source: kube::Error,
    },
}

/// Result of a reconcile
pub type Result<T, E = Error> = std::result::Result<T, E>;
