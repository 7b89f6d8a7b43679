//! Controllers that further configure the Aurora platform
//!
//! The `image-pull-secrets` controllers distribute one registry [`Credential`](config::Credential):
//!
//! - [`NamespaceSync`](namespaces::NamespaceSync) keeps a `kubernetes.io/dockerconfigjson`
//!   secret holding the credential in every namespace
//! - [`ServiceAccountSync`](serviceaccounts::ServiceAccountSync) makes every service account
//!   reference that secret in its `imagePullSecrets`
pub mod client;
pub mod config;
mod error;
pub mod namespaces;
pub mod secret;
pub mod serviceaccounts;
#[cfg(test)]
mod testing;

pub use error::{Error, Result};
