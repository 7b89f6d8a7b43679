//! Makes every service account reference the registry credential
use crate::{client::ClusterApi, config::Credential, Error, Result};
use async_trait::async_trait;
use aurora_runtime::{ObjectKey, Reconciler, Store};
use k8s_openapi::api::core::v1::{LocalObjectReference, ServiceAccount};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Reconciles service accounts, keyed by namespace and name
pub struct ServiceAccountSync {
    accounts: Store<ServiceAccount>,
    api: Arc<dyn ClusterApi>,
    credential: Arc<Credential>,
}

impl ServiceAccountSync {
    /// Reads from the service account cache, writes through `api`
    #[must_use]
    pub fn new(accounts: Store<ServiceAccount>, api: Arc<dyn ClusterApi>, credential: Arc<Credential>) -> Self {
        Self {
            accounts,
            api,
            credential,
        }
    }
}

fn references(sa: &ServiceAccount, secret_name: &str) -> bool {
    sa.image_pull_secrets
        .iter()
        .flatten()
        .any(|reference| reference.name == secret_name)
}

#[async_trait]
impl Reconciler for ServiceAccountSync {
    type Error = Error;

    #[instrument(skip_all, fields(%key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(sa) = self.accounts.get(key) else {
            debug!("service account is gone");
            return Ok(());
        };
        if references(&sa, self.credential.name()) {
            return Ok(());
        }

        info!(secret = self.credential.name(), "adding image pull secret");
        let mut updated = ServiceAccount::clone(&sa);
        updated
            .image_pull_secrets
            .get_or_insert_with(Vec::new)
            .push(LocalObjectReference {
                name: self.credential.name().to_string(),
            });
        self.api
            .replace_service_account(key, &updated)
            .await
            .map_err(|source| Error::UpdateServiceAccount {
                key: key.clone(),
                source,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ServiceAccountSync;
    use crate::{
        config::Credential,
        testing::{cache, Call, FakeApi},
        Error,
    };
    use aurora_runtime::{ObjectKey, Reconciler};
    use k8s_openapi::api::core::v1::{LocalObjectReference, ServiceAccount};
    use kube::{api::ObjectMeta, runtime::watcher};
    use std::sync::Arc;

    fn credential() -> Arc<Credential> {
        Arc::new(Credential::new("aurora-registry", r#"{"auths":{}}"#).unwrap())
    }

    fn sa(pull_secrets: &[&str]) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some("default".to_string()),
                namespace: Some("team-a".to_string()),
                resource_version: Some("1".to_string()),
                ..ObjectMeta::default()
            },
            image_pull_secrets: (!pull_secrets.is_empty()).then(|| {
                pull_secrets
                    .iter()
                    .map(|name| LocalObjectReference { name: name.to_string() })
                    .collect()
            }),
            ..ServiceAccount::default()
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default").within("team-a")
    }

    #[tokio::test]
    async fn credential_should_be_appended_after_existing_entries() {
        let (accounts, _writer) = cache(vec![sa(&["team-registry", "mirror"])]);
        let api = Arc::new(FakeApi::default());
        let sync = ServiceAccountSync::new(accounts, api.clone(), credential());

        sync.reconcile(&key()).await.unwrap();
        match api.calls().as_slice() {
            [Call::ReplaceServiceAccount(replaced_key, replaced)] => {
                assert_eq!(replaced_key, &key());
                let names = replaced
                    .image_pull_secrets
                    .iter()
                    .flatten()
                    .map(|r| r.name.as_str())
                    .collect::<Vec<_>>();
                assert_eq!(names, vec!["team-registry", "mirror", "aurora-registry"]);
                // Optimistic concurrency relies on the cached version
                assert_eq!(replaced.metadata.resource_version.as_deref(), Some("1"));
            }
            other => panic!("unexpected calls {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconcile_should_be_idempotent() {
        let (accounts, mut writer) = cache(vec![sa(&[])]);
        let api = Arc::new(FakeApi::default());
        let sync = ServiceAccountSync::new(accounts, api.clone(), credential());

        sync.reconcile(&key()).await.unwrap();
        let updated = match api.calls().pop() {
            Some(Call::ReplaceServiceAccount(_, updated)) => updated,
            other => panic!("unexpected call {other:?}"),
        };
        // The informer observes our own write
        writer.apply_watcher_event(&watcher::Event::Apply(updated));
        api.clear();

        sync.reconcile(&key()).await.unwrap();
        assert_eq!(api.calls(), vec![]);
    }

    #[tokio::test]
    async fn missing_account_should_be_a_noop() {
        let (accounts, _writer) = cache(vec![]);
        let api = Arc::new(FakeApi::default());
        let sync = ServiceAccountSync::new(accounts, api.clone(), credential());

        sync.reconcile(&key()).await.unwrap();
        assert_eq!(api.calls(), vec![]);
    }

    #[tokio::test]
    async fn conflicts_should_be_reported_for_retry() {
        let (accounts, _writer) = cache(vec![sa(&[])]);
        let api = Arc::new(FakeApi::default());
        api.reject_with(409);
        let sync = ServiceAccountSync::new(accounts, api.clone(), credential());

        let err = sync.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, Error::UpdateServiceAccount { .. }), "{err}");
    }
}
