//! Provisions the registry secret in every namespace and keeps its payload current
use crate::{
    client::ClusterApi,
    config::Credential,
    secret::{desired_secret, payload_matches, with_payload},
    Error, Result,
};
use async_trait::async_trait;
use aurora_runtime::{ObjectKey, Reconciler, Store};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Reconciles namespaces, keyed by namespace name
///
/// Active namespaces get the registry secret created if it is missing, and its
/// payload restored if it drifted. Terminating and vanished namespaces are left alone.
pub struct NamespaceSync {
    namespaces: Store<Namespace>,
    secrets: Store<Secret>,
    api: Arc<dyn ClusterApi>,
    credential: Arc<Credential>,
}

impl NamespaceSync {
    /// Reads from the namespace and secret caches, writes through `api`
    #[must_use]
    pub fn new(
        namespaces: Store<Namespace>,
        secrets: Store<Secret>,
        api: Arc<dyn ClusterApi>,
        credential: Arc<Credential>,
    ) -> Self {
        Self {
            namespaces,
            secrets,
            api,
            credential,
        }
    }
}

fn is_terminating(ns: &Namespace) -> bool {
    ns.status.as_ref().and_then(|status| status.phase.as_deref()) == Some("Terminating")
}

/// Maps changes of the managed secret to the namespace that holds it
///
/// Secrets with any other name are ignored.
pub fn secret_to_namespace(secret_name: &str) -> impl Fn(&Secret) -> Option<ObjectKey> + Send + Sync + 'static {
    let secret_name = secret_name.to_string();
    move |secret| {
        if secret.metadata.name.as_deref() != Some(secret_name.as_str()) {
            return None;
        }
        secret.metadata.namespace.as_deref().map(ObjectKey::new)
    }
}

#[async_trait]
impl Reconciler for NamespaceSync {
    type Error = Error;

    #[instrument(skip_all, fields(%key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(ns) = self.namespaces.get(key) else {
            debug!("namespace is gone");
            return Ok(());
        };
        if is_terminating(&ns) {
            debug!("namespace is terminating");
            return Ok(());
        }

        let namespace = key.name.as_str();
        let secret_key = ObjectKey::new(self.credential.name()).within(namespace);
        match self.secrets.get(&secret_key) {
            None => {
                info!(secret = %secret_key, "creating secret");
                self.api
                    .create_secret(namespace, &desired_secret(namespace, &self.credential))
                    .await
                    .map_err(|source| Error::CreateSecret {
                        key: secret_key.clone(),
                        source,
                    })?;
            }
            Some(current) if payload_matches(&current, &self.credential) => {}
            Some(current) => {
                info!(secret = %secret_key, "updating secret");
                self.api
                    .replace_secret(&secret_key, &with_payload(&current, &self.credential))
                    .await
                    .map_err(|source| Error::UpdateSecret {
                        key: secret_key.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{secret_to_namespace, NamespaceSync};
    use crate::{
        config::Credential,
        secret::{desired_secret, payload_matches, DOCKER_CONFIG_JSON_KEY},
        testing::{cache, Call, FakeApi},
        Error,
    };
    use aurora_runtime::{ObjectKey, Reconciler};
    use k8s_openapi::{
        api::core::v1::{Namespace, NamespaceStatus, Secret},
        ByteString,
    };
    use kube::{api::ObjectMeta, runtime::watcher};
    use std::{collections::BTreeMap, sync::Arc};

    fn credential() -> Arc<Credential> {
        Arc::new(Credential::new("aurora-registry", r#"{"auths":{"r.example":{}}}"#).unwrap())
    }

    fn ns(phase: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some("team-a".to_string()),
                ..ObjectMeta::default()
            },
            status: Some(NamespaceStatus {
                phase: Some(phase.to_string()),
                ..NamespaceStatus::default()
            }),
            ..Namespace::default()
        }
    }

    fn existing(payload: &[u8]) -> Secret {
        let mut secret = desired_secret("team-a", &credential());
        secret.metadata.resource_version = Some("7".to_string());
        secret.metadata.annotations = Some(BTreeMap::from([("note".to_string(), "manual".to_string())]));
        secret.data = Some(BTreeMap::from([
            (DOCKER_CONFIG_JSON_KEY.to_string(), ByteString(payload.to_vec())),
            ("extra".to_string(), ByteString(b"keep".to_vec())),
        ]));
        secret
    }

    fn key() -> ObjectKey {
        ObjectKey::new("team-a")
    }

    #[tokio::test]
    async fn missing_secret_should_converge_in_one_create() {
        let (namespaces, _ns_writer) = cache(vec![ns("Active")]);
        let (secrets, mut secret_writer) = cache(vec![]);
        let api = Arc::new(FakeApi::default());
        let sync = NamespaceSync::new(namespaces, secrets, api.clone(), credential());

        sync.reconcile(&key()).await.unwrap();
        let created = match api.calls().as_slice() {
            [Call::CreateSecret(namespace, created)] => {
                assert_eq!(namespace, "team-a");
                assert_eq!(created, &desired_secret("team-a", &credential()));
                created.clone()
            }
            other => panic!("unexpected calls {other:?}"),
        };

        secret_writer.apply_watcher_event(&watcher::Event::Apply(created));
        api.clear();
        sync.reconcile(&key()).await.unwrap();
        assert_eq!(api.calls(), vec![]);
    }

    #[tokio::test]
    async fn drifted_payload_should_be_corrected_in_place() {
        let (namespaces, _ns_writer) = cache(vec![ns("Active")]);
        let (secrets, _secret_writer) = cache(vec![existing(b"{\"auths\":{}}")]);
        let api = Arc::new(FakeApi::default());
        let sync = NamespaceSync::new(namespaces, secrets, api.clone(), credential());

        sync.reconcile(&key()).await.unwrap();
        match api.calls().as_slice() {
            [Call::ReplaceSecret(secret_key, updated)] => {
                assert_eq!(secret_key, &ObjectKey::new("aurora-registry").within("team-a"));
                assert!(payload_matches(updated, &credential()));
                let before = existing(b"");
                assert_eq!(updated.metadata, before.metadata);
                assert_eq!(updated.data.as_ref().unwrap()["extra"], ByteString(b"keep".to_vec()));
            }
            other => panic!("unexpected calls {other:?}"),
        }
    }

    #[tokio::test]
    async fn matching_payload_should_be_left_alone() {
        let (namespaces, _ns_writer) = cache(vec![ns("Active")]);
        let (secrets, _secret_writer) = cache(vec![existing(credential().docker_config_json())]);
        let api = Arc::new(FakeApi::default());
        let sync = NamespaceSync::new(namespaces, secrets, api.clone(), credential());

        sync.reconcile(&key()).await.unwrap();
        assert_eq!(api.calls(), vec![]);
    }

    #[tokio::test]
    async fn terminating_or_missing_namespaces_should_be_skipped() {
        let (secrets, _secret_writer) = cache(vec![]);
        let api = Arc::new(FakeApi::default());

        let (namespaces, _ns_writer) = cache(vec![ns("Terminating")]);
        let sync = NamespaceSync::new(namespaces, secrets.clone(), api.clone(), credential());
        sync.reconcile(&key()).await.unwrap();

        let (namespaces, _ns_writer) = cache::<Namespace>(vec![]);
        let sync = NamespaceSync::new(namespaces, secrets, api.clone(), credential());
        sync.reconcile(&key()).await.unwrap();

        assert_eq!(api.calls(), vec![]);
    }

    #[tokio::test]
    async fn create_conflict_should_be_reported_for_retry() {
        let (namespaces, _ns_writer) = cache(vec![ns("Active")]);
        let (secrets, _secret_writer) = cache(vec![]);
        let api = Arc::new(FakeApi::default());
        api.reject_with(409);
        let sync = NamespaceSync::new(namespaces, secrets, api.clone(), credential());

        let err = sync.reconcile(&key()).await.unwrap_err();
        match err {
            Error::CreateSecret { key, source } => {
                assert_eq!(key, ObjectKey::new("aurora-registry").within("team-a"));
                assert!(matches!(source, kube::Error::Api(ref resp) if resp.code == 409));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn only_the_managed_secret_should_map_to_its_namespace() {
        let mapper = secret_to_namespace("aurora-registry");
        assert_eq!(
            mapper(&desired_secret("team-a", &credential())),
            Some(ObjectKey::new("team-a"))
        );
        let other = Secret {
            metadata: ObjectMeta {
                name: Some("unrelated".to_string()),
                namespace: Some("team-a".to_string()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        };
        assert_eq!(mapper(&other), None);
    }
}
