//! In-memory stand-ins for the cluster
use crate::client::ClusterApi;
use async_trait::async_trait;
use aurora_runtime::{store, ObjectKey, Store};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::{core::ErrorResponse, runtime::watcher, Resource};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ReplaceServiceAccount(ObjectKey, ServiceAccount),
    CreateSecret(String, Secret),
    ReplaceSecret(ObjectKey, Secret),
}

/// Records every write, optionally rejecting them with an API error
#[derive(Default)]
pub struct FakeApi {
    calls: Mutex<Vec<Call>>,
    reject_with: Mutex<Option<u16>>,
}

impl FakeApi {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    /// Fails every following write with `code`
    pub fn reject_with(&self, code: u16) {
        *self.reject_with.lock() = Some(code);
    }

    fn record<T: Clone>(&self, call: Call, obj: &T) -> kube::Result<T> {
        self.calls.lock().push(call);
        match *self.reject_with.lock() {
            Some(code) => Err(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "rejected by fake".to_string(),
                reason: if code == 409 { "AlreadyExists" } else { "InternalError" }.to_string(),
                code,
            })),
            None => Ok(obj.clone()),
        }
    }
}

#[async_trait]
impl ClusterApi for FakeApi {
    async fn replace_service_account(&self, key: &ObjectKey, sa: &ServiceAccount) -> kube::Result<ServiceAccount> {
        self.record(Call::ReplaceServiceAccount(key.clone(), sa.clone()), sa)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> kube::Result<Secret> {
        self.record(Call::CreateSecret(namespace.to_string(), secret.clone()), secret)
    }

    async fn replace_secret(&self, key: &ObjectKey, secret: &Secret) -> kube::Result<Secret> {
        self.record(Call::ReplaceSecret(key.clone(), secret.clone()), secret)
    }
}

/// A synced store holding `objs`
pub fn cache<K>(objs: Vec<K>) -> (Store<K>, aurora_runtime::Writer<K>)
where
    K: Resource + Clone + 'static,
{
    let (reader, mut writer) = store();
    writer.apply_watcher_event(&watcher::Event::Init);
    for obj in objs {
        writer.apply_watcher_event(&watcher::Event::InitApply(obj));
    }
    writer.apply_watcher_event(&watcher::Event::InitDone);
    (reader, writer)
}
