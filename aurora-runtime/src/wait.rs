//! Waiting for caches to be populated
use crate::store::{CacheSync, WriterDropped};
use futures::future::try_join_all;

/// Resolves once every cache in `caches` has received its initial list
///
/// # Errors
///
/// Fails as soon as any of the caches lost its writer before syncing.
pub async fn wait_for_cache_sync(caches: &[CacheSync]) -> Result<(), WriterDropped> {
    try_join_all(caches.iter().map(CacheSync::wait)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::wait_for_cache_sync;
    use crate::store::{store, WriterDropped};
    use futures::{poll, FutureExt};
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use kube::runtime::watcher;

    #[tokio::test]
    async fn barrier_should_wait_for_every_cache() {
        let (cms, mut cm_writer) = store::<ConfigMap>();
        let (secrets, mut secret_writer) = store::<Secret>();
        let caches = [cms.sync_handle(), secrets.sync_handle()];
        let mut barrier = Box::pin(wait_for_cache_sync(&caches));

        cm_writer.apply_watcher_event(&watcher::Event::Init);
        cm_writer.apply_watcher_event(&watcher::Event::InitDone);
        assert!(poll!(barrier.as_mut()).is_pending());

        secret_writer.apply_watcher_event(&watcher::Event::Init);
        secret_writer.apply_watcher_event(&watcher::Event::InitDone);
        assert_eq!(barrier.await, Ok(()));
    }

    #[tokio::test]
    async fn barrier_should_fail_when_a_writer_is_gone() {
        let (cms, writer) = store::<ConfigMap>();
        drop(writer);
        assert_eq!(
            wait_for_cache_sync(&[cms.sync_handle()]).now_or_never(),
            Some(Err(WriterDropped))
        );
    }

    #[tokio::test]
    async fn empty_barrier_should_pass() {
        assert_eq!(wait_for_cache_sync(&[]).now_or_never(), Some(Ok(())));
    }
}
