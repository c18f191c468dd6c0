use crate::constants::{PROGRESS_CHANNEL_CAPACITY, PROGRESS_REPORT_MIN_INTERVAL_MS};
use crate::error::{LayerstackError, Result};
use crate::logging::{BuildEvent, BuildObserver};
use crate::oci::digest::Digest;
use crate::oci::reference::Reference;
use crate::oci::registry::{status_hash, RawManifest, Registry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Progress of a running push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub complete: u64,
    pub total: u64,
    pub error: Option<String>,
}

/// Everything a push writes, owned so it can move into the push task
pub struct PushPlan {
    /// Base layers that must exist in the target repository
    pub base_layers: Vec<(Digest, u64)>,
    pub base_repository: Option<Reference>,
    pub blobs: Vec<(Digest, Vec<u8>)>,
    pub manifest: RawManifest,
    /// Where the manifest goes, a tag or an untagged digest reference
    pub target: Reference,
}

impl PushPlan {
    fn total(&self) -> u64 {
        let base: u64 = self.base_layers.iter().map(|(_, size)| size).sum();
        let blobs: u64 = self.blobs.iter().map(|(_, data)| data.len() as u64).sum();
        base + blobs + self.manifest.bytes.len() as u64
    }
}

/// Write a plan from a background task, forwarding debounced progress.
///
/// The final complete update is always forwarded. An update carrying an
/// error ends the push and the task's own error is returned.
pub async fn push_with_progress(
    registry: Arc<dyn Registry>,
    plan: PushPlan,
    observer: &dyn BuildObserver,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Update>(PROGRESS_CHANNEL_CAPACITY);
    let handle = tokio::spawn(write_plan(registry, plan, tx));

    let debounce = Duration::from_millis(PROGRESS_REPORT_MIN_INTERVAL_MS);
    let mut next_report = Instant::now() + debounce;
    let mut failure: Option<String> = None;

    while let Some(update) = rx.recv().await {
        if let Some(err) = update.error {
            observer.on_event(BuildEvent::Failed {
                component: "push".to_string(),
                message: err.clone(),
            });
            failure = Some(err);
            break;
        }
        if update.complete == update.total {
            observer.on_event(BuildEvent::PushProgress {
                completed: update.complete,
                total: update.total,
            });
        } else if Instant::now() >= next_report {
            next_report = Instant::now() + debounce;
            observer.on_event(BuildEvent::PushProgress {
                completed: update.complete,
                total: update.total,
            });
        }
    }
    drop(rx);

    let outcome = handle
        .await
        .map_err(|e| LayerstackError::registry("push", format!("push task failed: {}", e)))?;
    match (outcome, failure) {
        (Err(e), _) => Err(e),
        (Ok(()), Some(reason)) => Err(LayerstackError::registry("push", reason)),
        (Ok(()), None) => Ok(()),
    }
}

async fn write_plan(
    registry: Arc<dyn Registry>,
    plan: PushPlan,
    tx: mpsc::Sender<Update>,
) -> Result<()> {
    let total = plan.total();
    let mut complete = 0u64;
    let result = write_steps(registry.as_ref(), &plan, &tx, total, &mut complete).await;
    if let Err(ref e) = result {
        let _ = tx
            .send(Update {
                complete,
                total,
                error: Some(e.to_string()),
            })
            .await;
    }
    result
}

async fn write_steps(
    registry: &dyn Registry,
    plan: &PushPlan,
    tx: &mpsc::Sender<Update>,
    total: u64,
    complete: &mut u64,
) -> Result<()> {
    let target = &plan.target;
    if let Some(ref from) = plan.base_repository {
        for (digest, size) in &plan.base_layers {
            copy_blob(registry, from, target, digest).await?;
            *complete += size;
            report(tx, *complete, total).await;
        }
    }
    for (digest, data) in &plan.blobs {
        registry.put_blob(target, digest, data.clone()).await?;
        *complete += data.len() as u64;
        report(tx, *complete, total).await;
    }
    registry.put_manifest(target, &plan.manifest).await?;
    *complete += plan.manifest.bytes.len() as u64;
    report(tx, *complete, total).await;
    Ok(())
}

/// Make a blob available in another repository, mounting when the registry allows
pub async fn copy_blob(
    registry: &dyn Registry,
    from: &Reference,
    to: &Reference,
    digest: &Digest,
) -> Result<()> {
    if registry.blob_exists(to, digest).await? {
        return Ok(());
    }
    if registry.mount_blob(from, to, digest).await? {
        tracing::debug!(digest = %status_hash(digest), from = %from.context(), "mounted blob");
        return Ok(());
    }
    let data = registry.get_blob(from, digest).await?;
    registry.put_blob(to, digest, data).await
}

async fn report(tx: &mpsc::Sender<Update>, complete: u64, total: u64) {
    // a closed receiver means the caller stopped listening, the push itself goes on
    let _ = tx
        .send(Update {
            complete,
            total,
            error: None,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::OCI_MANIFEST;
    use crate::oci::memory::MemoryRegistry;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<BuildEvent>>);

    impl BuildObserver for Recording {
        fn on_event(&self, event: BuildEvent) {
            self.0.lock().push(event);
        }
    }

    fn plan(target: &Reference) -> PushPlan {
        let blob = b"layer bytes".to_vec();
        PushPlan {
            base_layers: Vec::new(),
            base_repository: None,
            blobs: vec![(Digest::sha256(&blob), blob)],
            manifest: RawManifest::new(OCI_MANIFEST, b"{}".to_vec()),
            target: target.clone(),
        }
    }

    #[tokio::test]
    async fn test_final_update_always_reported() {
        let registry = Arc::new(MemoryRegistry::new());
        let target = Reference::parse("example.com/app:1").unwrap();
        let observer = Recording::default();
        push_with_progress(registry.clone(), plan(&target), &observer)
            .await
            .unwrap();

        let events = observer.0.lock();
        // intermediate updates fall inside the debounce window
        assert_eq!(
            *events,
            vec![BuildEvent::PushProgress {
                completed: 13,
                total: 13
            }]
        );
        assert_eq!(registry.pushed_manifests().len(), 1);
    }

    #[tokio::test]
    async fn test_error_update_aborts_with_original_error() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.fail_blob_pushes("denied: requested access to the resource is denied");
        let target = Reference::parse("example.com/app:1").unwrap();
        let observer = Recording::default();
        let err = push_with_progress(registry.clone(), plan(&target), &observer)
            .await
            .unwrap_err();

        assert!(matches!(err, LayerstackError::Registry { .. }));
        assert!(err.to_string().contains("denied"));
        assert!(registry.pushed_manifests().is_empty());
        assert!(matches!(
            observer.0.lock().last(),
            Some(BuildEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_copy_blob_between_repositories() {
        let registry = MemoryRegistry::new();
        let from = Reference::parse("example.com/base:1").unwrap();
        let to = Reference::parse("example.com/app:1").unwrap();
        let digest = registry.seed_blob(&from, b"base layer".to_vec());
        copy_blob(&registry, &from, &to, &digest).await.unwrap();
        assert!(registry.has_blob(&to, &digest));
    }
}
