//! End-to-end build: layers first, then either a single append or a
//! multi-platform index assembly, depending on what the base resolves to.

use crate::annotate::BaseAnnotations;
use crate::append::Appender;
use crate::config::BuildConfig;
use crate::error::{LayerstackError, Result};
use crate::layer::{Layer, LayerBuilder};
use crate::logging::{BuildEvent, BuildObserver};
use crate::multiarch::{IndexAssembler, LayerAppend};
use crate::oci::platform::PlatformMatcher;
use crate::oci::reference::Reference;
use crate::oci::registry::Registry;
use crate::pushed::Artifact;
use std::sync::Arc;

/// Validate the config, build its layers, append them and push
pub async fn run(
    config: &BuildConfig,
    registry: Arc<dyn Registry>,
    observer: Arc<dyn BuildObserver>,
) -> Result<Artifact> {
    config.validate()?;
    let layers = run_layers(config, observer.clone())?;
    run_append(config, layers, registry, observer).await
}

/// Build every configured layer in order. No registry access happens here.
pub fn run_layers(config: &BuildConfig, observer: Arc<dyn BuildObserver>) -> Result<Vec<Layer>> {
    let builder = LayerBuilder::new(observer);
    config
        .layers
        .iter()
        .map(|layer| builder.from_config(layer))
        .collect()
}

/// Append prebuilt layers to the configured base and push to the configured tag
pub async fn run_append(
    config: &BuildConfig,
    layers: Vec<Layer>,
    registry: Arc<dyn Registry>,
    observer: Arc<dyn BuildObserver>,
) -> Result<Artifact> {
    let tag = Reference::parse(&config.tag)?;
    let matcher = PlatformMatcher::new(&config.platforms)?;
    let envs = config.env_pairs();

    if config.base.trim().is_empty() {
        warn_platforms_ignored(config, observer.as_ref());
        let appender = Appender::new(None, tag.clone(), registry, observer).with_envs(envs);
        return append_single(appender, &tag, &layers, "").await;
    }

    let base = Reference::parse(&config.base)?;
    let annotations = BaseAnnotations::new(Some(&base));
    let raw = registry.get_manifest(&base).await?;
    let kind = raw.kind();

    if kind.is_index() {
        if base.digest().is_none() {
            return Err(LayerstackError::InvalidReference {
                reference: config.base.clone(),
                reason: "base is an index, so it must be pinned by digest".to_string(),
            });
        }
        let assembler =
            IndexAssembler::select(&base, raw, &matcher, registry.as_ref(), observer.clone()).await?;
        tracing::info!(
            base = %base,
            selected = assembler.to_append().len(),
            "composing index"
        );
        let each = LayerAppend::new(registry.clone(), observer, layers, envs, annotations);
        let assembled = assembler
            .push_with_append(&each, &tag, registry.as_ref(), &config.base)
            .await?;
        return Ok(assembled.artifact);
    }

    warn_platforms_ignored(config, observer.as_ref());
    let appender = Appender::new(Some(base), tag.clone(), registry, observer)
        .with_envs(envs)
        .with_annotations(annotations);
    append_single(appender, &tag, &layers, &config.base).await
}

async fn append_single(
    mut appender: Appender,
    tag: &Reference,
    layers: &[Layer],
    base_ref: &str,
) -> Result<Artifact> {
    let media_type = appender.resolve_base().await?.media_type().to_string();
    let result = appender.append(layers).await?;
    Ok(Artifact::single_image(
        tag,
        result.hash,
        &media_type,
        result.pushed.descriptor.platform,
        result.config_digest,
        base_ref,
    ))
}

fn warn_platforms_ignored(config: &BuildConfig, observer: &dyn BuildObserver) {
    if config.platforms.len() > 1 {
        observer.on_event(BuildEvent::Warning {
            message: format!(
                "{} platforms configured but the base is a single image, ignoring the platform restriction",
                config.platforms.len()
            ),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayerConfig, LocalFileConfig};
    use crate::logging::NoopObserver;
    use crate::oci::memory::MemoryRegistry;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<BuildEvent>>);

    impl BuildObserver for Recording {
        fn on_event(&self, event: BuildEvent) {
            self.0.lock().push(event);
        }
    }

    #[tokio::test]
    async fn test_empty_base_single_image() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hello.txt");
        std::fs::write(&file, b"hello").unwrap();
        let config = BuildConfig {
            tag: "example.com/app:dev".to_string(),
            layers: vec![LayerConfig {
                local_file: Some(LocalFileConfig {
                    path: file.display().to_string(),
                    container_path: "/etc/hello.txt".to_string(),
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let registry = Arc::new(MemoryRegistry::new());
        let artifact = run(&config, registry.clone(), Arc::new(NoopObserver))
            .await
            .unwrap();
        assert_eq!(artifact.media_type, crate::constants::OCI_MANIFEST);
        assert!(artifact.base_ref.is_empty());
        assert!(artifact.tag_ref.starts_with("example.com/app:dev@sha256:"));
        let pushed = registry.pushed_manifests();
        assert_eq!(pushed.len(), 1);
        assert_eq!(Some(&pushed[0].1.digest), artifact.hash());
    }

    #[tokio::test]
    async fn test_many_platforms_on_single_image_warns() {
        let config = BuildConfig {
            tag: "example.com/app:dev".to_string(),
            platforms: vec!["linux/amd64".to_string(), "linux/arm64".to_string()],
            ..Default::default()
        };
        let observer = Arc::new(Recording::default());
        run(&config, Arc::new(MemoryRegistry::new()), observer.clone())
            .await
            .unwrap();
        assert!(observer
            .0
            .lock()
            .iter()
            .any(|e| matches!(e, BuildEvent::Warning { .. })));
    }
}
