//! Builds (or reuses) one unit's image in the working repository.

use crate::constants::MEDIA_TYPE_LAYER;
use crate::engine::{ImageEngine, LayerBuildRequest, LayerImage, UnitKind};
use crate::error::{DazzleError, Result};
use crate::fingerprint::Fingerprint;
use crate::graph::{BaseSpec, LayerSpec};
use crate::image::{ImageConfig, ImageRef, StoredImage};
use crate::repository::{Repository, TagMode};
use crate::runner::TestResult;
use std::sync::Arc;

/// The root image of a build
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub reference: ImageRef,
    pub image: StoredImage,
    /// Compressed size of all its layers
    pub size: u64,
    pub fingerprint: Fingerprint,
    pub cache_hit: bool,
}

/// A layer image in the working repository. The image holds the layer's
/// own diff and config changes only.
#[derive(Debug, Clone)]
pub struct BuiltLayer {
    pub name: String,
    pub reference: ImageRef,
    pub image: StoredImage,
    /// Compressed size of the layer's diff
    pub size: u64,
    pub fingerprint: Fingerprint,
    pub cache_hit: bool,
    pub test_result: Option<TestResult>,
}

#[derive(Clone)]
pub struct LayerBuilder {
    repo: Arc<dyn Repository>,
    engine: Arc<dyn ImageEngine>,
    epoch: i64,
}

fn check_engine_output(unit: &str, built: &LayerImage) -> Result<()> {
    if built.config.rootfs.diff_ids != [built.blob.diff_id.clone()] {
        return Err(DazzleError::build(
            unit,
            "engine returned a config that does not describe its layer",
        ));
    }
    Ok(())
}

impl LayerBuilder {
    pub fn new(repo: Arc<dyn Repository>, engine: Arc<dyn ImageEngine>, epoch: i64) -> Self {
        Self { repo, engine, epoch }
    }

    async fn lookup(&self, reference: &ImageRef) -> Result<Option<StoredImage>> {
        let found = self.repo.resolve(reference).await?;
        if found.is_some() {
            tracing::debug!(reference = %reference, "cache hit");
        }
        Ok(found)
    }

    pub async fn build_base(
        &self,
        base: &BaseSpec,
        fingerprint: &Fingerprint,
        reference: ImageRef,
    ) -> Result<BaseImage> {
        if let Some(image) = self.lookup(&reference).await? {
            return Ok(BaseImage {
                size: image.size(),
                reference,
                image,
                fingerprint: fingerprint.clone(),
                cache_hit: true,
            });
        }

        let built = self
            .engine
            .build(LayerBuildRequest {
                unit: "base".to_string(),
                kind: UnitKind::Base,
                context: base.context.clone(),
                dockerfile: base.dockerfile.clone(),
                parents: Vec::new(),
                epoch: self.epoch,
            })
            .await?;
        check_engine_output("base", &built)?;

        let descriptor = self.repo.put_blob(MEDIA_TYPE_LAYER, &built.blob.data).await?;
        let (mut layers, config) = match &built.from {
            Some(from) => (
                from.manifest.layers.clone(),
                ImageConfig::stack([&from.config, &built.config], self.epoch),
            ),
            None => (Vec::new(), built.config.clone()),
        };
        layers.push(descriptor);

        let outcome = self
            .repo
            .put_image(&reference, layers, &config, TagMode::IfAbsent)
            .await?;
        Ok(BaseImage {
            size: outcome.image.size(),
            reference,
            image: outcome.image,
            fingerprint: fingerprint.clone(),
            cache_hit: false,
        })
    }

    /// Builds `layer` on top of `parents` (base first, then its transitive
    /// dependencies in composition order) unless `reference` already exists.
    pub async fn build_layer(
        &self,
        layer: &LayerSpec,
        fingerprint: &Fingerprint,
        reference: ImageRef,
        parents: Vec<StoredImage>,
    ) -> Result<BuiltLayer> {
        if let Some(image) = self.lookup(&reference).await? {
            return Ok(BuiltLayer {
                name: layer.name.clone(),
                size: image.size(),
                reference,
                image,
                fingerprint: fingerprint.clone(),
                cache_hit: true,
                test_result: None,
            });
        }

        let built = self
            .engine
            .build(LayerBuildRequest {
                unit: layer.name.clone(),
                kind: UnitKind::Layer,
                context: layer.context.clone(),
                dockerfile: layer.dockerfile.clone(),
                parents,
                epoch: self.epoch,
            })
            .await?;
        check_engine_output(&layer.name, &built)?;

        let descriptor = self.repo.put_blob(MEDIA_TYPE_LAYER, &built.blob.data).await?;
        let outcome = self
            .repo
            .put_image(&reference, vec![descriptor], &built.config, TagMode::IfAbsent)
            .await?;
        if !outcome.written {
            tracing::debug!(layer = %layer.name, "concurrent build already stored this layer");
        }

        Ok(BuiltLayer {
            name: layer.name.clone(),
            size: outcome.image.size(),
            reference,
            image: outcome.image,
            fingerprint: fingerprint.clone(),
            cache_hit: false,
            test_result: None,
        })
    }
}
