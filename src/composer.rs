//! Image composition: the base image plus every layer's diff, in
//! composition order, under one tag.

use crate::error::{DazzleError, Result};
use crate::image::{Descriptor, ImageConfig, ImageIndex, ImageRef, IndexEntry, StoredImage};
use crate::constants::MEDIA_TYPE_MANIFEST;
use crate::repository::{Repository, TagMode};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const OCI_LAYOUT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// The final image written by a successful build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedImage {
    pub reference: ImageRef,
    pub manifest_digest: String,
    /// Compressed size of all layers
    pub size: u64,
    pub layers: usize,
}

/// Layer descriptors and merged config of `images` stacked bottom to top
pub fn stack_images(images: &[StoredImage], epoch: i64) -> (Vec<Descriptor>, ImageConfig) {
    let layers = images
        .iter()
        .flat_map(|image| image.manifest.layers.iter().cloned())
        .collect();
    let config = ImageConfig::stack(images.iter().map(|image| &image.config), epoch);
    (layers, config)
}

/// Composes `base` and `layers` (in composition order) into `target`.
///
/// Every layer blob is re-read and checked against its digest before the
/// tag is written, and the tag is the last thing written.
pub async fn compose(
    repo: &dyn Repository,
    base: &StoredImage,
    layers: &[StoredImage],
    target: &ImageRef,
    epoch: i64,
) -> Result<ComposedImage> {
    let mut images = Vec::with_capacity(layers.len() + 1);
    images.push(base.clone());
    images.extend(layers.iter().cloned());
    let (descriptors, config) = stack_images(&images, epoch);

    if config.rootfs.diff_ids.len() != descriptors.len() {
        return Err(DazzleError::composition(
            target,
            format!(
                "{} layers but {} diff ids",
                descriptors.len(),
                config.rootfs.diff_ids.len()
            ),
        ));
    }
    for descriptor in &descriptors {
        let data = repo
            .read_blob(&descriptor.digest)
            .await
            .map_err(|e| DazzleError::composition(target, e))?;
        if data.len() as u64 != descriptor.size {
            return Err(DazzleError::composition(
                target,
                format!(
                    "blob {} is {} bytes, manifest says {}",
                    descriptor.digest,
                    data.len(),
                    descriptor.size
                ),
            ));
        }
    }

    let layer_count = descriptors.len();
    let outcome = repo
        .put_image(target, descriptors, &config, TagMode::Overwrite)
        .await
        .map_err(|e| DazzleError::composition(target, e))?;

    tracing::debug!(reference = %target, layers = layer_count, "image composed");
    Ok(ComposedImage {
        reference: target.clone(),
        manifest_digest: outcome.image.manifest_digest.clone(),
        size: outcome.image.size(),
        layers: layer_count,
    })
}

/// Writes `image` as an OCI image layout directory at `dir`
pub async fn export_layout(repo: &dyn Repository, image: &StoredImage, dir: &Path) -> Result<PathBuf> {
    let blobs_dir = dir.join("blobs").join("sha256");
    fs::create_dir_all(&blobs_dir)?;

    let mut digests = vec![image.manifest_digest.clone(), image.manifest.config.digest.clone()];
    digests.extend(image.manifest.layers.iter().map(|l| l.digest.clone()));

    let mut manifest_size = 0;
    for digest in &digests {
        let data = repo.read_blob(digest).await?;
        if *digest == image.manifest_digest {
            manifest_size = data.len() as u64;
        }
        let hex = crate::image::digest_hex(digest)
            .ok_or_else(|| DazzleError::composition(&image.reference, "malformed digest"))?;
        fs::write(blobs_dir.join(hex), data)?;
    }

    let mut annotations = BTreeMap::new();
    annotations.insert(REF_NAME_ANNOTATION.to_string(), image.reference.tag.clone());
    let index = ImageIndex {
        schema_version: 2,
        manifests: vec![IndexEntry {
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            digest: image.manifest_digest.clone(),
            size: manifest_size,
            annotations,
        }],
    };
    let index_json = serde_json::to_vec_pretty(&index)
        .map_err(|e| DazzleError::composition(&image.reference, e))?;
    fs::write(dir.join("index.json"), index_json)?;
    fs::write(dir.join("oci-layout"), OCI_LAYOUT)?;

    tracing::info!(reference = %image.reference, path = %dir.display(), "OCI layout written");
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MEDIA_TYPE_LAYER;
    use crate::repository::LocalRepository;
    use tempfile::TempDir;

    async fn single_layer_image(repo: &LocalRepository, name: &str, content: &[u8], env: &str) -> StoredImage {
        let blob = repo.put_blob(MEDIA_TYPE_LAYER, content).await.unwrap();
        let mut config = ImageConfig::empty(0);
        config.config.env = vec![env.to_string()];
        config.rootfs.diff_ids = vec![crate::image::digest_of(content)];
        repo.put_image(&ImageRef::parse(name).unwrap(), vec![blob], &config, TagMode::IfAbsent)
            .await
            .unwrap()
            .image
    }

    #[tokio::test]
    async fn test_compose_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::open(dir.path()).unwrap();
        let base = single_layer_image(&repo, "w:base-1", b"base", "A=base").await;
        let tools = single_layer_image(&repo, "w/tools:1", b"tools", "A=tools").await;
        let target = ImageRef::parse("final:latest").unwrap();

        let one = compose(&repo, &base, &[tools.clone()], &target, 42).await.unwrap();
        let two = compose(&repo, &base, &[tools], &target, 42).await.unwrap();
        assert_eq!(one, two);
        assert_eq!(one.layers, 2);

        let stored = repo.resolve(&target).await.unwrap().unwrap();
        assert_eq!(stored.config.config.env, vec!["A=tools"]);
        assert_eq!(stored.manifest.layers[0].digest, base.manifest.layers[0].digest);
    }

    #[tokio::test]
    async fn test_corrupt_layer_leaves_no_tag() {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::open(dir.path()).unwrap();
        let base = single_layer_image(&repo, "w:base-1", b"base", "A=1").await;
        let tools = single_layer_image(&repo, "w/tools:1", b"tools", "B=1").await;
        let hex = crate::image::digest_hex(&tools.manifest.layers[0].digest).unwrap().to_string();
        fs::write(dir.path().join("blobs/sha256").join(hex), b"garbage").unwrap();

        let target = ImageRef::parse("final:latest").unwrap();
        let err = compose(&repo, &base, &[tools], &target, 0).await.unwrap_err();
        assert!(matches!(err, DazzleError::Composition { .. }));
        assert!(repo.resolve(&target).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_export_layout() {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::open(dir.path().join("store")).unwrap();
        let base = single_layer_image(&repo, "w:base-1", b"base", "A=1").await;

        let out = dir.path().join("layout");
        export_layout(&repo, &base, &out).await.unwrap();
        assert!(out.join("oci-layout").exists());
        let index: ImageIndex =
            serde_json::from_slice(&fs::read(out.join("index.json")).unwrap()).unwrap();
        assert_eq!(index.manifests[0].digest, base.manifest_digest);
        assert_eq!(fs::read_dir(out.join("blobs/sha256")).unwrap().count(), 3);
    }
}
