use crate::error::{DazzleError, Result};
use crate::image::{
    config_blob, digest_hex, digest_of, Descriptor, ImageConfig, ImageManifest, ImageRef,
    StoredImage,
};
use crate::constants::MEDIA_TYPE_MANIFEST;
use crate::repository::{PutOutcome, Repository, TagMode};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Image store on the local filesystem.
///
/// Layout:
/// - `blobs/sha256/<hex>`: content-addressed blobs
/// - `refs/<name>/<tag>`: a file holding the manifest digest
///
/// Every file is written to a temporary sibling and renamed into place, so
/// readers never observe partial writes and concurrent writers of the same
/// content cannot corrupt each other. Filesystem work runs on the blocking
/// pool.
pub struct LocalRepository {
    store: Store,
    resolved: RwLock<HashMap<ImageRef, StoredImage>>,
}

/// The synchronous half of the repository, cheap to move into blocking tasks
#[derive(Debug, Clone)]
struct Store {
    root: PathBuf,
}

fn persist(tmp: NamedTempFile, target: &Path, noclobber: bool) -> io::Result<bool> {
    let result = if noclobber {
        tmp.persist_noclobber(target)
    } else {
        tmp.persist(target)
    };
    match result {
        Ok(_) => Ok(true),
        Err(e) if noclobber && e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

fn write_file(dir: &Path, target: &Path, data: &[u8], noclobber: bool) -> io::Result<bool> {
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    persist(tmp, target, noclobber)
}

async fn blocking<T, F>(operation: &str, subject: impl ToString, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DazzleError::repository(operation, subject, e))?
}

impl Store {
    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = digest_hex(digest)
            .ok_or_else(|| DazzleError::repository("blob", digest, "malformed digest"))?;
        Ok(self.blobs_dir().join(hex))
    }

    fn tag_path(&self, reference: &ImageRef) -> PathBuf {
        let mut path = self.root.join("refs");
        for component in reference.name.split('/') {
            path.push(component);
        }
        path.join(&reference.tag)
    }

    fn store_blob(&self, data: &[u8]) -> Result<String> {
        let digest = digest_of(data);
        let path = self.blob_path(&digest)?;
        if !path.exists() {
            write_file(&self.blobs_dir(), &path, data, false)
                .map_err(|e| DazzleError::repository("put blob", &digest, e))?;
        }
        Ok(digest)
    }

    fn load_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        let data = fs::read(&path).map_err(|e| DazzleError::repository("read blob", digest, e))?;
        let actual = digest_of(&data);
        if actual != digest {
            return Err(DazzleError::repository(
                "read blob",
                digest,
                format!(
                    "integrity failure: got {} (size: {} bytes)",
                    actual,
                    data.len()
                ),
            ));
        }
        Ok(data)
    }

    fn load_image(&self, reference: &ImageRef, manifest_digest: &str) -> Result<StoredImage> {
        let manifest: ImageManifest = serde_json::from_slice(&self.load_blob(manifest_digest)?)
            .map_err(|e| DazzleError::repository("parse manifest", reference, e))?;
        let config: ImageConfig = serde_json::from_slice(&self.load_blob(&manifest.config.digest)?)
            .map_err(|e| DazzleError::repository("parse config", reference, e))?;

        Ok(StoredImage {
            reference: reference.clone(),
            manifest_digest: manifest_digest.to_string(),
            manifest,
            config,
        })
    }

    fn read_tag(&self, reference: &ImageRef) -> Result<Option<String>> {
        match fs::read_to_string(self.tag_path(reference)) {
            Ok(digest) => Ok(Some(digest.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DazzleError::repository("resolve", reference, e)),
        }
    }

    /// Returns false when `noclobber` kept an existing tag
    fn write_tag(&self, reference: &ImageRef, manifest_digest: &str, noclobber: bool) -> Result<bool> {
        let tag_path = self.tag_path(reference);
        let tag_dir = tag_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.join("refs"));
        write_file(&tag_dir, &tag_path, manifest_digest.as_bytes(), noclobber)
            .map_err(|e| DazzleError::repository("tag", reference, e))
    }
}

impl LocalRepository {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs").join("sha256"))
            .and_then(|_| fs::create_dir_all(root.join("refs")))
            .map_err(|e| DazzleError::repository("open", root.display(), e))?;
        Ok(Self {
            store: Store { root },
            resolved: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.store.root
    }

    async fn load_image(&self, reference: &ImageRef, manifest_digest: String) -> Result<StoredImage> {
        if let Some(cached) = self.resolved.read().get(reference) {
            if cached.manifest_digest == manifest_digest {
                return Ok(cached.clone());
            }
        }

        let store = self.store.clone();
        let owned = reference.clone();
        let image = blocking("resolve", reference, move || {
            store.load_image(&owned, &manifest_digest)
        })
        .await?;
        self.resolved.write().insert(reference.clone(), image.clone());
        Ok(image)
    }

    async fn read_tag(&self, reference: &ImageRef) -> Result<Option<String>> {
        let store = self.store.clone();
        let owned = reference.clone();
        blocking("resolve", reference, move || store.read_tag(&owned)).await
    }
}

#[async_trait]
impl Repository for LocalRepository {
    async fn put_blob(&self, media_type: &str, data: &[u8]) -> Result<Descriptor> {
        let store = self.store.clone();
        let owned = data.to_vec();
        let digest = blocking("put blob", media_type, move || store.store_blob(&owned)).await?;
        Ok(Descriptor {
            media_type: media_type.to_string(),
            digest,
            size: data.len() as u64,
        })
    }

    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let store = self.store.clone();
        let owned = digest.to_string();
        blocking("read blob", digest, move || store.load_blob(&owned)).await
    }

    async fn has_blob(&self, digest: &str) -> Result<bool> {
        let path = self.store.blob_path(digest)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| DazzleError::repository("has blob", digest, e))
    }

    async fn resolve(&self, reference: &ImageRef) -> Result<Option<StoredImage>> {
        match self.read_tag(reference).await? {
            Some(digest) => self.load_image(reference, digest).await.map(Some),
            None => Ok(None),
        }
    }

    async fn put_image(
        &self,
        reference: &ImageRef,
        layers: Vec<Descriptor>,
        config: &ImageConfig,
        mode: TagMode,
    ) -> Result<PutOutcome> {
        let (config_data, config_descriptor) = config_blob(config)?;
        let manifest = ImageManifest::new(config_descriptor, layers);
        let manifest_data = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| DazzleError::repository("put image", reference, e))?;
        debug_assert_eq!(manifest.media_type, MEDIA_TYPE_MANIFEST);

        let store = self.store.clone();
        let owned = reference.clone();
        let layer_digests: Vec<String> = manifest.layers.iter().map(|l| l.digest.clone()).collect();
        let (manifest_digest, written) = blocking("put image", reference, move || {
            for digest in &layer_digests {
                if !store.blob_path(digest)?.exists() {
                    return Err(DazzleError::repository(
                        "put image",
                        &owned,
                        format!("layer blob {} is missing", digest),
                    ));
                }
            }
            store.store_blob(&config_data)?;
            let manifest_digest = store.store_blob(&manifest_data)?;
            let written = store.write_tag(&owned, &manifest_digest, mode == TagMode::IfAbsent)?;
            Ok((manifest_digest, written))
        })
        .await?;

        if !written {
            tracing::debug!(reference = %reference, "tag already present, keeping existing image");
            let existing = self
                .read_tag(reference)
                .await?
                .ok_or_else(|| DazzleError::repository("tag", reference, "tag vanished"))?;
            let image = self.load_image(reference, existing).await?;
            return Ok(PutOutcome {
                image,
                written: false,
            });
        }

        let image = StoredImage {
            reference: reference.clone(),
            manifest_digest,
            manifest,
            config: config.clone(),
        };
        self.resolved.write().insert(reference.clone(), image.clone());
        Ok(PutOutcome {
            image,
            written: true,
        })
    }
}
