//! The working repository: a content-addressed image store shared by every
//! concurrent layer build.

pub mod local;

pub use local::LocalRepository;

use crate::error::Result;
use crate::image::{Descriptor, ImageConfig, ImageRef, StoredImage};
use async_trait::async_trait;

/// How `put_image` treats an existing tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMode {
    /// Keep the existing tag; the new image is discarded (detect and skip)
    IfAbsent,
    /// Point the tag at the new image (last writer wins)
    Overwrite,
}

#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub image: StoredImage,
    /// False when an existing tag was kept
    pub written: bool,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Stores a blob under its digest; storing the same bytes twice is a no-op
    async fn put_blob(&self, media_type: &str, data: &[u8]) -> Result<Descriptor>;

    /// Reads a blob and verifies it against its digest
    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>>;

    async fn has_blob(&self, digest: &str) -> Result<bool>;

    /// Looks a tag up; `None` when the tag does not exist
    async fn resolve(&self, reference: &ImageRef) -> Result<Option<StoredImage>>;

    /// Writes config and manifest blobs for `layers`, then tags the manifest.
    /// Every layer blob must already be stored.
    async fn put_image(
        &self,
        reference: &ImageRef,
        layers: Vec<Descriptor>,
        config: &ImageConfig,
        mode: TagMode,
    ) -> Result<PutOutcome>;
}
