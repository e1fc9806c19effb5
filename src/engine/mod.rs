//! Image engine capability: turns one build context into one layer.

pub mod dockerfile;
pub mod local;

pub use local::LocalEngine;

use crate::error::Result;
use crate::image::layer::LayerBlob;
use crate::image::{ImageConfig, StoredImage};
use async_trait::async_trait;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// The root image; its `FROM` is honoured
    Base,
    /// A layer; its `FROM` is replaced by the parent stack
    Layer,
}

#[derive(Debug, Clone)]
pub struct LayerBuildRequest {
    /// Layer name, or `base`
    pub unit: String,
    pub kind: UnitKind,
    pub context: PathBuf,
    pub dockerfile: String,
    /// Images the layer is built on, bottom first
    pub parents: Vec<StoredImage>,
    /// Reproducible timestamp for history entries
    pub epoch: i64,
}

/// The outcome of one engine build: a single diff layer and the config
/// changes it makes. `config.rootfs` holds exactly the diff id of `blob`.
#[derive(Debug, Clone)]
pub struct LayerImage {
    /// Image named by a base `FROM`, when it is not `scratch`
    pub from: Option<StoredImage>,
    pub blob: LayerBlob,
    pub config: ImageConfig,
}

#[async_trait]
pub trait ImageEngine: Send + Sync {
    async fn build(&self, request: LayerBuildRequest) -> Result<LayerImage>;
}
