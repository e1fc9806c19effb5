//! Image references, manifests and configs shared by the repository, the
//! engine, the composer and the test runtime.
//!
//! The manifest and config shapes follow the OCI image spec closely enough
//! that an exported layout can be consumed by standard tooling.

pub mod layer;

use crate::constants::{MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER, MEDIA_TYPE_MANIFEST};
use crate::error::{DazzleError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// `sha256:<hex>` digest of a blob
pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", sha256_bytes(data))
}

/// Hex part of a `sha256:<hex>` digest, rejecting anything else
pub fn digest_hex(digest: &str) -> Option<&str> {
    let hex = digest.strip_prefix("sha256:")?;
    if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        Some(hex)
    } else {
        None
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?::[0-9]+)?(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
            .expect("image name pattern is valid")
    })
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("image tag pattern is valid")
    })
}

/// A `name:tag` image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Result<Self> {
        let reference = Self {
            name: name.into(),
            tag: tag.into(),
        };
        reference.validate()?;
        Ok(reference)
    }

    /// Parses `name[:tag]`; the tag separator is the last `:` after the last `/`
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let slash = input.rfind('/').map(|i| i + 1).unwrap_or(0);
        match input[slash..].rfind(':') {
            Some(colon) => {
                let split = slash + colon;
                Self::new(&input[..split], &input[split + 1..])
            }
            None => Self::new(input, "latest"),
        }
    }

    fn validate(&self) -> Result<()> {
        if !name_pattern().is_match(&self.name) {
            return Err(DazzleError::configuration(
                self.to_string(),
                format!("invalid image name '{}'", self.name),
            ));
        }
        if !tag_pattern().is_match(&self.tag) {
            return Err(DazzleError::configuration(
                self.to_string(),
                format!("invalid image tag '{}'", self.tag),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl FromStr for ImageRef {
    type Err = DazzleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

impl Descriptor {
    pub fn layer(digest: String, size: u64) -> Self {
        Self {
            media_type: MEDIA_TYPE_LAYER.to_string(),
            digest,
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            config,
            layers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    pub manifests: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl RuntimeConfig {
    /// Environment as ordered key/value pairs
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (entry.clone(), String::new()),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub created: String,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub created: String,
    pub architecture: String,
    pub os: String,
    pub config: RuntimeConfig,
    pub rootfs: RootFs,
    pub history: Vec<History>,
}

/// RFC 3339 rendering of the reproducible build epoch
pub fn epoch_timestamp(epoch: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch, 0)
        .unwrap_or_default()
        .to_rfc3339()
}

impl ImageConfig {
    pub fn empty(epoch: i64) -> Self {
        Self {
            created: epoch_timestamp(epoch),
            architecture: host_architecture().to_string(),
            os: "linux".to_string(),
            config: RuntimeConfig::default(),
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: Vec::new(),
            },
            history: Vec::new(),
        }
    }

    /// Merges configs bottom to top: later env keys override earlier ones,
    /// the last cmd/workdir/user wins and labels accumulate.
    pub fn stack<'a>(configs: impl IntoIterator<Item = &'a ImageConfig>, epoch: i64) -> Self {
        let mut merged = Self::empty(epoch);
        let mut env: Vec<(String, String)> = Vec::new();

        for config in configs {
            for (key, value) in config.config.env_pairs() {
                match env.iter_mut().find(|(k, _)| *k == key) {
                    Some(slot) => slot.1 = value,
                    None => env.push((key, value)),
                }
            }
            if config.config.cmd.is_some() {
                merged.config.cmd = config.config.cmd.clone();
            }
            if config.config.working_dir.is_some() {
                merged.config.working_dir = config.config.working_dir.clone();
            }
            if config.config.user.is_some() {
                merged.config.user = config.config.user.clone();
            }
            merged
                .config
                .labels
                .extend(config.config.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            merged
                .rootfs
                .diff_ids
                .extend(config.rootfs.diff_ids.iter().cloned());
            merged.history.extend(config.history.iter().cloned());
        }

        merged.config.env = env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        merged
    }
}

fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// An image as recorded in a repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub reference: ImageRef,
    pub manifest_digest: String,
    pub manifest: ImageManifest,
    pub config: ImageConfig,
}

impl StoredImage {
    /// Compressed size of all layer blobs
    pub fn size(&self) -> u64 {
        self.manifest.layers.iter().map(|l| l.size).sum()
    }
}

/// Serializes a config and returns it with its descriptor
pub fn config_blob(config: &ImageConfig) -> Result<(Vec<u8>, Descriptor)> {
    let data = serde_json::to_vec_pretty(config)
        .map_err(|e| DazzleError::composition("config", e))?;
    let descriptor = Descriptor {
        media_type: MEDIA_TYPE_CONFIG.to_string(),
        digest: digest_of(&data),
        size: data.len() as u64,
    };
    Ok((data, descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_with_registry_port() {
        let r = ImageRef::parse("localhost:5000/work/tools:abc123").unwrap();
        assert_eq!(r.name, "localhost:5000/work/tools");
        assert_eq!(r.tag, "abc123");
    }

    #[test]
    fn test_parse_reference_defaults_to_latest() {
        let r = ImageRef::parse("dazzle-built").unwrap();
        assert_eq!(r.to_string(), "dazzle-built:latest");
    }

    #[test]
    fn test_rejects_path_escapes() {
        assert!(ImageRef::parse("../evil:latest").is_err());
        assert!(ImageRef::parse("work/..:x").is_err());
        assert!(ImageRef::new("work", "../x").is_err());
    }

    #[test]
    fn test_digest_hex() {
        let d = digest_of(b"hello");
        assert!(digest_hex(&d).is_some());
        assert!(digest_hex("md5:abc").is_none());
        assert!(digest_hex("sha256:../../etc").is_none());
    }

    #[test]
    fn test_stack_overrides_env_and_keeps_order() {
        let mut lower = ImageConfig::empty(0);
        lower.config.env = vec!["PATH=/bin".into(), "A=1".into()];
        lower.config.cmd = Some(vec!["sh".into()]);
        lower.rootfs.diff_ids = vec!["sha256:aa".into()];

        let mut upper = ImageConfig::empty(0);
        upper.config.env = vec!["A=2".into(), "B=3".into()];
        upper.config.working_dir = Some("/app".into());
        upper.rootfs.diff_ids = vec!["sha256:bb".into()];

        let merged = ImageConfig::stack([&lower, &upper], 0);
        assert_eq!(merged.config.env, vec!["PATH=/bin", "A=2", "B=3"]);
        assert_eq!(merged.config.cmd, Some(vec!["sh".to_string()]));
        assert_eq!(merged.config.working_dir.as_deref(), Some("/app"));
        assert_eq!(merged.rootfs.diff_ids, vec!["sha256:aa", "sha256:bb"]);
    }

    #[test]
    fn test_epoch_timestamp_is_fixed() {
        assert_eq!(epoch_timestamp(0), "1970-01-01T00:00:00+00:00");
    }
}
