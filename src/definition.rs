//! The `dazzle.yaml` build definition.
//!
//! ```yaml
//! base:
//!   context: base
//! layers:
//!   - name: tools
//!     depends: [langs]
//!     tests:
//!       - desc: "it has make"
//!         command: ["make", "--version"]
//!         assert:
//!           - status == 0
//!           - stdout contains "GNU Make"
//! ```

use crate::error::{DazzleError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildDefinition {
    #[serde(default)]
    pub base: BaseDefinition,
    #[serde(default)]
    pub layers: Vec<LayerDefinition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseDefinition {
    pub context: Option<String>,
    pub dockerfile: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerDefinition {
    pub name: String,
    pub context: Option<String>,
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub tests: Vec<TestDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestDefinition {
    pub desc: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub assert: Vec<String>,
    /// May run concurrently with neighbouring independent tests
    #[serde(default)]
    pub independent: bool,
}

impl BuildDefinition {
    pub fn parse(content: &str, origin: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| DazzleError::configuration(origin, e))
    }

    /// Reads `definition_file` relative to the context root
    pub fn load(context_root: &Path, definition_file: &str) -> Result<Self> {
        let path = context_root.join(definition_file);
        let content = fs::read_to_string(&path).map_err(|e| {
            DazzleError::configuration(path.display().to_string(), format!("cannot read: {}", e))
        })?;
        Self::parse(&content, &path.display().to_string())
    }
}
