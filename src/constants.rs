// Centralized constants for dazzle to avoid magic numbers

/// Default build definition file name, relative to the context root
pub const DEFAULT_DEFINITION_FILE: &str = "dazzle.yaml";

/// Default Dockerfile name inside a layer or base context
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Default working repository layer images are staged in
pub const DEFAULT_REPOSITORY: &str = "dazzle-work";

/// Default tag of the composed image
pub const DEFAULT_FINAL_TAG: &str = "dazzle-built:latest";

/// Directory under the user's home holding the local image store
pub const DEFAULT_STORE_DIR: &str = ".dazzle/store";

/// Context directory of the base image when the definition omits it
pub const DEFAULT_BASE_CONTEXT: &str = "base";

/// Name of the base image unit; layers may list it as a dependency
pub const BASE_UNIT: &str = "base";

/// Parent directory of layer contexts when a layer omits its context
pub const DEFAULT_LAYERS_DIR: &str = "layers";

/// Tag prefix of base images in the working repository
pub const BASE_TAG_PREFIX: &str = "base-";

/// Default number of layer builds running at once
pub const DEFAULT_MAX_PARALLEL_BUILDS: usize = 4;

/// Default number of layers whose tests run at once
pub const DEFAULT_MAX_PARALLEL_TESTS: usize = 4;

/// Default timeout for a single test command in seconds
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 300;

/// Bumped whenever the fingerprint input layout changes
pub const FINGERPRINT_VERSION: &str = "dazzle-fingerprint-v1";

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
