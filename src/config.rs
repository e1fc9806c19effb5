//! Run configuration and the injected capabilities a build works against.

use crate::constants::{
    BASE_TAG_PREFIX, DEFAULT_MAX_PARALLEL_BUILDS, DEFAULT_MAX_PARALLEL_TESTS, DEFAULT_REPOSITORY,
    DEFAULT_STORE_DIR, DEFAULT_TEST_TIMEOUT_SECS,
};
use crate::engine::{ImageEngine, LocalEngine};
use crate::error::{DazzleError, Result};
use crate::fingerprint::Fingerprint;
use crate::image::ImageRef;
use crate::logging::{BuildObserver, TracingObserver};
use crate::repository::{LocalRepository, Repository};
use crate::runner::{ContainerRuntime, LocalRuntime};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Capabilities a build runs against
#[derive(Clone)]
pub struct Environment {
    pub repository: Arc<dyn Repository>,
    pub engine: Arc<dyn ImageEngine>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub observer: Arc<dyn BuildObserver>,
}

impl Environment {
    pub fn new(
        repository: Arc<dyn Repository>,
        engine: Arc<dyn ImageEngine>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            repository,
            engine,
            runtime,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Local store, engine and runtime sharing one image store at `store_root`
    pub fn local(store_root: impl Into<PathBuf>) -> Result<Self> {
        let repository: Arc<dyn Repository> = Arc::new(LocalRepository::open(store_root)?);
        Ok(Self::new(
            repository.clone(),
            Arc::new(LocalEngine::new(repository.clone())),
            Arc::new(LocalRuntime::new(repository)),
        ))
    }

    pub fn with_engine(mut self, engine: Arc<dyn ImageEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BuildObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// Immutable settings for one build call
#[derive(Clone)]
pub struct BuildConfig {
    pub env: Environment,
    /// Working repository name layer images are tagged under
    pub repository: String,
    pub max_parallel_builds: usize,
    pub max_parallel_tests: usize,
    pub test_timeout: Duration,
    /// Timestamp written into image configs and history
    pub source_date_epoch: i64,
}

fn env_override<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| DazzleError::configuration(name, e)),
        _ => Ok(None),
    }
}

impl BuildConfig {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            repository: DEFAULT_REPOSITORY.to_string(),
            max_parallel_builds: DEFAULT_MAX_PARALLEL_BUILDS,
            max_parallel_tests: DEFAULT_MAX_PARALLEL_TESTS,
            test_timeout: Duration::from_secs(DEFAULT_TEST_TIMEOUT_SECS),
            source_date_epoch: 0,
        }
    }

    /// Defaults overridden by `DAZZLE_REPOSITORY`, `DAZZLE_JOBS`,
    /// `DAZZLE_TEST_TIMEOUT_SECS` and `SOURCE_DATE_EPOCH`
    pub fn from_env(env: Environment) -> Result<Self> {
        let mut config = Self::new(env);
        if let Some(repository) = env_override::<String>("DAZZLE_REPOSITORY")? {
            config.repository = repository;
        }
        if let Some(jobs) = env_override::<usize>("DAZZLE_JOBS")? {
            config.max_parallel_builds = jobs;
            config.max_parallel_tests = jobs;
        }
        if let Some(secs) = env_override::<u64>("DAZZLE_TEST_TIMEOUT_SECS")? {
            config.test_timeout = Duration::from_secs(secs);
        }
        if let Some(epoch) = env_override::<i64>("SOURCE_DATE_EPOCH")? {
            config.source_date_epoch = epoch;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_parallelism(mut self, builds: usize, tests: usize) -> Self {
        self.max_parallel_builds = builds;
        self.max_parallel_tests = tests;
        self
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    pub fn with_source_date_epoch(mut self, epoch: i64) -> Self {
        self.source_date_epoch = epoch;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_builds == 0 || self.max_parallel_tests == 0 {
            return Err(DazzleError::configuration(
                "parallelism",
                "build and test parallelism must be at least 1",
            ));
        }
        ImageRef::new(self.repository.as_str(), "latest").map(|_| ())
    }

    /// `{repository}/{layer}:{fingerprint}`
    pub fn layer_ref(&self, layer: &str, fingerprint: &Fingerprint) -> Result<ImageRef> {
        ImageRef::new(format!("{}/{}", self.repository, layer), fingerprint.as_str())
    }

    /// `{repository}:base-{fingerprint}`
    pub fn base_ref(&self, fingerprint: &Fingerprint) -> Result<ImageRef> {
        ImageRef::new(
            self.repository.as_str(),
            format!("{}{}", BASE_TAG_PREFIX, fingerprint),
        )
    }
}

/// `DAZZLE_STORE`, else `~/.dazzle/store`, else `.dazzle/store`
pub fn default_store_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DAZZLE_STORE") {
        return PathBuf::from(dir);
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(DEFAULT_STORE_DIR),
        Err(_) => PathBuf::from(DEFAULT_STORE_DIR),
    }
}
