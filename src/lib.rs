pub mod builder;
pub mod composer;
pub mod config;
pub mod constants;
pub mod definition;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod hasher;
pub mod image;
pub mod logging;
pub mod orchestrator;
pub mod report;
pub mod repository;
pub mod rootfs;
pub mod runner;

pub use config::{BuildConfig, Environment};
pub use error::{DazzleError, Result};
pub use orchestrator::{build, BuildFailure, BuildResult, LayerStatus};
