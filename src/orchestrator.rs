//! Drives a whole build: resolve, build the base, build layers along the
//! DAG, compose, test and aggregate.

use crate::builder::{BaseImage, BuiltLayer, LayerBuilder};
use crate::composer::{self, ComposedImage};
use crate::config::BuildConfig;
use crate::error::{DazzleError, Result};
use crate::fingerprint::{fingerprint_base, fingerprint_layer, Fingerprint};
use crate::engine::dockerfile::{parse_dockerfile, Instruction};
use crate::graph::{self, BaseSpec, LayerGraph};
use crate::image::{ImageRef, StoredImage};
use crate::logging::{BuildEvent, BuildObserver, BuildPhase};
use crate::runner::{self, ContainerSpec, TestResult};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// Terminal state of one declared layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum LayerStatus {
    Built,
    Failed(String),
    /// Carries the name of the failed dependency
    Skipped(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    pub total_layers: usize,
    pub executed_layers: usize,
    pub cache_hits: usize,
    pub failed_layers: usize,
    pub skipped_layers: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub tests_errored: usize,
    pub total_duration_ms: u64,
}

impl BuildStats {
    pub fn cache_hit_rate(&self) -> f64 {
        let available = self.executed_layers + self.cache_hits;
        if available == 0 {
            0.0
        } else {
            self.cache_hits as f64 / available as f64 * 100.0
        }
    }
}

/// Everything one build produced, possibly partial
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub base: BaseImage,
    /// Built layers in declaration order
    pub layers: Vec<BuiltLayer>,
    /// Every declared layer in declaration order
    pub statuses: Vec<(String, LayerStatus)>,
    pub image: Option<ComposedImage>,
    pub stats: BuildStats,
}

impl BuildResult {
    pub fn layer(&self, name: &str) -> Option<&BuiltLayer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn status(&self, name: &str) -> Option<&LayerStatus> {
        self.statuses.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn tests_passed(&self) -> bool {
        self.stats.tests_failed == 0 && self.stats.tests_errored == 0
    }

    /// Every layer built, the image was composed and no test failed
    pub fn is_success(&self) -> bool {
        self.image.is_some()
            && self.statuses.iter().all(|(_, s)| *s == LayerStatus::Built)
            && self.tests_passed()
    }
}

/// A build that did not complete. `result` is present once the base image
/// was built.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct BuildFailure {
    pub result: Option<Box<BuildResult>>,
    #[source]
    pub error: DazzleError,
}

struct Run<'a> {
    config: &'a BuildConfig,
    observer: Arc<dyn BuildObserver>,
    started: Instant,
}

impl Run<'_> {
    fn phase(&self, phase: BuildPhase) {
        self.observer.on_event(BuildEvent::PhaseChanged { phase });
    }

    fn fail(&self, error: DazzleError, result: Option<BuildResult>) -> BuildFailure {
        self.phase(BuildPhase::Failed);
        BuildFailure {
            result: result.map(Box::new),
            error,
        }
    }
}

fn resume_panic(err: JoinError) -> Option<JoinError> {
    if err.is_panic() {
        std::panic::resume_unwind(err.into_panic());
    }
    Some(err)
}

/// Manifest digest of the stored image the base Dockerfile starts `FROM`.
/// Anything the engine would reject resolves to `None` here and fails in the
/// engine instead.
async fn base_from_digest(config: &BuildConfig, base: &BaseSpec) -> Result<Option<String>> {
    let content = match tokio::fs::read_to_string(base.context.join(&base.dockerfile)).await {
        Ok(content) => content,
        Err(_) => return Ok(None),
    };
    let Ok(instructions) = parse_dockerfile(&content) else {
        return Ok(None);
    };
    let image = instructions.iter().find_map(|i| match i {
        Instruction::From(image) => Some(image.as_str()),
        _ => None,
    });
    let reference = match image {
        None | Some("scratch") => return Ok(None),
        Some(image) => match ImageRef::parse(image) {
            Ok(reference) => reference,
            Err(_) => return Ok(None),
        },
    };
    Ok(config
        .env
        .repository
        .resolve(&reference)
        .await?
        .map(|found| found.manifest_digest))
}

async fn base_fingerprint(config: &BuildConfig, graph: &LayerGraph) -> Result<Fingerprint> {
    let base = graph.base.clone();
    let from = base_from_digest(config, &base).await?;
    tokio::task::spawn_blocking(move || fingerprint_base(&base, from.as_deref()))
        .await
        .map_err(|e| DazzleError::build("base", e))?
        .map_err(|e| DazzleError::build("base", format!("build context: {}", e)))
}

/// Builds the image described by `definition_file` in `context_root` and
/// tags the composed result as `tag`.
///
/// Layer failures do not stop independent layers; the returned failure
/// carries whatever was built. Failing tests are reported in the result and
/// do not fail the call.
pub async fn build(
    config: &BuildConfig,
    context_root: &Path,
    definition_file: &str,
    tag: &ImageRef,
) -> std::result::Result<BuildResult, BuildFailure> {
    let run = Run {
        config,
        observer: config.env.observer.clone(),
        started: Instant::now(),
    };

    run.phase(BuildPhase::Resolving);
    let graph = config
        .validate()
        .and_then(|_| graph::resolve(context_root, definition_file))
        .map_err(|e| run.fail(e, None))?;
    tracing::debug!(layers = graph.len(), "build definition resolved");

    run.phase(BuildPhase::Scheduling);
    let builder = LayerBuilder::new(
        config.env.repository.clone(),
        config.env.engine.clone(),
        config.source_date_epoch,
    );

    run.phase(BuildPhase::Building);
    let base = build_base(&run, &graph, &builder)
        .await
        .map_err(|e| run.fail(e, None))?;

    let mut state = build_layers(&run, &graph, &builder, &base).await;

    run.phase(BuildPhase::Composing);
    let mut errors = Vec::new();
    let failed: Vec<String> = graph
        .layers
        .iter()
        .zip(&state.statuses)
        .filter(|(_, s)| matches!(s, LayerStatus::Failed(_)))
        .map(|(l, _)| l.name.clone())
        .collect();
    let all_built = state.statuses.iter().all(|s| *s == LayerStatus::Built);

    let image = if all_built {
        let ordered: Vec<StoredImage> = graph
            .topological_order()
            .iter()
            .filter_map(|&i| state.built[i].as_ref().map(|b| b.image.clone()))
            .collect();
        match composer::compose(
            config.env.repository.as_ref(),
            &base.image,
            &ordered,
            tag,
            config.source_date_epoch,
        )
        .await
        {
            Ok(image) => {
                run.observer.on_event(BuildEvent::ImageComposed {
                    reference: image.reference.to_string(),
                    size: image.size,
                });
                Some(image)
            }
            Err(e) => {
                errors.push(e);
                None
            }
        }
    } else {
        run.observer.on_event(BuildEvent::Warning {
            message: format!("not composing {}: some layers did not build", tag),
        });
        None
    };

    run.phase(BuildPhase::Testing);
    run_tests(&run, &graph, &base, &mut state).await;

    run.phase(BuildPhase::Aggregating);
    let result = aggregate(&run, &graph, base, state, image);

    if !failed.is_empty() {
        errors.insert(0, DazzleError::LayersFailed { failed });
    }
    match errors.into_iter().next() {
        Some(error) => Err(run.fail(error, Some(result))),
        None => {
            run.phase(BuildPhase::Done);
            Ok(result)
        }
    }
}

async fn build_base(run: &Run<'_>, graph: &LayerGraph, builder: &LayerBuilder) -> Result<BaseImage> {
    let outcome = async {
        let fingerprint = base_fingerprint(run.config, graph).await?;
        run.observer.on_event(BuildEvent::LayerStarted {
            layer: "base".to_string(),
            fingerprint: fingerprint.to_string(),
        });
        let reference = run.config.base_ref(&fingerprint)?;
        builder.build_base(&graph.base, &fingerprint, reference).await
    };

    let started = Instant::now();
    match outcome.await {
        Ok(base) => {
            run.observer.on_event(BuildEvent::LayerBuilt {
                layer: "base".to_string(),
                reference: base.reference.to_string(),
                size: base.size,
                cache_hit: base.cache_hit,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            Ok(base)
        }
        Err(e) => {
            run.observer.on_event(BuildEvent::LayerFailed {
                layer: "base".to_string(),
                error: e.to_string(),
            });
            Err(e)
        }
    }
}

struct LayerState {
    built: Vec<Option<BuiltLayer>>,
    statuses: Vec<LayerStatus>,
}

struct LayerTask {
    index: usize,
    outcome: Result<BuiltLayer>,
    duration_ms: u64,
}

async fn build_layers(
    run: &Run<'_>,
    graph: &LayerGraph,
    builder: &LayerBuilder,
    base: &BaseImage,
) -> LayerState {
    let n = graph.len();
    let mut built: Vec<Option<BuiltLayer>> = vec![None; n];
    let mut statuses: Vec<Option<LayerStatus>> = vec![None; n];
    let mut in_degree: Vec<usize> = (0..n).map(|i| graph.deps(i).len()).collect();
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();

    let permits = Arc::new(Semaphore::new(run.config.max_parallel_builds.max(1)));
    let mut tasks: JoinSet<LayerTask> = JoinSet::new();

    loop {
        // ascending index is declaration order
        while let Some(index) = ready.pop_first() {
            let layer = graph.layers[index].clone();

            let mut dep_fingerprints = vec![base.fingerprint.clone()];
            dep_fingerprints.extend(graph.deps(index).iter().filter_map(|&d| {
                built[d].as_ref().map(|b| b.fingerprint.clone())
            }));

            let mut parents = vec![base.image.clone()];
            parents.extend(
                graph
                    .transitive_deps(index)
                    .into_iter()
                    .filter_map(|d| built[d].as_ref().map(|b| b.image.clone())),
            );

            let builder = builder.clone();
            let permits = permits.clone();
            let observer = run.observer.clone();
            let config = run.config.clone();

            tasks.spawn(async move {
                let started = Instant::now();
                let outcome = async {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| DazzleError::build(&layer.name, e))?;

                    let spec = layer.clone();
                    let fingerprint = tokio::task::spawn_blocking(move || {
                        fingerprint_layer(&spec, &dep_fingerprints)
                    })
                    .await
                    .map_err(|e| DazzleError::build(&layer.name, e))?
                    .map_err(|e| DazzleError::build(&layer.name, format!("build context: {}", e)))?;

                    observer.on_event(BuildEvent::LayerStarted {
                        layer: layer.name.clone(),
                        fingerprint: fingerprint.to_string(),
                    });
                    let reference = config.layer_ref(&layer.name, &fingerprint)?;
                    builder.build_layer(&layer, &fingerprint, reference, parents).await
                }
                .await;

                LayerTask {
                    index,
                    outcome,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            });
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let task = match joined {
            Ok(task) => task,
            Err(e) => {
                if let Some(e) = resume_panic(e) {
                    tracing::warn!(error = %e, "layer build task cancelled");
                }
                continue;
            }
        };

        let index = task.index;
        let name = graph.layers[index].name.clone();
        match task.outcome {
            Ok(layer) => {
                run.observer.on_event(BuildEvent::LayerBuilt {
                    layer: name,
                    reference: layer.reference.to_string(),
                    size: layer.size,
                    cache_hit: layer.cache_hit,
                    duration_ms: task.duration_ms,
                });
                built[index] = Some(layer);
                statuses[index] = Some(LayerStatus::Built);
                for &d in graph.dependents(index) {
                    in_degree[d] -= 1;
                    if in_degree[d] == 0 && statuses[d].is_none() {
                        ready.insert(d);
                    }
                }
            }
            Err(e) => {
                run.observer.on_event(BuildEvent::LayerFailed {
                    layer: name.clone(),
                    error: e.to_string(),
                });
                statuses[index] = Some(LayerStatus::Failed(e.to_string()));
                for d in graph.transitive_dependents(index) {
                    if statuses[d].is_none() {
                        run.observer.on_event(BuildEvent::LayerSkipped {
                            layer: graph.layers[d].name.clone(),
                            failed_dependency: name.clone(),
                        });
                        statuses[d] = Some(LayerStatus::Skipped(name.clone()));
                    }
                }
            }
        }
    }

    LayerState {
        built,
        statuses: statuses
            .into_iter()
            .map(|s| s.unwrap_or_else(|| LayerStatus::Failed("build task was cancelled".to_string())))
            .collect(),
    }
}

/// Base, the layer's transitive dependencies and the layer itself
fn test_stack(graph: &LayerGraph, base: &BaseImage, built: &[Option<BuiltLayer>], index: usize) -> Vec<StoredImage> {
    let mut images = vec![base.image.clone()];
    images.extend(
        graph
            .transitive_deps(index)
            .into_iter()
            .filter_map(|d| built[d].as_ref().map(|b| b.image.clone())),
    );
    if let Some(layer) = &built[index] {
        images.push(layer.image.clone());
    }
    images
}

async fn run_tests(run: &Run<'_>, graph: &LayerGraph, base: &BaseImage, state: &mut LayerState) {
    let permits = Arc::new(Semaphore::new(run.config.max_parallel_tests.max(1)));
    let mut tasks: JoinSet<(usize, TestResult)> = JoinSet::new();

    for (index, spec) in graph.layers.iter().enumerate() {
        let Some(layer) = &state.built[index] else {
            continue;
        };
        if spec.tests.is_empty() {
            continue;
        }

        let images = test_stack(graph, base, &state.built, index);
        let (_, config) = composer::stack_images(&images, run.config.source_date_epoch);
        let container = ContainerSpec {
            name: layer.reference.to_string(),
            images,
            config,
        };
        let tests = spec.tests.clone();
        let name = spec.name.clone();
        let runtime = run.config.env.runtime.clone();
        let observer = run.observer.clone();
        let permits = permits.clone();
        let timeout = run.config.test_timeout;

        tasks.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => {
                    runner::run_layer_tests(runtime, &name, &container, &tests, timeout, observer.as_ref())
                        .await
                }
                Err(e) => TestResult {
                    outcomes: tests
                        .iter()
                        .map(|t| runner::TestOutcome::error(&t.description, &e))
                        .collect(),
                },
            };
            (index, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => {
                if let Some(layer) = state.built[index].as_mut() {
                    layer.test_result = Some(result);
                }
            }
            Err(e) => {
                if let Some(e) = resume_panic(e) {
                    tracing::warn!(error = %e, "test task cancelled");
                }
            }
        }
    }
}

fn aggregate(
    run: &Run<'_>,
    graph: &LayerGraph,
    base: BaseImage,
    state: LayerState,
    image: Option<ComposedImage>,
) -> BuildResult {
    let layers: Vec<BuiltLayer> = state.built.into_iter().flatten().collect();
    let statuses: Vec<(String, LayerStatus)> = graph
        .layers
        .iter()
        .map(|l| l.name.clone())
        .zip(state.statuses)
        .collect();

    let mut stats = BuildStats {
        total_layers: graph.len(),
        ..Default::default()
    };
    for layer in &layers {
        if layer.cache_hit {
            stats.cache_hits += 1;
        } else {
            stats.executed_layers += 1;
        }
        if let Some(result) = &layer.test_result {
            stats.tests_passed += result.passed();
            stats.tests_failed += result.failed();
            stats.tests_errored += result.errored();
        }
    }
    for (_, status) in &statuses {
        match status {
            LayerStatus::Failed(_) => stats.failed_layers += 1,
            LayerStatus::Skipped(_) => stats.skipped_layers += 1,
            LayerStatus::Built => {}
        }
    }
    stats.total_duration_ms = run.started.elapsed().as_millis() as u64;

    BuildResult {
        base,
        layers,
        statuses,
        image,
        stats,
    }
}
