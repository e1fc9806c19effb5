use std::io;
/// Structured logging and build progress reporting for dazzle
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::runner::{TestOutcome, TestStatus};
use std::fmt as stdfmt;

/// Initialize structured logging with optional JSON output
pub fn init_logging(json_output: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dazzle=info"));

    let registry = Registry::default().with(env_filter);

    if json_output {
        // JSON output for structured logging aggregation
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(false)
                    .with_thread_ids(false),
            )
            .try_init()?;
    }

    Ok(())
}

/// Orchestrator phases, in the order a successful build passes through them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Resolving,
    Scheduling,
    Building,
    Composing,
    Testing,
    Aggregating,
    Done,
    Failed,
}

impl stdfmt::Display for BuildPhase {
    fn fmt(&self, f: &mut stdfmt::Formatter<'_>) -> stdfmt::Result {
        let name = match self {
            BuildPhase::Resolving => "resolving",
            BuildPhase::Scheduling => "scheduling",
            BuildPhase::Building => "building",
            BuildPhase::Composing => "composing",
            BuildPhase::Testing => "testing",
            BuildPhase::Aggregating => "aggregating",
            BuildPhase::Done => "done",
            BuildPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Progress events emitted by the engine
#[derive(Debug, Clone)]
pub enum BuildEvent {
    PhaseChanged {
        phase: BuildPhase,
    },
    LayerStarted {
        layer: String,
        fingerprint: String,
    },
    LayerBuilt {
        layer: String,
        reference: String,
        size: u64,
        cache_hit: bool,
        duration_ms: u64,
    },
    LayerFailed {
        layer: String,
        error: String,
    },
    LayerSkipped {
        layer: String,
        failed_dependency: String,
    },
    ImageComposed {
        reference: String,
        size: u64,
    },
    TestsStarted {
        layer: String,
        count: usize,
    },
    TestFinished {
        layer: String,
        outcome: TestOutcome,
    },
    Warning {
        message: String,
    },
}

/// Sink for engine progress. Injected through the build environment so the
/// engine itself never writes to global logging state.
pub trait BuildObserver: Send + Sync {
    fn on_event(&self, event: BuildEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl BuildObserver for TracingObserver {
    fn on_event(&self, event: BuildEvent) {
        match event {
            BuildEvent::PhaseChanged { phase } => tracing::debug!(%phase, "phase changed"),
            BuildEvent::LayerStarted { layer, fingerprint } => {
                tracing::info!(layer = %layer, fingerprint = %&fingerprint[..12.min(fingerprint.len())], "building layer")
            }
            BuildEvent::LayerBuilt {
                layer,
                reference,
                size,
                cache_hit,
                duration_ms,
            } => tracing::info!(
                layer = %layer,
                reference = %reference,
                size_bytes = size,
                cache_hit,
                duration_ms,
                "layer ready"
            ),
            BuildEvent::LayerFailed { layer, error } => {
                tracing::error!(layer = %layer, error = %error, "layer failed")
            }
            BuildEvent::LayerSkipped {
                layer,
                failed_dependency,
            } => tracing::warn!(layer = %layer, dependency = %failed_dependency, "layer skipped"),
            BuildEvent::ImageComposed { reference, size } => {
                tracing::info!(reference = %reference, size_bytes = size, "image composed")
            }
            BuildEvent::TestsStarted { layer, count } => {
                tracing::info!(layer = %layer, tests = count, "running tests")
            }
            BuildEvent::TestFinished { layer, outcome } => match outcome.status {
                TestStatus::Passed => {
                    tracing::debug!(layer = %layer, test = %outcome.description, "test passed")
                }
                TestStatus::Failed => tracing::warn!(
                    layer = %layer,
                    test = %outcome.description,
                    detail = %outcome.detail,
                    "test failed"
                ),
                TestStatus::Error => tracing::error!(
                    layer = %layer,
                    test = %outcome.description,
                    detail = %outcome.detail,
                    "test errored"
                ),
            },
            BuildEvent::Warning { message } => tracing::warn!("{}", message),
        }
    }
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BuildObserver for NoopObserver {
    fn on_event(&self, _event: BuildEvent) {}
}

/// Keeps every event; handy for asserting on engine behaviour
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: parking_lot::Mutex<Vec<BuildEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BuildEvent> {
        self.events.lock().clone()
    }

    pub fn phases(&self) -> Vec<BuildPhase> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                BuildEvent::PhaseChanged { phase } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    /// Layers in the order their builds started
    pub fn started_layers(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                BuildEvent::LayerStarted { layer, .. } => Some(layer.clone()),
                _ => None,
            })
            .collect()
    }
}

impl BuildObserver for RecordingObserver {
    fn on_event(&self, event: BuildEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(BuildPhase::Composing.to_string(), "composing");
    }

    #[test]
    fn test_recording_observer_keeps_order() {
        let obs = RecordingObserver::new();
        obs.on_event(BuildEvent::PhaseChanged {
            phase: BuildPhase::Resolving,
        });
        obs.on_event(BuildEvent::LayerStarted {
            layer: "tools".into(),
            fingerprint: "abc".into(),
        });
        obs.on_event(BuildEvent::PhaseChanged {
            phase: BuildPhase::Done,
        });
        assert_eq!(obs.phases(), vec![BuildPhase::Resolving, BuildPhase::Done]);
        assert_eq!(obs.started_layers(), vec!["tools"]);
    }
}
