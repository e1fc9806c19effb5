//! Layer acceptance tests: one ephemeral container per layer, one exec per
//! declared test.

pub mod assert;
pub mod local;

pub use local::LocalRuntime;

use crate::error::Result;
use crate::graph::TestSpec;
use crate::image::{ImageConfig, StoredImage};
use crate::logging::{BuildEvent, BuildObserver};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What to run a container from: a stack of images and their merged config
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Display name, usually the layer's image reference
    pub name: String,
    /// Bottom first
    pub images: Vec<StoredImage>,
    pub config: ImageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;
    async fn exec(&self, container: &ContainerHandle, request: &ExecRequest) -> Result<ExecResult>;
    /// Stopping an unknown or already stopped container is not an error
    async fn stop(&self, container: &ContainerHandle) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    /// The test could not be run at all
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub description: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    pub duration_ms: u64,
}

impl TestOutcome {
    pub fn error(description: impl Into<String>, detail: impl ToString) -> Self {
        Self {
            description: description.into(),
            status: TestStatus::Error,
            detail: detail.to_string(),
            duration_ms: 0,
        }
    }
}

/// Outcomes of one layer's tests, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub outcomes: Vec<TestOutcome>,
}

impl TestResult {
    fn count(&self, status: TestStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn passed(&self) -> usize {
        self.count(TestStatus::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(TestStatus::Failed)
    }

    pub fn errored(&self) -> usize {
        self.count(TestStatus::Error)
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status == TestStatus::Passed)
    }
}

/// Stops its container when dropped without an explicit `stop`, so a
/// cancelled or panicking test run does not leak containers.
pub struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    handle: Option<ContainerHandle>,
}

impl ContainerGuard {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, handle: ContainerHandle) -> Self {
        Self {
            runtime,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&ContainerHandle> {
        self.handle.as_ref()
    }

    pub async fn stop(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.runtime.stop(&handle).await,
            None => Ok(()),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = runtime.stop(&handle).await {
                        tracing::warn!(container = %handle.id, error = %e, "failed to stop container");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(container = %handle.id, "no runtime left to stop container");
            }
        }
    }
}

fn clip(text: &str) -> String {
    const LIMIT: usize = 512;
    let trimmed = text.trim_end();
    if trimmed.len() <= LIMIT {
        return trimmed.to_string();
    }
    let mut cut = trimmed.len() - LIMIT;
    while !trimmed.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...{}", &trimmed[cut..])
}

async fn run_test(
    runtime: &dyn ContainerRuntime,
    container: &ContainerHandle,
    test: &TestSpec,
    timeout: Duration,
) -> TestOutcome {
    let started = Instant::now();
    let request = ExecRequest {
        command: test.command.clone(),
        env: test.env.clone(),
    };

    let (status, detail) = match tokio::time::timeout(timeout, runtime.exec(container, &request)).await {
        Err(_) => (
            TestStatus::Error,
            format!("timed out after {}s", timeout.as_secs()),
        ),
        Ok(Err(e)) => (TestStatus::Error, e.to_string()),
        Ok(Ok(result)) => {
            let failed: Vec<String> = test
                .assertions
                .iter()
                .filter(|a| !a.check(result.status, &result.stdout, &result.stderr))
                .map(|a| a.to_string())
                .collect();
            if failed.is_empty() {
                (TestStatus::Passed, String::new())
            } else {
                (
                    TestStatus::Failed,
                    format!(
                        "failed assertion(s): {}\nstatus: {}\nstdout: {}\nstderr: {}",
                        failed.join(", "),
                        result.status,
                        clip(&result.stdout),
                        clip(&result.stderr)
                    ),
                )
            }
        }
    };

    TestOutcome {
        description: test.description.clone(),
        status,
        detail,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// Runs `tests` in one container started from `spec`. Consecutive tests
/// marked independent run concurrently; outcomes keep declaration order.
/// Infrastructure failures become `Error` outcomes, so this never fails.
pub async fn run_layer_tests(
    runtime: Arc<dyn ContainerRuntime>,
    layer: &str,
    spec: &ContainerSpec,
    tests: &[TestSpec],
    timeout: Duration,
    observer: &dyn BuildObserver,
) -> TestResult {
    observer.on_event(BuildEvent::TestsStarted {
        layer: layer.to_string(),
        count: tests.len(),
    });

    let report = |outcome: &TestOutcome| {
        observer.on_event(BuildEvent::TestFinished {
            layer: layer.to_string(),
            outcome: outcome.clone(),
        })
    };

    let handle = match runtime.start(spec).await {
        Ok(handle) => handle,
        Err(e) => {
            let outcomes: Vec<TestOutcome> = tests
                .iter()
                .map(|t| TestOutcome::error(&t.description, format!("container did not start: {}", e)))
                .collect();
            outcomes.iter().for_each(report);
            return TestResult { outcomes };
        }
    };
    let guard = ContainerGuard::new(runtime.clone(), handle.clone());

    let mut outcomes = Vec::with_capacity(tests.len());
    let mut i = 0;
    while i < tests.len() {
        let batch_end = if tests[i].independent {
            i + tests[i..].iter().take_while(|t| t.independent).count()
        } else {
            i + 1
        };
        let batch = join_all(
            tests[i..batch_end]
                .iter()
                .map(|t| run_test(runtime.as_ref(), &handle, t, timeout)),
        )
        .await;
        batch.iter().for_each(report);
        outcomes.extend(batch);
        i = batch_end;
    }

    if let Err(e) = guard.stop().await {
        observer.on_event(BuildEvent::Warning {
            message: format!("failed to stop test container for {}: {}", layer, e),
        });
    }
    TestResult { outcomes }
}
