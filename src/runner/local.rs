use crate::error::{DazzleError, Result};
use crate::image::RuntimeConfig;
use crate::repository::Repository;
use crate::rootfs::{self, command_env, container_path};
use crate::runner::{ContainerHandle, ContainerRuntime, ContainerSpec, ExecRequest, ExecResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::Command;

struct Container {
    dir: TempDir,
    root: PathBuf,
    config: RuntimeConfig,
}

/// Runs containers as materialised root directories on the host. Commands
/// run with their working directory inside the root; nothing is isolated.
pub struct LocalRuntime {
    repo: Arc<dyn Repository>,
    containers: Mutex<HashMap<String, Container>>,
}

impl LocalRuntime {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Containers started and not yet stopped
    pub fn running(&self) -> usize {
        self.containers.lock().len()
    }
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let dir = TempDir::new().map_err(|e| DazzleError::runner(&spec.name, e))?;
        let root = dir.path().join("rootfs");
        std::fs::create_dir_all(&root).map_err(|e| DazzleError::runner(&spec.name, e))?;
        rootfs::materialize(self.repo.as_ref(), &spec.images, &root)
            .await
            .map_err(|e| DazzleError::runner(&spec.name, e))?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        tracing::debug!(container = %id, image = %spec.name, "container started");
        self.containers.lock().insert(
            id.clone(),
            Container {
                dir,
                root,
                config: spec.config.config.clone(),
            },
        );
        Ok(ContainerHandle { id })
    }

    async fn exec(&self, container: &ContainerHandle, request: &ExecRequest) -> Result<ExecResult> {
        let (root, config) = {
            let containers = self.containers.lock();
            let c = containers
                .get(&container.id)
                .ok_or_else(|| DazzleError::runner(&container.id, "no such container"))?;
            (c.root.clone(), c.config.clone())
        };
        let Some((program, args)) = request.command.split_first() else {
            return Err(DazzleError::runner(&container.id, "empty command"));
        };

        let mut env = config.env_pairs();
        env.extend(request.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let cwd = container_path(&root, "/", config.working_dir.as_deref().unwrap_or("/"));
        std::fs::create_dir_all(&cwd).map_err(|e| DazzleError::runner(&container.id, e))?;

        let output = Command::new(program)
            .args(args)
            .current_dir(&cwd)
            .envs(command_env(&root, &env))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DazzleError::runner(&container.id, format!("cannot run {}: {}", program, e)))?;

        Ok(ExecResult {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn stop(&self, container: &ContainerHandle) -> Result<()> {
        let removed = self.containers.lock().remove(&container.id);
        match removed {
            Some(c) => {
                tracing::debug!(container = %container.id, "container stopped");
                c.dir.close().map_err(|e| DazzleError::runner(&container.id, e))
            }
            None => Ok(()),
        }
    }
}
