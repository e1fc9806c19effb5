use crate::engine::dockerfile::{parse_dockerfile, Instruction};
use crate::engine::{ImageEngine, LayerBuildRequest, LayerImage, UnitKind};
use crate::error::{DazzleError, Result};
use crate::hasher::IgnoreRules;
use crate::image::layer::write_layer;
use crate::image::{epoch_timestamp, History, ImageConfig, ImageRef, RuntimeConfig, StoredImage};
use crate::repository::Repository;
use crate::rootfs::{self, command_env, container_path};
use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio::process::Command;
use walkdir::WalkDir;

/// Replays a reduced Dockerfile against a staged root directory and captures
/// the filesystem diff as a layer.
///
/// `RUN` executes `sh -c` on the host with its working directory inside the
/// staged root and `DAZZLE_ROOTFS` pointing at the root; there is no process
/// isolation.
pub struct LocalEngine {
    repo: Arc<dyn Repository>,
}

struct BuildState {
    workdir: String,
    env: Vec<(String, String)>,
    delta: RuntimeConfig,
}

fn set_pair(pairs: &mut Vec<(String, String)>, key: &str, value: &str) {
    match pairs.iter_mut().find(|(k, _)| k == key) {
        Some(slot) => slot.1 = value.to_string(),
        None => pairs.push((key.to_string(), value.to_string())),
    }
}

/// Expands `$VAR` and `${VAR}` from `env`; unknown variables expand to nothing
fn expand(value: &str, env: &[(String, String)]) -> String {
    let lookup = |name: &str| {
        env.iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };

    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            let name: String = chars.by_ref().take_while(|&c| c != '}').collect();
            out.push_str(&lookup(&name));
        } else {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                out.push('$');
            } else {
                out.push_str(&lookup(&name));
            }
        }
    }
    out
}

fn has_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn context_relative<'a>(context: &Path, path: &'a Path) -> &'a Path {
    path.strip_prefix(context).unwrap_or(path)
}

/// Resolves COPY sources against the context, refusing anything outside it.
/// Sources excluded by the context's `.dockerignore` are not visible.
fn copy_sources(context: &Path, ignore: &IgnoreRules, src: &str) -> io::Result<Vec<PathBuf>> {
    let candidates: Vec<PathBuf> = if has_glob(src) {
        let pattern = context.join(src);
        glob::glob(&pattern.to_string_lossy())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .filter_map(|entry| entry.ok())
            .collect()
    } else {
        vec![context.join(src)]
    };

    let mut sources = Vec::new();
    for candidate in candidates {
        let resolved = candidate.canonicalize().map_err(|_| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("COPY source '{}' not found in build context", src),
            )
        })?;
        if !resolved.starts_with(context) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("COPY source '{}' is outside the build context", src),
            ));
        }
        if ignore.is_ignored(context_relative(context, &resolved)) {
            continue;
        }
        sources.push(resolved);
    }
    if sources.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("COPY source '{}' matched nothing", src),
        ));
    }
    sources.sort();
    Ok(sources)
}

fn copy_entry(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let meta = fs::symlink_metadata(src)?;
    if let Ok(existing) = fs::symlink_metadata(dst) {
        if !(existing.is_dir() && meta.is_dir()) {
            if existing.is_dir() {
                fs::remove_dir_all(dst)?;
            } else {
                fs::remove_file(dst)?;
            }
        }
    }

    if meta.file_type().is_symlink() {
        #[cfg(unix)]
        std::os::unix::fs::symlink(fs::read_link(src)?, dst)?;
        #[cfg(not(unix))]
        fs::copy(src, dst)?;
    } else if meta.is_dir() {
        fs::create_dir_all(dst)?;
        fs::set_permissions(dst, meta.permissions())?;
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}

fn copy_into(context: &Path, srcs: &[String], root: &Path, workdir: &str, dst: &str) -> io::Result<()> {
    let context = context.canonicalize()?;
    let ignore = IgnoreRules::for_context(&context)?;
    let dest = container_path(root, workdir, dst);
    let dest_is_dir = dst.ends_with('/') || srcs.len() > 1 || dest.is_dir();

    for src in srcs {
        for source in copy_sources(&context, &ignore, src)? {
            if source.is_dir() {
                // a directory source copies its contents, like `docker build`
                let mut walker = WalkDir::new(&source).follow_links(false).min_depth(1).into_iter();
                while let Some(entry) = walker.next() {
                    let entry = entry.map_err(io::Error::from)?;
                    if ignore.is_ignored(context_relative(&context, entry.path())) {
                        if entry.file_type().is_dir() {
                            walker.skip_current_dir();
                        }
                        continue;
                    }
                    let rel = entry.path().strip_prefix(&source).unwrap_or(entry.path());
                    copy_entry(entry.path(), &dest.join(rel))?;
                }
                fs::create_dir_all(&dest)?;
            } else {
                let target = match (dest_is_dir, source.file_name()) {
                    (true, Some(name)) => dest.join(name),
                    _ => dest.clone(),
                };
                copy_entry(&source, &target)?;
            }
        }
    }
    Ok(())
}

fn tail(output: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(output);
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

impl LocalEngine {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    async fn resolve_from(&self, unit: &str, image: &str) -> Result<Option<StoredImage>> {
        if image == "scratch" {
            return Ok(None);
        }
        let reference = ImageRef::parse(image).map_err(|e| DazzleError::build(unit, e))?;
        match self.repo.resolve(&reference).await? {
            Some(found) => Ok(Some(found)),
            None => Err(DazzleError::build(
                unit,
                format!("FROM image {} is not in the local image store", reference),
            )),
        }
    }

    async fn run(&self, unit: &str, root: &Path, state: &BuildState, command: &str) -> Result<()> {
        let cwd = container_path(root, "/", &state.workdir);
        fs::create_dir_all(&cwd).map_err(|e| DazzleError::build(unit, e))?;

        tracing::debug!(unit, command, "RUN");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .envs(command_env(root, &state.env))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DazzleError::build(unit, format!("cannot spawn RUN: {}", e)))?;

        if !output.status.success() {
            return Err(DazzleError::build(
                unit,
                format!(
                    "RUN {} exited with {}: {}",
                    command,
                    output.status.code().unwrap_or(-1),
                    tail(&output.stderr, 10)
                ),
            ));
        }
        Ok(())
    }

    async fn apply(
        &self,
        request: &LayerBuildRequest,
        root: &Path,
        state: &mut BuildState,
        instruction: &Instruction,
    ) -> Result<()> {
        let unit = request.unit.as_str();
        match instruction {
            Instruction::From(image) if request.kind == UnitKind::Layer => {
                tracing::debug!(unit, image, "layer FROM replaced by the parent stack");
            }
            Instruction::From(_) | Instruction::Arg(_) | Instruction::Other(_) => {}
            Instruction::Workdir(dir) => {
                let dir = expand(dir, &state.env);
                let next = if dir.starts_with('/') {
                    dir
                } else {
                    format!("{}/{}", state.workdir.trim_end_matches('/'), dir)
                };
                fs::create_dir_all(container_path(root, "/", &next))
                    .map_err(|e| DazzleError::build(unit, e))?;
                state.workdir = next.clone();
                state.delta.working_dir = Some(next);
            }
            Instruction::Env(pairs) => {
                for (key, value) in pairs {
                    let value = expand(value, &state.env);
                    set_pair(&mut state.env, key, &value);
                    let mut delta = state.delta.env_pairs();
                    set_pair(&mut delta, key, &value);
                    state.delta.env = delta.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                }
            }
            Instruction::Label(pairs) => {
                for (key, value) in pairs {
                    state.delta.labels.insert(key.clone(), value.clone());
                }
            }
            Instruction::User(user) => state.delta.user = Some(user.clone()),
            Instruction::Cmd(argv) => state.delta.cmd = Some(argv.clone()),
            Instruction::Copy(srcs, dst) => {
                let context = request.context.clone();
                let srcs = srcs.clone();
                let dst = expand(dst, &state.env);
                let workdir = state.workdir.clone();
                let root = root.to_path_buf();
                tokio::task::spawn_blocking(move || copy_into(&context, &srcs, &root, &workdir, &dst))
                    .await
                    .map_err(|e| DazzleError::build(unit, e))?
                    .map_err(|e| DazzleError::build(unit, e))?;
            }
            Instruction::Run(command) => self.run(unit, root, state, command).await?,
        }
        Ok(())
    }
}

#[async_trait]
impl ImageEngine for LocalEngine {
    async fn build(&self, request: LayerBuildRequest) -> Result<LayerImage> {
        let unit = request.unit.clone();
        let started = Instant::now();

        if !request.context.is_dir() {
            return Err(DazzleError::build(
                &unit,
                format!("build context {} is not a directory", request.context.display()),
            ));
        }
        let dockerfile = request.context.join(&request.dockerfile);
        let content = tokio::fs::read_to_string(&dockerfile).await.map_err(|e| {
            DazzleError::build(&unit, format!("cannot read {}: {}", dockerfile.display(), e))
        })?;
        let instructions = parse_dockerfile(&content).map_err(|e| DazzleError::build(&unit, e))?;

        let mut from = None;
        let mut seen_from = false;
        for instruction in &instructions {
            match instruction {
                Instruction::Other(line) => {
                    return Err(DazzleError::build(
                        &unit,
                        format!("unsupported instruction: {}", line),
                    ))
                }
                Instruction::From(image) if request.kind == UnitKind::Base => {
                    if seen_from {
                        return Err(DazzleError::build(&unit, "multi-stage builds are not supported"));
                    }
                    seen_from = true;
                    from = self.resolve_from(&unit, image).await?;
                }
                _ => {}
            }
        }

        let mut parents: Vec<StoredImage> = from.iter().cloned().collect();
        parents.extend(request.parents.iter().cloned());

        let staging = TempDir::new().map_err(|e| DazzleError::build(&unit, e))?;
        let root = staging.path().join("rootfs");
        fs::create_dir_all(&root).map_err(|e| DazzleError::build(&unit, e))?;
        rootfs::materialize(self.repo.as_ref(), &parents, &root).await?;

        let inherited = ImageConfig::stack(parents.iter().map(|p| &p.config), request.epoch);
        let mut state = BuildState {
            workdir: inherited
                .config
                .working_dir
                .clone()
                .unwrap_or_else(|| "/".to_string()),
            env: inherited.config.env_pairs(),
            delta: RuntimeConfig::default(),
        };

        let snapshot_root = root.clone();
        let before = tokio::task::spawn_blocking(move || rootfs::snapshot(&snapshot_root))
            .await
            .map_err(|e| DazzleError::build(&unit, e))?
            .map_err(|e| DazzleError::build(&unit, e))?;

        for instruction in &instructions {
            self.apply(&request, &root, &mut state, instruction).await?;
        }

        let layer_root = root.clone();
        let blob = tokio::task::spawn_blocking(move || {
            let after = rootfs::snapshot(&layer_root)?;
            write_layer(&layer_root, &before.diff(&after))
        })
        .await
        .map_err(|e| DazzleError::build(&unit, e))?
        .map_err(|e| DazzleError::build(&unit, e))?;

        let mut config = ImageConfig::empty(request.epoch);
        config.config = state.delta;
        config.rootfs.diff_ids = vec![blob.diff_id.clone()];
        config.history = vec![History {
            created: epoch_timestamp(request.epoch),
            created_by: format!("dazzle build {} from {}", unit, request.dockerfile),
            empty_layer: None,
        }];

        tracing::debug!(
            unit = %unit,
            size_bytes = blob.size(),
            duration_ms = started.elapsed().as_millis() as u64,
            "layer built"
        );
        Ok(LayerImage { from, blob, config })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::LocalRepository;

    #[test]
    fn test_expand_variables() {
        let env = vec![("PATH".to_string(), "/bin".to_string()), ("GO".to_string(), "/go".to_string())];
        assert_eq!(expand("${GO}/bin:$PATH", &env), "/go/bin:/bin");
        assert_eq!(expand("$MISSING-x", &env), "-x");
        assert_eq!(expand("cost $5", &env), "cost ");
        assert_eq!(expand("a$", &env), "a$");
    }

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn request(context: &Path, kind: UnitKind, parents: Vec<StoredImage>) -> LayerBuildRequest {
        LayerBuildRequest {
            unit: "unit".into(),
            kind,
            context: context.to_path_buf(),
            dockerfile: "Dockerfile".into(),
            parents,
            epoch: 0,
        }
    }

    #[tokio::test]
    async fn test_build_captures_copy_env_and_workdir() {
        let store = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        write(ctx.path(), "Dockerfile", "FROM scratch\nWORKDIR /app\nCOPY conf/ etc/\nENV A=1 B=$A\nCMD [\"run\"]\n");
        write(ctx.path(), "conf/app.toml", "x = 1");

        let repo = Arc::new(LocalRepository::open(store.path()).unwrap());
        let engine = LocalEngine::new(repo);
        let image = engine.build(request(ctx.path(), UnitKind::Base, vec![])).await.unwrap();

        assert!(image.from.is_none());
        assert_eq!(image.config.config.working_dir.as_deref(), Some("/app"));
        assert_eq!(image.config.config.env, vec!["A=1", "B=1"]);
        assert_eq!(image.config.config.cmd, Some(vec!["run".to_string()]));
        assert_eq!(image.config.rootfs.diff_ids, vec![image.blob.diff_id.clone()]);

        let out = TempDir::new().unwrap();
        crate::image::layer::apply_layer(&image.blob.data, out.path()).unwrap();
        assert_eq!(
            fs::read_to_string(out.path().join("app/etc/app.toml")).unwrap(),
            "x = 1"
        );
    }

    #[tokio::test]
    async fn test_build_is_reproducible() {
        let store = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        write(ctx.path(), "Dockerfile", "FROM scratch\nCOPY . /src\nRUN echo built > out.txt\n");
        write(ctx.path(), "a.txt", "a");

        let engine = LocalEngine::new(Arc::new(LocalRepository::open(store.path()).unwrap()));
        let one = engine.build(request(ctx.path(), UnitKind::Base, vec![])).await.unwrap();
        let two = engine.build(request(ctx.path(), UnitKind::Base, vec![])).await.unwrap();
        assert_eq!(one.blob.digest, two.blob.digest);
        assert_eq!(one.config, two.config);
    }

    #[tokio::test]
    async fn test_failing_run_is_a_build_error() {
        let store = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        write(ctx.path(), "Dockerfile", "FROM scratch\nRUN echo nope >&2; exit 3\n");

        let engine = LocalEngine::new(Arc::new(LocalRepository::open(store.path()).unwrap()));
        let err = engine
            .build(request(ctx.path(), UnitKind::Layer, vec![]))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exited with 3") && msg.contains("nope"), "{}", msg);
    }

    #[tokio::test]
    async fn test_unsupported_instruction_and_missing_from() {
        let store = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        let engine = LocalEngine::new(Arc::new(LocalRepository::open(store.path()).unwrap()));

        write(ctx.path(), "Dockerfile", "FROM scratch\nEXPOSE 80\n");
        let err = engine.build(request(ctx.path(), UnitKind::Layer, vec![])).await.unwrap_err();
        assert!(err.to_string().contains("unsupported"));

        write(ctx.path(), "Dockerfile", "FROM nothere:1\n");
        let err = engine.build(request(ctx.path(), UnitKind::Base, vec![])).await.unwrap_err();
        assert!(err.to_string().contains("nothere"));
    }

    #[tokio::test]
    async fn test_copy_outside_context_is_rejected() {
        let store = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        write(ctx.path(), "Dockerfile", "COPY ../secret /x\n");
        let engine = LocalEngine::new(Arc::new(LocalRepository::open(store.path()).unwrap()));
        assert!(engine.build(request(ctx.path(), UnitKind::Layer, vec![])).await.is_err());
    }

    #[tokio::test]
    async fn test_copy_skips_ignored_entries() {
        let store = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        write(ctx.path(), "Dockerfile", "COPY . /src
COPY *.txt /flat/
");
        write(ctx.path(), ".dockerignore", "*.log
cache
");
        write(ctx.path(), "keep.txt", "keep");
        write(ctx.path(), "debug.log", "noise");
        write(ctx.path(), "cache/blob", "noise");
        fs::create_dir(ctx.path().join("empty")).unwrap();

        let engine = LocalEngine::new(Arc::new(LocalRepository::open(store.path()).unwrap()));
        let image = engine.build(request(ctx.path(), UnitKind::Layer, vec![])).await.unwrap();

        let out = TempDir::new().unwrap();
        crate::image::layer::apply_layer(&image.blob.data, out.path()).unwrap();
        assert_eq!(fs::read_to_string(out.path().join("src/keep.txt")).unwrap(), "keep");
        assert!(out.path().join("src/.dockerignore").exists());
        assert!(out.path().join("src/empty").is_dir());
        assert!(!out.path().join("src/debug.log").exists());
        assert!(!out.path().join("src/cache").exists());
        assert!(out.path().join("flat/keep.txt").exists());
    }

    #[test]
    fn test_ignored_explicit_source_matches_nothing() {
        let ctx = TempDir::new().unwrap();
        write(ctx.path(), "debug.log", "noise");
        let context = ctx.path().canonicalize().unwrap();
        let err = copy_sources(&context, &IgnoreRules::parse("*.log"), "debug.log").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
