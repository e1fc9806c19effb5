use async_trait::async_trait;
use dazzle::constants::MEDIA_TYPE_LAYER;
use dazzle::engine::{ImageEngine, LayerBuildRequest, LayerImage, LocalEngine, UnitKind};
use dazzle::error::DazzleError;
use dazzle::image::layer::apply_layer;
use dazzle::image::ImageRef;
use dazzle::logging::{BuildEvent, BuildPhase, RecordingObserver};
use dazzle::repository::{Repository, TagMode};
use dazzle::runner::{LocalRuntime, TestStatus};
use dazzle::{build, report, BuildConfig, Environment, LayerStatus};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

/// Delegates to the local engine and counts how often it actually ran
struct CountingEngine {
    inner: LocalEngine,
    builds: AtomicUsize,
}

#[async_trait]
impl ImageEngine for CountingEngine {
    async fn build(&self, request: LayerBuildRequest) -> dazzle::Result<LayerImage> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.inner.build(request).await
    }
}

struct Harness {
    _store: TempDir,
    config: BuildConfig,
    engine: Arc<CountingEngine>,
    runtime: Arc<LocalRuntime>,
    observer: Arc<RecordingObserver>,
}

impl Harness {
    fn new() -> Self {
        Self::with_parallelism(1)
    }

    fn with_parallelism(jobs: usize) -> Self {
        let store = tempdir().unwrap();
        let env = Environment::local(store.path()).unwrap();
        let engine = Arc::new(CountingEngine {
            inner: LocalEngine::new(env.repository.clone()),
            builds: AtomicUsize::new(0),
        });
        let runtime = Arc::new(LocalRuntime::new(env.repository.clone()));
        let observer = Arc::new(RecordingObserver::new());
        let env = env
            .with_engine(engine.clone())
            .with_runtime(runtime.clone())
            .with_observer(observer.clone());
        let config = BuildConfig::new(env)
            .with_repository("work")
            .with_parallelism(jobs, jobs)
            .with_source_date_epoch(0);
        Self {
            _store: store,
            config,
            engine,
            runtime,
            observer,
        }
    }

    fn engine_builds(&self) -> usize {
        self.engine.builds.load(Ordering::SeqCst)
    }

    fn repo(&self) -> &Arc<dyn Repository> {
        &self.config.env.repository
    }

    /// Applies every layer of `reference` to a fresh directory
    async fn unpack(&self, reference: &ImageRef) -> TempDir {
        let image = self.repo().resolve(reference).await.unwrap().unwrap();
        let out = tempdir().unwrap();
        for layer in &image.manifest.layers {
            let data = self.repo().read_blob(&layer.digest).await.unwrap();
            apply_layer(&data, out.path()).unwrap();
        }
        out
    }

    /// Builds a one-layer image holding `/etc/os-release` and tags it `upstream:1`
    async fn tag_upstream(&self, os_release: &str) {
        let ctx = tempdir().unwrap();
        write(ctx.path(), "Dockerfile", "FROM scratch\nCOPY os-release /etc/os-release\n");
        write(ctx.path(), "os-release", os_release);
        let built = LocalEngine::new(self.repo().clone())
            .build(LayerBuildRequest {
                unit: "upstream".into(),
                kind: UnitKind::Base,
                context: ctx.path().to_path_buf(),
                dockerfile: "Dockerfile".into(),
                parents: vec![],
                epoch: 0,
            })
            .await
            .unwrap();
        let layer = self.repo().put_blob(MEDIA_TYPE_LAYER, &built.blob.data).await.unwrap();
        self.repo()
            .put_image(
                &ImageRef::parse("upstream:1").unwrap(),
                vec![layer],
                &built.config,
                TagMode::Overwrite,
            )
            .await
            .unwrap();
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

const DEFINITION: &str = r#"
layers:
  - name: tools
    depends: [base]
    tests:
      - desc: tool greets
        command: ["tool"]
        assert:
          - status == 0
          - stdout == "tool hello"
      - desc: exits cleanly
        command: ["sh", "-c", "echo broken >&2; exit 3"]
        assert:
          - status == 0
  - name: app
    depends: [tools]
    tests:
      - desc: app file in workdir
        command: ["cat", "app.txt"]
        assert:
          - stdout contains "app v1"
"#;

/// base, tools and app, where app depends on tools
fn project(definition: &str) -> TempDir {
    let dir = tempdir().unwrap();
    let root = dir.path();
    write(root, "dazzle.yaml", definition);
    write(root, "base/Dockerfile", "FROM scratch\nCOPY motd /etc/motd\nENV GREETING=hello\n");
    write(root, "base/motd", "welcome\n");
    write(
        root,
        "layers/tools/Dockerfile",
        "COPY tool.sh /usr/local/bin/tool\nENV PATH=/usr/local/bin\n",
    );
    write(root, "layers/tools/tool.sh", "#!/bin/sh\necho \"tool $GREETING\"\n");
    #[cfg(unix)]
    make_executable(&root.join("layers/tools/tool.sh"));
    write(
        root,
        "layers/app/Dockerfile",
        "COPY app.txt /opt/app/app.txt\nWORKDIR /opt/app\n",
    );
    write(root, "layers/app/app.txt", "app v1\n");
    dir
}

fn tag() -> ImageRef {
    ImageRef::parse("dazzle-built:test").unwrap()
}

#[tokio::test]
async fn test_second_build_reuses_every_layer() {
    let project = project(DEFINITION);
    let harness = Harness::new();

    let first = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    assert_eq!(harness.engine_builds(), 3);
    assert_eq!(first.stats.executed_layers, 2);
    assert!(!first.base.cache_hit);
    let first_image = first.image.clone().unwrap();

    let second = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    assert_eq!(harness.engine_builds(), 3, "nothing rebuilt on the second run");
    assert!(second.base.cache_hit);
    assert_eq!(second.stats.executed_layers, 0);
    assert_eq!(second.stats.cache_hits, 2);
    assert_eq!(second.stats.cache_hit_rate(), 100.0);

    for name in ["tools", "app"] {
        let (a, b) = (first.layer(name).unwrap(), second.layer(name).unwrap());
        assert_eq!(a.reference, b.reference);
        assert_eq!(a.size, b.size);
        assert_eq!(a.fingerprint, b.fingerprint);
    }
    assert_eq!(second.image.unwrap(), first_image);
}

#[tokio::test]
async fn test_layer_refs_follow_fingerprints() {
    let project = project(DEFINITION);
    let harness = Harness::new();

    let result = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    let tools = result.layer("tools").unwrap();
    assert_eq!(tools.reference.name, "work/tools");
    assert_eq!(tools.reference.tag, tools.fingerprint.to_string());
    assert_eq!(result.base.reference.name, "work");
    assert!(result.base.reference.tag.starts_with("base-"));

    let composed = result.image.unwrap();
    assert_eq!(composed.reference, tag());
    // base layer plus one layer per declared layer
    assert_eq!(composed.layers, 3);
    let stored = harness
        .config
        .env
        .repository
        .resolve(&tag())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.manifest_digest, composed.manifest_digest);
    assert_eq!(stored.config.config.working_dir.as_deref(), Some("/opt/app"));
}

#[tokio::test]
async fn test_context_change_rebuilds_only_downstream_layers() {
    let project = project(DEFINITION);
    let harness = Harness::new();

    let first = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    write(project.path(), "layers/app/app.txt", "app v2\n");

    let second = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    assert_eq!(harness.engine_builds(), 4);
    assert!(second.layer("tools").unwrap().cache_hit);
    assert!(!second.layer("app").unwrap().cache_hit);
    assert_ne!(
        first.layer("app").unwrap().reference,
        second.layer("app").unwrap().reference
    );
    assert_ne!(first.image.unwrap().manifest_digest, second.image.unwrap().manifest_digest);
}

#[tokio::test]
async fn test_failed_layer_skips_dependents_and_keeps_the_rest() {
    let definition = DEFINITION.replace("  - name: tools\n", "  - name: tools\n    context: missing\n");
    let project = project(&definition);
    let harness = Harness::new();

    let failure = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap_err();
    match &failure.error {
        DazzleError::LayersFailed { failed } => assert_eq!(failed, &vec!["tools".to_string()]),
        other => panic!("unexpected error: {}", other),
    }

    let result = failure.result.expect("base was built");
    assert!(matches!(result.status("tools"), Some(LayerStatus::Failed(_))));
    assert_eq!(result.status("app"), Some(&LayerStatus::Skipped("tools".to_string())));
    assert!(result.layers.is_empty());
    assert!(result.image.is_none());
    assert_eq!(result.stats.failed_layers, 1);
    assert_eq!(result.stats.skipped_layers, 1);
    assert!(!result.is_success());
    assert!(harness
        .config
        .env
        .repository
        .resolve(&tag())
        .await
        .unwrap()
        .is_none());
    assert!(harness.observer.events().iter().any(|e| matches!(
        e,
        BuildEvent::LayerSkipped { layer, failed_dependency } if layer == "app" && failed_dependency == "tools"
    )));
    assert_eq!(harness.observer.phases().last(), Some(&BuildPhase::Failed));
}

#[tokio::test]
async fn test_independent_layer_builds_and_tests_after_a_failure() {
    let definition = r#"
layers:
  - name: broken
    context: nowhere
  - name: solo
    context: layers/app
    tests:
      - desc: solo file
        command: ["cat", "app.txt"]
"#;
    let project = project(definition);
    let harness = Harness::new();

    let failure = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap_err();
    let result = failure.result.unwrap();
    assert_eq!(result.status("solo"), Some(&LayerStatus::Built));
    let solo = result.layer("solo").unwrap();
    assert_eq!(solo.test_result.as_ref().unwrap().passed(), 1);
    assert_eq!(result.stats.tests_passed, 1);
}

#[tokio::test]
async fn test_layer_tests_are_reported_per_layer() {
    let project = project(DEFINITION);
    let harness = Harness::new();

    let result = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    assert!(result.image.is_some());
    assert!(!result.tests_passed());
    assert!(!result.is_success());
    assert_eq!(
        (result.stats.tests_passed, result.stats.tests_failed, result.stats.tests_errored),
        (2, 1, 0)
    );

    let report = report::aggregate(&result.layers);
    let summary: Vec<(&str, TestStatus)> = report
        .outcomes
        .iter()
        .map(|o| (o.description.as_str(), o.status))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("tools: tool greets", TestStatus::Passed),
            ("tools: exits cleanly", TestStatus::Failed),
            ("app: app file in workdir", TestStatus::Passed),
        ]
    );
    assert!(report.outcomes[1].detail.contains("status: 3"), "{}", report.outcomes[1].detail);
    assert!(report.outcomes[1].detail.contains("broken"));
}

#[tokio::test]
async fn test_test_containers_are_removed() {
    let project = project(DEFINITION);
    let harness = Harness::new();

    build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    assert_eq!(harness.runtime.running(), 0);
}

#[tokio::test]
async fn test_dependencies_start_first() {
    let definition = r#"
layers:
  - name: app
    depends: [tools]
  - name: tools
"#;
    let project = project(definition);
    let harness = Harness::new();

    build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    assert_eq!(harness.observer.started_layers(), vec!["base", "tools", "app"]);
}

#[tokio::test]
async fn test_phases_of_a_successful_build() {
    let project = project("layers:\n  - name: tools\n");
    let harness = Harness::new();

    let result = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(
        harness.observer.phases(),
        vec![
            BuildPhase::Resolving,
            BuildPhase::Scheduling,
            BuildPhase::Building,
            BuildPhase::Composing,
            BuildPhase::Testing,
            BuildPhase::Aggregating,
            BuildPhase::Done,
        ]
    );
}

#[tokio::test]
async fn test_invalid_definitions_fail_before_building() {
    let cases = [
        "layers:\n  - name: a\n    depends: [b]\n  - name: b\n    depends: [a]\n",
        "layers:\n  - name: a\n    depends: [ghost]\n",
        "layers:\n  - name: a\n  - name: a\n",
        "layers:\n  - name: Bad Name\n",
    ];
    for definition in cases {
        let project = project(definition);
        let harness = Harness::new();

        let failure = build(&harness.config, project.path(), "dazzle.yaml", &tag())
            .await
            .unwrap_err();
        assert!(failure.result.is_none(), "{}", definition);
        assert!(
            matches!(failure.error, DazzleError::Configuration { .. }),
            "{}: {}",
            definition,
            failure.error
        );
        assert_eq!(harness.engine_builds(), 0);
        assert_eq!(
            harness.observer.phases(),
            vec![BuildPhase::Resolving, BuildPhase::Failed]
        );
    }
}

#[tokio::test]
async fn test_broken_base_aborts_without_result() {
    let project = project("layers:\n  - name: tools\n");
    write(project.path(), "base/Dockerfile", "FROM scratch\nRUN exit 7\n");
    let harness = Harness::new();

    let failure = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap_err();
    assert!(failure.result.is_none());
    assert!(matches!(failure.error, DazzleError::Build { ref layer, .. } if layer == "base"));
    assert_eq!(harness.engine_builds(), 1);
}

#[tokio::test]
async fn test_same_inputs_in_separate_stores_compose_identically() {
    let project = project(DEFINITION);
    let (one, two) = (Harness::new(), Harness::new());

    let a = build(&one.config, project.path(), "dazzle.yaml", &tag()).await.unwrap();
    let b = build(&two.config, project.path(), "dazzle.yaml", &tag()).await.unwrap();
    assert_eq!(a.image.unwrap(), b.image.unwrap());
    assert_eq!(a.base.reference, b.base.reference);
}

#[tokio::test]
async fn test_ignored_files_neither_enter_nor_key_a_layer() {
    let project = project("layers:\n  - name: tools\n");
    write(project.path(), "layers/tools/Dockerfile", "COPY . /src\n");
    write(project.path(), "layers/tools/.dockerignore", "*.log\n");
    write(project.path(), "layers/tools/app.log", "v1");
    fs::create_dir(project.path().join("layers/tools/empty")).unwrap();
    let harness = Harness::new();

    let first = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    write(project.path(), "layers/tools/app.log", "v2");
    let second = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();

    let (a, b) = (first.layer("tools").unwrap(), second.layer("tools").unwrap());
    assert!(b.cache_hit);
    assert_eq!(a.image.manifest_digest, b.image.manifest_digest);

    let layer = harness.unpack(&b.reference).await;
    assert!(!layer.path().join("src/app.log").exists());
    assert!(layer.path().join("src/tool.sh").exists());
    assert!(layer.path().join("src/empty").is_dir());

    // a store that never saw v1 must produce the same image
    let fresh = Harness::new();
    let rebuilt = build(&fresh.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    assert_eq!(rebuilt.layer("tools").unwrap().reference, b.reference);
    assert_eq!(rebuilt.image.unwrap(), second.image.unwrap());
}

#[tokio::test]
async fn test_moving_the_from_tag_rebuilds_the_base() {
    let project = project("layers:\n  - name: tools\n");
    write(project.path(), "base/Dockerfile", "FROM upstream:1\nCOPY motd /etc/motd\n");
    let harness = Harness::new();

    harness.tag_upstream("v1\n").await;
    let first = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    let image = harness.unpack(&tag()).await;
    assert_eq!(fs::read_to_string(image.path().join("etc/os-release")).unwrap(), "v1\n");

    harness.tag_upstream("v2\n").await;
    let second = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    assert!(!second.base.cache_hit);
    assert_ne!(first.base.fingerprint, second.base.fingerprint);
    assert!(!second.layer("tools").unwrap().cache_hit, "layers chain from the base");
    assert_eq!(harness.engine_builds(), 4);

    let image = harness.unpack(&tag()).await;
    assert_eq!(fs::read_to_string(image.path().join("etc/os-release")).unwrap(), "v2\n");
    assert_eq!(fs::read_to_string(image.path().join("etc/motd")).unwrap(), "welcome\n");
}

fn position(events: &[BuildEvent], wanted: impl Fn(&BuildEvent) -> bool) -> usize {
    events.iter().position(wanted).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_diamond_starts_layers_only_after_their_dependencies() {
    let definition = r#"
layers:
  - name: lib
  - name: tools
  - name: app
    depends: [lib, tools]
"#;
    let project = project(definition);
    write(project.path(), "layers/lib/Dockerfile", "COPY lib.txt /opt/lib/\nRUN sleep 0.2\n");
    write(project.path(), "layers/lib/lib.txt", "lib\n");
    let harness = Harness::with_parallelism(4);

    let result = build(&harness.config, project.path(), "dazzle.yaml", &tag())
        .await
        .unwrap();
    assert!(result.is_success());

    let events = harness.observer.events();
    let started = |name: &str| {
        position(&events, |e| matches!(e, BuildEvent::LayerStarted { layer, .. } if layer == name))
    };
    let built = |name: &str| {
        position(&events, |e| matches!(e, BuildEvent::LayerBuilt { layer, .. } if layer == name))
    };
    for (layer, deps) in [("lib", vec!["base"]), ("tools", vec!["base"]), ("app", vec!["lib", "tools"])] {
        for dep in deps {
            assert!(built(dep) < started(layer), "{} started before {} was built", layer, dep);
        }
    }

    let image = harness.unpack(&tag()).await;
    assert!(image.path().join("opt/lib/lib.txt").exists());
    assert!(image.path().join("opt/app/app.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_builds_share_one_store() {
    let project = project(DEFINITION);
    let harness = Harness::with_parallelism(4);

    let (tag_a, tag_b) = (tag(), tag());
    let (a, b) = tokio::join!(
        build(&harness.config, project.path(), "dazzle.yaml", &tag_a),
        build(&harness.config, project.path(), "dazzle.yaml", &tag_b)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    for name in ["tools", "app"] {
        assert_eq!(
            a.layer(name).unwrap().image.manifest_digest,
            b.layer(name).unwrap().image.manifest_digest
        );
    }
    let (a, b) = (a.image.unwrap(), b.image.unwrap());
    assert_eq!(a, b);
    let stored = harness.repo().resolve(&tag()).await.unwrap().unwrap();
    assert_eq!(stored.manifest_digest, a.manifest_digest);
}
