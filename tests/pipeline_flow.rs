use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use slipway::configuration::{
    AmqpSettings, BuildSettings, HealthSettings, PipelineSettings, RedisSettings, Settings,
};
use slipway::helpers::command::{CancelToken, CommandRunner};
use slipway::models::{DeploymentStatus, ProjectConfig};
use slipway::services::pipeline::PipelineRequest;
use slipway::services::queue::QueuePosition;
use slipway::startup::{build_engine, Engine};

struct TestHarness {
    engine: Arc<Engine>,
    // tempdirs are removed on drop; hold them for the test's lifetime
    _root: tempfile::TempDir,
    root: PathBuf,
}

fn harness() -> TestHarness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();

    let settings = Settings {
        work_root: root.join("work"),
        projects_root: root.join("projects"),
        vhosts_dir: root.join("vhosts"),
        ports_file: root.join("ports.json"),
        base_port: 10500,
        port_range: 100,
        queue_capacity: 1,
        status_retention_hours: 24,
        pipeline: PipelineSettings {
            step_timeout: 120,
            build_timeout: 120,
            test_timeout: 120,
            max_output_bytes: 1024 * 1024,
        },
        build: BuildSettings {
            memory_limit: "512m".to_string(),
            cpus: 1.0,
        },
        health: HealthSettings {
            path: "/".to_string(),
            interval_secs: 1,
            max_attempts: 2,
        },
        amqp: AmqpSettings {
            username: "guest".to_string(),
            password: "guest".to_string(),
            host: "127.0.0.1".to_string(),
            port: 5672,
        },
        redis: RedisSettings {
            host: "127.0.0.1".to_string(),
            port: 6379,
        },
    };

    TestHarness {
        engine: build_engine(settings).unwrap(),
        _root: dir,
        root,
    }
}

/// A local git repository with one commit of a plain static site.
async fn static_site_fixture(dir: &Path) -> String {
    let runner = CommandRunner::new(1024 * 1024);
    let script = "git init -q . && git checkout -q -b main && \
                  echo '<html><body>hello</body></html>' > index.html && \
                  git add . && git -c user.name=tester -c user.email=tester@local \
                  commit -q -m 'static site'";
    runner
        .run(script, dir, Duration::from_secs(30), CancelToken::none())
        .await
        .expect("failed to create fixture repository");
    format!("file://{}", dir.display())
}

fn request(url: &str, project: &str, deployment_id: &str) -> PipelineRequest {
    PipelineRequest {
        project: project.to_string(),
        deployment_id: deployment_id.to_string(),
        repo_url: url.to_string(),
        branch: "main".to_string(),
        token: None,
        hostname: format!("{}.example.com", project),
        config: ProjectConfig::default(),
    }
}

#[tokio::test]
async fn static_pipeline_runs_end_to_end() {
    let harness = harness();
    let fixture = tempfile::tempdir().unwrap();
    let url = static_site_fixture(fixture.path()).await;

    let deployment = harness
        .engine
        .run_deployment(request(&url, "acme-site", "dep-1"))
        .await;

    assert_eq!(
        deployment.status,
        DeploymentStatus::Ready,
        "pipeline failed: {:?}",
        deployment.log
    );
    assert_eq!(deployment.commit_hash.as_deref().map(str::len), Some(40));

    // Status finalized with merge semantics intact.
    let status = harness.engine.status.get_status("acme-site").await.unwrap();
    assert!(status.done);
    assert!(status.success);
    assert!(status.error.is_none());
    assert!(status.end_time.is_some());
    assert!(status.duration_secs.is_some());

    // Step logs recorded in execution order, one file per step.
    let step_keys: Vec<&String> = status.logs.keys().collect();
    assert_eq!(step_keys, ["preDeploy", "build", "postDeploy", "summary"]);
    let logs_dir = harness.root.join("projects/acme-site/logs");
    for step in ["preDeploy", "build", "postDeploy", "summary"] {
        let path = logs_dir.join(format!("{step}.log"));
        assert!(path.exists(), "missing step log {step}.log");
    }
    assert!(!logs_dir.join("error.log").exists());

    // The proxy got a static vhost pointing into the checkout.
    let vhost = std::fs::read_to_string(harness.root.join("vhosts/acme-site.conf")).unwrap();
    assert!(vhost.contains("acme-site.example.com"));
    assert!(vhost.contains("root "));

    // Slot released after completion.
    assert_eq!(
        harness.engine.queue.queue_position("acme-site"),
        QueuePosition::Idle
    );
}

#[tokio::test]
async fn failed_clone_finalizes_failed_with_error_log() {
    let harness = harness();

    let deployment = harness
        .engine
        .run_deployment(request("file:///nowhere/missing.git", "broken-app", "dep-2"))
        .await;

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    let error = deployment.log.expect("expected failure detail");
    assert!(error.contains("clone failed"), "unexpected error: {error}");

    let status = harness.engine.status.get_status("broken-app").await.unwrap();
    assert!(status.done);
    assert!(!status.success);
    assert!(status.error.is_some());
    assert!(status.logs.contains_key("error"));

    let error_log = harness.root.join("projects/broken-app/logs/error.log");
    assert!(error_log.exists(), "error.log not written");

    // remaining steps were skipped
    assert!(!status.logs.contains_key("postDeploy"));
    assert!(!status.logs.contains_key("summary"));
}

#[tokio::test]
async fn cancellation_kills_inflight_step() {
    let harness = harness();
    let fixture = tempfile::tempdir().unwrap();
    let url = static_site_fixture(fixture.path()).await;

    let mut req = request(&url, "slow-app", "dep-3");
    // force a long-running install step so the cancel lands mid-step
    req.config.install_command = Some("sleep 60".to_string());

    let engine = harness.engine.clone();
    let started = Instant::now();
    let run = tokio::spawn(async move { engine.run_deployment(req).await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        harness.engine.cancel_deployment("dep-3").await,
        "deployment was not registered for cancellation"
    );

    let deployment = run.await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Cancelled);
    assert!(
        started.elapsed() < Duration::from_secs(30),
        "cancellation did not kill the in-flight step"
    );

    let status = harness.engine.status.get_status("slow-app").await.unwrap();
    assert!(status.done);
    assert!(!status.success);
}

#[tokio::test]
async fn second_submission_reports_queue_position() {
    let harness = harness();
    let fixture = tempfile::tempdir().unwrap();
    let url = static_site_fixture(fixture.path()).await;

    // occupy the single slot with a slow install
    let mut slow = request(&url, "first-app", "dep-4");
    slow.config.install_command = Some("sleep 3".to_string());
    let engine_a = harness.engine.clone();
    let run_a = tokio::spawn(async move { engine_a.run_deployment(slow).await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        harness.engine.queue.queue_position("first-app"),
        QueuePosition::Running
    );

    let second = request(&url, "second-app", "dep-5");
    let engine_b = harness.engine.clone();
    let run_b = tokio::spawn(async move { engine_b.run_deployment(second).await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        harness.engine.queue.queue_position("second-app"),
        QueuePosition::Queued(1)
    );

    // first completes, second is admitted automatically and finishes
    let first = run_a.await.unwrap();
    assert_eq!(first.status, DeploymentStatus::Ready);
    let second = run_b.await.unwrap();
    assert_eq!(second.status, DeploymentStatus::Ready);
}
