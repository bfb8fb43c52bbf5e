use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::configuration::Settings;
use crate::errors::EngineError;
use crate::helpers::command::{CancelToken, CommandRunner};
use crate::helpers::mq_manager::{channels, DeploymentEvent, MqManager};
use crate::helpers::CacheManager;
use crate::models::{Deployment, DeploymentStatus, DetectionResult, Language, ProjectConfig};
use crate::services::builder::{Artifact, BuildRequest, BuilderService};
use crate::services::deployer::{DeployRequest, DeployerService};
use crate::services::detector::Detector;
use crate::services::git::GitService;
use crate::services::queue::PipelineQueue;
use crate::services::status::{StatusStore, StatusUpdate};

// Fixed step names; each maps 1:1 to its log file.
pub const STEP_PRE_DEPLOY: &str = "preDeploy";
pub const STEP_BUILD: &str = "build";
pub const STEP_TEST: &str = "test";
pub const STEP_POST_DEPLOY: &str = "postDeploy";
pub const STEP_SUMMARY: &str = "summary";
pub const ERROR_LOG: &str = "error";

/// How long a finished pipeline's status snapshot stays in the cache.
const STATUS_CACHE_TTL: Duration = Duration::from_secs(3600);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PipelineRequest
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One deployment request as handed over by the API layer or the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    pub project: String,
    pub deployment_id: String,
    pub repo_url: String,
    pub branch: String,
    #[serde(default)]
    pub token: Option<String>,
    pub hostname: String,
    #[serde(default)]
    pub config: ProjectConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PipelineRunner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Composes Git -> Detect -> Install -> Build -> Test -> Deploy ->
/// Summarize into one ordered, per-step-timed, per-step-logged execution.
/// Steps run strictly one after another; a step's failure skips the rest
/// and finalizes the status as failed. Nothing a step throws escapes this
/// runner.
pub struct PipelineRunner {
    settings: Arc<Settings>,
    runner: CommandRunner,
    git: GitService,
    builder: BuilderService,
    deployer: Arc<DeployerService>,
    status: Arc<StatusStore>,
    queue: Arc<PipelineQueue>,
    mq: Arc<MqManager>,
    cache: Arc<CacheManager>,
}

struct StepContext {
    total_steps: usize,
    next_index: usize,
}

impl PipelineRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        runner: CommandRunner,
        git: GitService,
        builder: BuilderService,
        deployer: Arc<DeployerService>,
        status: Arc<StatusStore>,
        queue: Arc<PipelineQueue>,
        mq: Arc<MqManager>,
        cache: Arc<CacheManager>,
    ) -> Self {
        Self {
            settings,
            runner,
            git,
            builder,
            deployer,
            status,
            queue,
            mq,
            cache,
        }
    }

    /// Run one deployment end to end. Always returns a terminal
    /// `Deployment` record; failure and cancellation are states, not
    /// panics.
    #[tracing::instrument(name = "Run pipeline", skip(self, request, cancel), fields(project = %request.project, deployment_id = %request.deployment_id))]
    pub async fn run(&self, request: PipelineRequest, cancel: CancelToken) -> Deployment {
        let mut deployment = Deployment::new(
            request.deployment_id.clone(),
            request.project.clone(),
            request.branch.clone(),
        );

        self.publish(
            channels::AUDIT,
            "deployment.requested",
            &request.deployment_id,
            json!({ "project": request.project, "branch": request.branch }),
        )
        .await;

        let permit = self.queue.acquire(&request.project).await;

        let test_enabled = !request.config.skip_tests && request.config.test_command.is_some();
        let mut ctx = StepContext {
            total_steps: if test_enabled { 5 } else { 4 },
            next_index: 1,
        };

        if let Err(err) = std::fs::create_dir_all(self.settings.logs_dir(&request.project)) {
            tracing::warn!(error = %err, "cannot create logs directory");
        }
        // a previous run's error.log must not outlive it
        let _ = std::fs::remove_file(self.step_log_path(&request.project, ERROR_LOG));

        self.status.begin_run(&request.project, ctx.total_steps).await;
        deployment.status = DeploymentStatus::Building;
        self.publish(
            channels::DEPLOYMENTS,
            "pipeline.started",
            &request.deployment_id,
            json!({ "project": request.project, "totalSteps": ctx.total_steps }),
        )
        .await;

        let outcome = self
            .execute_steps(&request, &mut deployment, &mut ctx, test_enabled, &cancel)
            .await;

        match outcome {
            Ok(url) => {
                self.status
                    .update_status(&request.project, StatusUpdate::finished(true, None))
                    .await;
                deployment.status = DeploymentStatus::Ready;
                self.publish(
                    channels::DEPLOYMENTS,
                    "pipeline.completed",
                    &request.deployment_id,
                    json!({ "project": request.project, "url": url }),
                )
                .await;
                self.publish(
                    channels::NOTIFICATIONS,
                    "deployment.ready",
                    &request.deployment_id,
                    json!({ "project": request.project, "url": url }),
                )
                .await;
            }
            Err(err) => {
                let cancelled = cancel.is_cancelled() || matches!(err, EngineError::Cancelled);
                let message = if cancelled {
                    "pipeline cancelled".to_string()
                } else {
                    err.to_string()
                };

                self.write_step_log(&request.project, ERROR_LOG, &message);
                self.status
                    .update_status(&request.project, StatusUpdate::log(ERROR_LOG, &message))
                    .await;
                self.status
                    .update_status(
                        &request.project,
                        StatusUpdate::finished(false, Some(message.clone())),
                    )
                    .await;

                deployment.status = if cancelled {
                    DeploymentStatus::Cancelled
                } else {
                    DeploymentStatus::Failed
                };
                deployment.log = Some(message.clone());

                let event_type = if cancelled {
                    "pipeline.cancelled"
                } else {
                    "pipeline.failed"
                };
                self.publish(
                    channels::DEPLOYMENTS,
                    event_type,
                    &request.deployment_id,
                    json!({ "project": request.project, "error": message }),
                )
                .await;
                self.publish(
                    channels::NOTIFICATIONS,
                    "deployment.failed",
                    &request.deployment_id,
                    json!({ "project": request.project, "error": message }),
                )
                .await;
            }
        }

        deployment.completed_at = Some(Utc::now());
        self.emit_metrics(&request, &deployment).await;
        self.cache_status_snapshot(&request.project).await;

        drop(permit);
        deployment
    }

    async fn execute_steps(
        &self,
        request: &PipelineRequest,
        deployment: &mut Deployment,
        ctx: &mut StepContext,
        test_enabled: bool,
        cancel: &CancelToken,
    ) -> Result<Option<String>, EngineError> {
        // acquire source: clone + detect + install
        self.ensure_not_cancelled(cancel)?;
        let detection = self
            .step_pre_deploy(request, deployment, ctx, cancel)
            .await?;

        // build
        self.ensure_not_cancelled(cancel)?;
        let artifact = self.step_build(request, &detection, ctx, cancel).await?;

        // test (skippable via configuration)
        if test_enabled {
            self.ensure_not_cancelled(cancel)?;
            self.step_test(request, &detection, ctx, cancel).await?;
        }

        // deploy
        self.ensure_not_cancelled(cancel)?;
        let deploy = self
            .step_post_deploy(request, &detection, &artifact, ctx, cancel)
            .await?;

        // summarize
        let url = deploy.url.clone();
        self.step_summary(request, deployment, &detection, &artifact, &deploy, ctx)
            .await;

        // A containerized artifact no longer needs its checkout; static
        // output keeps serving straight from the work directory.
        if matches!(artifact, Artifact::Image { .. }) {
            self.git.cleanup(&request.deployment_id);
        }

        Ok(url)
    }

    async fn step_pre_deploy(
        &self,
        request: &PipelineRequest,
        deployment: &mut Deployment,
        ctx: &mut StepContext,
        cancel: &CancelToken,
    ) -> Result<DetectionResult, EngineError> {
        self.begin_step(request, STEP_PRE_DEPLOY, ctx).await;
        let mut log = String::new();

        let clone = self
            .git
            .clone_repository(
                &request.repo_url,
                &request.deployment_id,
                &request.branch,
                request.token.as_deref(),
                cancel.clone(),
            )
            .await;

        if !clone.success {
            let reason = clone
                .error
                .unwrap_or_else(|| "unknown clone failure".to_string());
            return Err(EngineError::Clone(reason));
        }

        deployment.commit_hash = clone.commit_hash.clone();
        deployment.commit_message = clone.commit_message.clone();
        deployment.commit_author = clone.commit_author.clone();

        let work_dir = clone
            .path
            .unwrap_or_else(|| self.settings.work_dir(&request.deployment_id));
        log.push_str(&format!(
            "cloned {} ({}) at {}\n",
            request.repo_url,
            request.branch,
            clone.commit_hash.as_deref().unwrap_or("unknown"),
        ));

        let detection = Detector::detect_project(&work_dir, &request.config);
        log.push_str(&format!(
            "detected language={} framework={} package_manager={}\n",
            detection.language, detection.framework, detection.package_manager,
        ));

        if let Some(install) = &detection.install_command {
            log.push_str(&format!("$ {}\n", install));
            let output = self
                .runner
                .run(
                    install,
                    &detection.project_root,
                    Duration::from_secs(self.settings.pipeline.step_timeout),
                    cancel.clone(),
                )
                .await?;
            log.push_str(&output.combined);
        }

        self.complete_step(request, STEP_PRE_DEPLOY, &log).await;
        Ok(detection)
    }

    async fn step_build(
        &self,
        request: &PipelineRequest,
        detection: &DetectionResult,
        ctx: &mut StepContext,
        cancel: &CancelToken,
    ) -> Result<Artifact, EngineError> {
        self.begin_step(request, STEP_BUILD, ctx).await;

        let log_file = self.step_log_path(&request.project, STEP_BUILD);
        let build_request = BuildRequest {
            project: &request.project,
            deployment_id: &request.deployment_id,
            detection,
            log_file: &log_file,
        };
        let result = self.builder.build(&build_request, cancel.clone()).await;

        // Image builds stream into the log file as they run; a static
        // confirmation produces no stream, so write its log here.
        if !log_file.exists() {
            self.write_step_log(&request.project, STEP_BUILD, &result.log);
        }
        self.status
            .update_status(&request.project, StatusUpdate::log(STEP_BUILD, &result.log))
            .await;

        if !result.success {
            return Err(EngineError::Build(
                result
                    .error
                    .unwrap_or_else(|| "unknown build failure".to_string()),
            ));
        }

        self.publish_step_event(request, STEP_BUILD).await;
        result
            .artifact
            .ok_or_else(|| EngineError::Build("build reported success without an artifact".to_string()))
    }

    async fn step_test(
        &self,
        request: &PipelineRequest,
        detection: &DetectionResult,
        ctx: &mut StepContext,
        cancel: &CancelToken,
    ) -> Result<(), EngineError> {
        self.begin_step(request, STEP_TEST, ctx).await;

        let command = match &request.config.test_command {
            Some(command) => command.clone(),
            None => return Ok(()),
        };

        let mut log = format!("$ {}\n", command);
        let output = self
            .runner
            .run(
                &command,
                &detection.project_root,
                Duration::from_secs(self.settings.pipeline.test_timeout),
                cancel.clone(),
            )
            .await?;
        log.push_str(&output.combined);

        self.complete_step(request, STEP_TEST, &log).await;
        Ok(())
    }

    async fn step_post_deploy(
        &self,
        request: &PipelineRequest,
        detection: &DetectionResult,
        artifact: &Artifact,
        ctx: &mut StepContext,
        cancel: &CancelToken,
    ) -> Result<crate::services::deployer::DeployResult, EngineError> {
        self.begin_step(request, STEP_POST_DEPLOY, ctx).await;

        let container_port = request
            .config
            .container_port
            .unwrap_or_else(|| default_container_port(detection.language));
        let deploy_request = DeployRequest {
            project: &request.project,
            deployment_id: &request.deployment_id,
            hostname: &request.hostname,
            artifact,
            container_port,
        };
        let result = self.deployer.deploy(&deploy_request, cancel.clone()).await;

        if !result.success {
            return Err(EngineError::Deploy(
                result
                    .error
                    .unwrap_or_else(|| "unknown deploy failure".to_string()),
            ));
        }

        let mut log = String::new();
        match artifact {
            Artifact::Static { path } => {
                log.push_str(&format!("published static files from {}\n", path.display()))
            }
            Artifact::Image { tag } => {
                log.push_str(&format!("started container from image {}\n", tag));
                if let Some(port) = result.port {
                    log.push_str(&format!("bound to host port {}\n", port));
                }
            }
        }
        if let Some(url) = &result.url {
            log.push_str(&format!("routed {}\n", url));
        }

        self.complete_step(request, STEP_POST_DEPLOY, &log).await;
        Ok(result)
    }

    async fn step_summary(
        &self,
        request: &PipelineRequest,
        deployment: &Deployment,
        detection: &DetectionResult,
        artifact: &Artifact,
        deploy: &crate::services::deployer::DeployResult,
        ctx: &mut StepContext,
    ) {
        self.begin_step(request, STEP_SUMMARY, ctx).await;

        let artifact_desc = match artifact {
            Artifact::Image { tag } => format!("image {}", tag),
            Artifact::Static { path } => format!("static bundle {}", path.display()),
        };
        let log = format!(
            "project: {}\nbranch: {}\ncommit: {}\nframework: {}\nartifact: {}\nurl: {}\n",
            request.project,
            request.branch,
            deployment.commit_hash.as_deref().unwrap_or("unknown"),
            detection.framework,
            artifact_desc,
            deploy.url.as_deref().unwrap_or("-"),
        );

        self.complete_step(request, STEP_SUMMARY, &log).await;
    }

    // ── step bookkeeping ────────────────────────────

    async fn begin_step(&self, request: &PipelineRequest, step: &str, ctx: &mut StepContext) {
        let index = ctx.next_index;
        ctx.next_index += 1;
        self.status
            .update_status(
                &request.project,
                StatusUpdate::step(step, index, ctx.total_steps),
            )
            .await;
        self.publish(
            channels::DEPLOYMENTS,
            "step.started",
            &request.deployment_id,
            json!({ "step": step, "index": index, "totalSteps": ctx.total_steps }),
        )
        .await;
    }

    async fn complete_step(&self, request: &PipelineRequest, step: &str, log: &str) {
        self.write_step_log(&request.project, step, log);
        self.status
            .update_status(&request.project, StatusUpdate::log(step, log))
            .await;
        self.publish_step_event(request, step).await;
    }

    async fn publish_step_event(&self, request: &PipelineRequest, step: &str) {
        self.publish(
            channels::DEPLOYMENTS,
            "step.completed",
            &request.deployment_id,
            json!({ "step": step }),
        )
        .await;
    }

    fn step_log_path(&self, project: &str, step: &str) -> PathBuf {
        self.settings.logs_dir(project).join(format!("{}.log", step))
    }

    /// Step log files are read back verbatim by log-retrieval callers; a
    /// write failure degrades observability but never fails the pipeline.
    fn write_step_log(&self, project: &str, step: &str, content: &str) {
        let path = self.step_log_path(project, step);
        if let Err(err) = std::fs::write(&path, content) {
            tracing::warn!(path = %path.display(), error = %err, "failed writing step log");
        }
    }

    fn ensure_not_cancelled(&self, cancel: &CancelToken) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn publish(
        &self,
        channel: &str,
        event_type: &str,
        deployment_id: &str,
        data: serde_json::Value,
    ) {
        let event = DeploymentEvent::new(event_type, deployment_id, data);
        if let Err(err) = self.mq.publish_event(channel, &event).await {
            tracing::debug!(channel = %channel, event = %event_type, error = %err, "event publish failed");
        }
    }

    async fn emit_metrics(&self, request: &PipelineRequest, deployment: &Deployment) {
        let duration_secs = self
            .status
            .get_status(&request.project)
            .await
            .and_then(|status| status.duration_secs);
        self.publish(
            channels::METRICS,
            "pipeline.duration",
            &request.deployment_id,
            json!({
                "project": request.project,
                "status": deployment.status,
                "durationSecs": duration_secs,
            }),
        )
        .await;
    }

    /// Snapshot the final status into the cache so API nodes can answer
    /// polls without reaching into this process.
    async fn cache_status_snapshot(&self, project: &str) {
        if let Some(status) = self.status.get_status(project).await {
            if let Ok(payload) = serde_json::to_string(&status) {
                let key = format!("status:{}", project);
                if let Err(err) = self.cache.set(&key, &payload, Some(STATUS_CACHE_TTL)).await {
                    tracing::debug!(error = %err, "status snapshot cache write failed");
                }
            }
        }
    }
}

/// Default in-container listen port per language family, used when the
/// project config does not pin one.
pub fn default_container_port(language: Language) -> u16 {
    match language {
        Language::Javascript => 3000,
        Language::Python => 8000,
        Language::Rust | Language::Go => 8080,
        Language::Php => 8000,
        Language::Static => 80,
    }
}
