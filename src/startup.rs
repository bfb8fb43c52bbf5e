use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::configuration::Settings;
use crate::helpers::command::{cancel_pair, CancelHandle, CommandRunner};
use crate::helpers::{CacheManager, MqManager};
use crate::models::Deployment;
use crate::services::builder::BuilderService;
use crate::services::deployer::DeployerService;
use crate::services::git::GitService;
use crate::services::pipeline::{PipelineRequest, PipelineRunner};
use crate::services::ports::{FilePortAllocator, PortAllocator};
use crate::services::proxy::ProxyManager;
use crate::services::queue::PipelineQueue;
use crate::services::status::StatusStore;

/// Commands the daemon accepts from the bus.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum EngineCommand {
    Deploy(PipelineRequest),
    #[serde(rename_all = "camelCase")]
    Cancel { deployment_id: String },
}

/// The engine's process-wide singletons, constructed once at startup and
/// passed by reference into every pipeline run. Correctness of the shared
/// stores comes from their own locking, not from any single-threaded
/// runtime assumption.
pub struct Engine {
    pub settings: Arc<Settings>,
    pub status: Arc<StatusStore>,
    pub queue: Arc<PipelineQueue>,
    pub mq: Arc<MqManager>,
    pub cache: Arc<CacheManager>,
    pub ports: Arc<dyn PortAllocator>,
    deployer: Arc<DeployerService>,
    cancels: Mutex<HashMap<String, CancelHandle>>,
}

pub fn build_engine(settings: Settings) -> anyhow::Result<Arc<Engine>> {
    let settings = Arc::new(settings);
    let runner = CommandRunner::new(settings.pipeline.max_output_bytes);

    let mq = Arc::new(
        MqManager::try_new(settings.amqp.connection_string())
            .context("building AMQP connection pool")?,
    );
    let cache = Arc::new(
        CacheManager::new(&settings.redis.connection_string())
            .map_err(anyhow::Error::msg)
            .context("building Redis client")?,
    );
    let ports: Arc<dyn PortAllocator> = Arc::new(
        FilePortAllocator::new(
            settings.ports_file.clone(),
            settings.base_port,
            settings.port_range,
        )
        .context("loading port map")?,
    );

    let deployer = Arc::new(DeployerService::new(
        runner.clone(),
        ports.clone(),
        ProxyManager::new(settings.vhosts_dir.clone()),
        settings.build.clone(),
        settings.health.clone(),
        cache.clone(),
    ));

    Ok(Arc::new(Engine {
        status: Arc::new(StatusStore::new()),
        queue: Arc::new(PipelineQueue::new(settings.queue_capacity)),
        mq,
        cache,
        ports,
        deployer,
        cancels: Mutex::new(HashMap::new()),
        settings,
    }))
}

impl Engine {
    /// Assemble a pipeline runner over the shared stores. The per-run
    /// services (git, builder) are stateless and cheap to construct.
    pub fn pipeline_runner(&self) -> PipelineRunner {
        let runner = CommandRunner::new(self.settings.pipeline.max_output_bytes);
        let git = GitService::new(
            self.settings.work_root.clone(),
            runner.clone(),
            Duration::from_secs(self.settings.pipeline.step_timeout),
        );
        let builder = BuilderService::new(
            runner.clone(),
            self.settings.build.clone(),
            Duration::from_secs(self.settings.pipeline.build_timeout),
            self.mq.clone(),
        );

        PipelineRunner::new(
            self.settings.clone(),
            runner,
            git,
            builder,
            self.deployer.clone(),
            self.status.clone(),
            self.queue.clone(),
            self.mq.clone(),
            self.cache.clone(),
        )
    }

    /// Run one deployment with a registered cancellation handle so a
    /// cancel request can kill its in-flight subprocesses.
    pub async fn run_deployment(&self, request: PipelineRequest) -> Deployment {
        let (handle, token) = cancel_pair();
        let deployment_id = request.deployment_id.clone();
        self.cancels
            .lock()
            .await
            .insert(deployment_id.clone(), handle);

        let deployment = self.pipeline_runner().run(request, token).await;

        self.cancels.lock().await.remove(&deployment_id);
        deployment
    }

    /// Fire the cancellation token for an in-flight deployment. Returns
    /// false when the deployment is unknown or already finished.
    pub async fn cancel_deployment(&self, deployment_id: &str) -> bool {
        match self.cancels.lock().await.get(deployment_id) {
            Some(handle) => {
                tracing::info!(deployment_id = %deployment_id, "cancellation requested");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Periodic retention sweep over the status store, driven by the
    /// daemon's scheduler.
    pub async fn sweep_statuses(&self) -> usize {
        self.status
            .cleanup_old_statuses(self.settings.status_retention_hours)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_command_deploy_wire_format() {
        let raw = r#"{
            "action": "deploy",
            "project": "acme-app",
            "deploymentId": "dep-1",
            "repoUrl": "https://github.com/acme/app",
            "branch": "main",
            "hostname": "acme.example.com"
        }"#;
        let command: EngineCommand = serde_json::from_str(raw).unwrap();
        match command {
            EngineCommand::Deploy(request) => {
                assert_eq!(request.project, "acme-app");
                assert_eq!(request.branch, "main");
            }
            other => panic!("expected deploy command, got {:?}", other),
        }
    }

    #[test]
    fn test_engine_command_cancel_wire_format() {
        let raw = r#"{"action": "cancel", "deploymentId": "dep-1"}"#;
        let command: EngineCommand = serde_json::from_str(raw).unwrap();
        assert!(matches!(command, EngineCommand::Cancel { deployment_id } if deployment_id == "dep-1"));
    }
}
