use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::configuration::{BuildSettings, HealthSettings};
use crate::errors::EngineError;
use crate::helpers::command::{CancelToken, CommandRunner};
use crate::helpers::CacheManager;
use crate::services::builder::Artifact;
use crate::services::ports::PortAllocator;
use crate::services::proxy::{ProxyManager, VhostTarget};

/// Timeout for the short docker lifecycle commands (run, stop, rm).
const CONTAINER_CMD_TIMEOUT: Duration = Duration::from_secs(60);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DeployRequest / DeployResult
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DeployRequest<'a> {
    pub project: &'a str,
    pub deployment_id: &'a str,
    pub hostname: &'a str,
    pub artifact: &'a Artifact,
    /// Port the app listens on inside its container.
    pub container_port: u16,
}

/// Per-call outcome record, consumed immediately by the pipeline runner.
#[derive(Debug, Clone)]
pub struct DeployResult {
    pub success: bool,
    pub url: Option<String>,
    pub port: Option<u16>,
    pub container: Option<String>,
    pub error: Option<String>,
}

impl DeployResult {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            url: None,
            port: None,
            container: None,
            error: Some(error),
        }
    }
}

/// The container currently serving a project's hostname.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActiveDeployment {
    deployment_id: String,
    container: String,
    port: u16,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DeployerService
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DeployerService {
    runner: CommandRunner,
    ports: Arc<dyn PortAllocator>,
    proxy: ProxyManager,
    build: BuildSettings,
    health: HealthSettings,
    cache: Arc<CacheManager>,
    http: reqwest::Client,
    active: Mutex<HashMap<String, ActiveDeployment>>,
}

impl DeployerService {
    pub fn new(
        runner: CommandRunner,
        ports: Arc<dyn PortAllocator>,
        proxy: ProxyManager,
        build: BuildSettings,
        health: HealthSettings,
        cache: Arc<CacheManager>,
    ) -> Self {
        Self {
            runner,
            ports,
            proxy,
            build,
            health,
            cache,
            http: reqwest::Client::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an artifact behind the project's hostname. Failures come
    /// back in the result record; the pipeline records them as a FAILED
    /// step.
    #[tracing::instrument(name = "Deploy artifact", skip(self, request, cancel), fields(project = %request.project, deployment_id = %request.deployment_id))]
    pub async fn deploy(&self, request: &DeployRequest<'_>, cancel: CancelToken) -> DeployResult {
        match request.artifact {
            Artifact::Static { path } => self.deploy_static(request, path).await,
            Artifact::Image { tag } => self.deploy_container(request, tag, cancel).await,
        }
    }

    // ── static ──────────────────────────────────────

    async fn deploy_static(&self, request: &DeployRequest<'_>, static_dir: &Path) -> DeployResult {
        self.fix_permissions(static_dir).await;

        let target = VhostTarget::Static {
            root: static_dir.to_path_buf(),
        };
        if let Err(err) = self.proxy.write_vhost(request.project, request.hostname, &target) {
            return DeployResult::failed(format!("writing vhost: {}", err));
        }

        DeployResult {
            success: true,
            url: Some(format!("http://{}", request.hostname)),
            port: None,
            container: None,
            error: None,
        }
    }

    /// Best-effort ownership/permission fixup so the proxy's worker can
    /// read the files. Failures are warnings, never fatal: the deployment
    /// can still serve with default permissions.
    async fn fix_permissions(&self, static_dir: &Path) {
        for command in [
            format!("chown -R www-data:www-data '{}'", static_dir.display()),
            format!("chmod -R a+rX '{}'", static_dir.display()),
        ] {
            if let Err(err) = self
                .runner
                .run(&command, static_dir, CONTAINER_CMD_TIMEOUT, CancelToken::none())
                .await
            {
                let warning = EngineError::Permission(err.to_string());
                tracing::warn!(command = %command, error = %warning, "continuing with default permissions");
            }
        }
    }

    // ── containerized ───────────────────────────────

    async fn deploy_container(
        &self,
        request: &DeployRequest<'_>,
        image_tag: &str,
        cancel: CancelToken,
    ) -> DeployResult {
        let owner = port_owner(request.project, request.deployment_id);
        let port = match self.ports.reserve(&owner).await {
            Ok(port) => port,
            Err(err) => return DeployResult::failed(err.to_string()),
        };

        let container = container_name(request.project, request.deployment_id);

        // A retry of the same deployment id may have left a half-started
        // container behind; clear it before running again.
        self.remove_container(&container).await;

        let run_command = self.docker_run_command(&container, image_tag, port, request.container_port);
        if let Err(err) = self
            .runner
            .run(&run_command, Path::new("/"), CONTAINER_CMD_TIMEOUT, cancel.clone())
            .await
        {
            let _ = self.ports.release(&owner).await;
            let detail = if err.stderr.trim().is_empty() {
                err.to_string()
            } else {
                format!("{}: {}", err, err.stderr.trim())
            };
            return DeployResult::failed(format!("starting container: {}", detail));
        }

        if let Err(err) = self.wait_healthy(port, &cancel).await {
            // The new container never became healthy: tear it down and let
            // the previous deployment keep serving.
            self.remove_container(&container).await;
            let _ = self.ports.release(&owner).await;
            return DeployResult::failed(err.to_string());
        }

        let target = VhostTarget::Upstream { port };
        if let Err(err) = self.proxy.write_vhost(request.project, request.hostname, &target) {
            self.remove_container(&container).await;
            let _ = self.ports.release(&owner).await;
            return DeployResult::failed(format!("writing vhost: {}", err));
        }

        // New container is healthy and routed; only now retire the old one.
        self.retire_previous(request.project, &container).await;

        let active = ActiveDeployment {
            deployment_id: request.deployment_id.to_string(),
            container: container.clone(),
            port,
        };
        self.remember_active(request.project, active).await;

        DeployResult {
            success: true,
            url: Some(format!("http://{}", request.hostname)),
            port: Some(port),
            container: Some(container),
            error: None,
        }
    }

    fn docker_run_command(
        &self,
        container: &str,
        image_tag: &str,
        host_port: u16,
        container_port: u16,
    ) -> String {
        format!(
            "docker run -d --name {name} --restart unless-stopped --memory {mem} --memory-swap {mem} --cpus {cpus} -p {host}:{inner} {tag}",
            name = container,
            mem = self.build.memory_limit,
            cpus = self.build.cpus,
            host = host_port,
            inner = container_port,
            tag = image_tag,
        )
    }

    /// Poll the health endpoint until it answers 2xx or the attempt bound
    /// is reached.
    pub async fn wait_healthy(&self, port: u16, cancel: &CancelToken) -> Result<(), EngineError> {
        let url = format!("http://127.0.0.1:{}{}", port, self.health.path);

        for attempt in 1..=self.health.max_attempts {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let response = self
                .http
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(port = port, attempt = attempt, "health check passed");
                    return Ok(());
                }
                Ok(resp) => {
                    tracing::debug!(port = port, attempt = attempt, status = %resp.status(), "health check not ready")
                }
                Err(err) => {
                    tracing::debug!(port = port, attempt = attempt, error = %err, "health check unreachable")
                }
            }

            tokio::time::sleep(Duration::from_secs(self.health.interval_secs)).await;
        }

        Err(EngineError::HealthCheckTimeout {
            port,
            attempts: self.health.max_attempts,
        })
    }

    async fn retire_previous(&self, project: &str, new_container: &str) {
        let previous = self.active.lock().await.get(project).cloned();
        if let Some(previous) = previous {
            if previous.container == new_container {
                return;
            }
            tracing::info!(project = %project, container = %previous.container, "retiring previous deployment");
            self.remove_container(&previous.container).await;
            let _ = self
                .ports
                .release(&port_owner(project, &previous.deployment_id))
                .await;
        }
    }

    async fn remember_active(&self, project: &str, active: ActiveDeployment) {
        if let Ok(payload) = serde_json::to_string(&active) {
            let key = format!("deploy:{}:current", project);
            if let Err(err) = self.cache.set(&key, &payload, None).await {
                tracing::debug!(error = %err, "failed to mirror active deployment to cache");
            }
        }
        self.active.lock().await.insert(project.to_string(), active);
    }

    /// `docker rm -f`; forgiving, the container may not exist.
    async fn remove_container(&self, container: &str) {
        let command = format!("docker rm -f {}", container);
        if let Err(err) = self
            .runner
            .run(&command, Path::new("/"), CONTAINER_CMD_TIMEOUT, CancelToken::none())
            .await
        {
            tracing::debug!(container = %container, error = %err, "container removal skipped");
        }
    }
}

fn port_owner(project: &str, deployment_id: &str) -> String {
    format!("{}/{}", project, deployment_id)
}

fn container_name(project: &str, deployment_id: &str) -> String {
    format!("slipway-{}-{}", project, deployment_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ports::InMemoryPortAllocator;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn deployer(vhosts: &Path, health: HealthSettings) -> DeployerService {
        DeployerService::new(
            CommandRunner::new(64 * 1024),
            Arc::new(InMemoryPortAllocator::new(10000, 100)),
            ProxyManager::new(vhosts.to_path_buf()),
            BuildSettings {
                memory_limit: "512m".to_string(),
                cpus: 1.0,
            },
            health,
            Arc::new(CacheManager::new("redis://127.0.0.1:6379/").unwrap()),
        )
    }

    fn quick_health() -> HealthSettings {
        HealthSettings {
            path: "/health".to_string(),
            interval_secs: 0,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_static_deploy_writes_vhost() {
        let vhosts = tempfile::tempdir().unwrap();
        let site = tempfile::tempdir().unwrap();
        std::fs::write(site.path().join("index.html"), "<html/>").unwrap();

        let deployer = deployer(vhosts.path(), quick_health());
        let artifact = Artifact::Static {
            path: site.path().to_path_buf(),
        };
        let request = DeployRequest {
            project: "acme-app",
            deployment_id: "dep-1",
            hostname: "acme.example.com",
            artifact: &artifact,
            container_port: 3000,
        };

        let result = deployer.deploy(&request, CancelToken::none()).await;
        assert!(result.success, "static deploy failed: {:?}", result.error);
        assert_eq!(result.url.as_deref(), Some("http://acme.example.com"));

        let conf = std::fs::read_to_string(vhosts.path().join("acme-app.conf")).unwrap();
        assert!(conf.contains("acme.example.com"));
        assert!(conf.contains(&site.path().display().to_string()));
    }

    #[tokio::test]
    async fn test_health_check_passes_against_live_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let vhosts = tempfile::tempdir().unwrap();
        let deployer = deployer(vhosts.path(), quick_health());
        let port = server.address().port();

        let result = deployer.wait_healthy(port, &CancelToken::none()).await;
        assert!(result.is_ok(), "expected healthy: {:?}", result.err());
    }

    #[tokio::test]
    async fn test_health_check_times_out_with_bounded_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let vhosts = tempfile::tempdir().unwrap();
        let deployer = deployer(vhosts.path(), quick_health());
        let port = server.address().port();

        let err = deployer
            .wait_healthy(port, &CancelToken::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::HealthCheckTimeout { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_health_check_aborts_on_cancellation() {
        let vhosts = tempfile::tempdir().unwrap();
        let deployer = deployer(vhosts.path(), quick_health());

        let (handle, token) = crate::helpers::command::cancel_pair();
        handle.cancel();
        let err = deployer.wait_healthy(1, &token).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn test_docker_run_command_binds_port_and_caps() {
        let vhosts = tempfile::tempdir().unwrap();
        let deployer = deployer(vhosts.path(), quick_health());
        let cmd = deployer.docker_run_command("slipway-acme-dep-1", "slipway/acme:dep-1", 10000, 3000);
        assert!(cmd.contains("--name slipway-acme-dep-1"));
        assert!(cmd.contains("-p 10000:3000"));
        assert!(cmd.contains("--memory 512m"));
        assert!(cmd.contains("--cpus 1"));
        assert!(cmd.contains("slipway/acme:dep-1"));
    }

    #[test]
    fn test_port_owner_and_container_name() {
        assert_eq!(port_owner("acme", "dep-1"), "acme/dep-1");
        assert_eq!(container_name("acme", "dep-1"), "slipway-acme-dep-1");
    }
}
