use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// VhostTarget — what a hostname routes to
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VhostTarget {
    /// Serve files straight from disk.
    Static { root: PathBuf },
    /// Proxy to a locally bound container port.
    Upstream { port: u16 },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProxyManager — emits vhost config for the external proxy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Writes one nginx `server { }` block per project into the directory the
/// external reverse proxy watches. Applying and reloading the config is
/// the proxy process's job, not ours.
pub struct ProxyManager {
    vhosts_dir: PathBuf,
}

impl ProxyManager {
    pub fn new(vhosts_dir: PathBuf) -> Self {
        Self { vhosts_dir }
    }

    pub fn vhost_path(&self, project: &str) -> PathBuf {
        self.vhosts_dir.join(format!("{}.conf", project))
    }

    #[tracing::instrument(name = "Write vhost", skip(self, target))]
    pub fn write_vhost(
        &self,
        project: &str,
        hostname: &str,
        target: &VhostTarget,
    ) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.vhosts_dir)?;
        let path = self.vhost_path(project);
        std::fs::write(&path, generate_server_block(hostname, target))?;
        tracing::info!(project = %project, hostname = %hostname, path = %path.display(), "vhost written");
        Ok(path)
    }

    /// Remove a project's vhost. Missing files are fine.
    pub fn remove_vhost(&self, project: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.vhost_path(project)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Generate an nginx `server { }` block routing a hostname to a static
/// directory or an upstream port.
pub fn generate_server_block(hostname: &str, target: &VhostTarget) -> String {
    let mut block = String::new();

    block.push_str("server {\n");
    block.push_str("    listen 80;\n");
    block.push_str(&format!("    server_name {};\n", hostname));
    block.push('\n');

    match target {
        VhostTarget::Static { root } => {
            block.push_str(&format!("    root {};\n", root.display()));
            block.push_str("    index index.html;\n");
            block.push('\n');
            block.push_str("    location / {\n");
            block.push_str("        try_files $uri $uri/ /index.html;\n");
            block.push_str("    }\n");
        }
        VhostTarget::Upstream { port } => {
            block.push_str("    location / {\n");
            block.push_str(&format!("        proxy_pass http://127.0.0.1:{};\n", port));
            block.push_str("        proxy_http_version 1.1;\n");
            block.push_str("        proxy_set_header Host $host;\n");
            block.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
            block.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
            block.push_str("        proxy_set_header Upgrade $http_upgrade;\n");
            block.push_str("        proxy_set_header Connection \"upgrade\";\n");
            block.push_str("    }\n");
        }
    }

    block.push_str("}\n");
    block
}
