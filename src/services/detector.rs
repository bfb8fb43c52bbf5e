use std::path::{Path, PathBuf};

use crate::models::{DetectionResult, Framework, Language, PackageManager, ProjectConfig};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Detection rules — ordered, first match wins
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct DetectionRule {
    name: &'static str,
    matches: fn(&Path) -> bool,
    build: fn(&Path) -> DetectionResult,
}

static RULES: &[DetectionRule] = &[
    DetectionRule {
        name: "node",
        matches: |root| root.join("package.json").exists(),
        build: build_node,
    },
    DetectionRule {
        name: "rust",
        matches: |root| root.join("Cargo.toml").exists(),
        build: build_rust,
    },
    DetectionRule {
        name: "go",
        matches: |root| root.join("go.mod").exists(),
        build: build_go,
    },
    DetectionRule {
        name: "python",
        matches: |root| {
            root.join("requirements.txt").exists() || root.join("pyproject.toml").exists()
        },
        build: build_python,
    },
    DetectionRule {
        name: "php",
        matches: |root| root.join("composer.json").exists(),
        build: build_php,
    },
    DetectionRule {
        name: "static",
        matches: |root| root.join("index.html").exists(),
        build: |root| DetectionResult::fallback(root.to_path_buf()),
    },
];

/// Directories probed for static output, strongest signal first.
const STATIC_DIR_CANDIDATES: &[(&str, &str)] = &[
    ("build", "create-react-app family"),
    ("dist", "vite/webpack family"),
    ("out", "next export family"),
    (".next", "next.js build output"),
    ("public", "plain public assets"),
];

pub struct Detector;

impl Detector {
    /// Inspect a checked-out tree and infer language, framework, package
    /// manager and command defaults. Explicit per-project configuration
    /// overrides anything detected. Never fails: an unrecognized tree is
    /// classified as a generic static project.
    #[tracing::instrument(name = "Detect project", skip(config))]
    pub fn detect_project(root: &Path, config: &ProjectConfig) -> DetectionResult {
        let actual_root = Self::resolve_root(root, config);

        let mut result = RULES
            .iter()
            .find(|rule| (rule.matches)(&actual_root))
            .map(|rule| {
                tracing::info!(rule = rule.name, root = %actual_root.display(), "detection rule matched");
                (rule.build)(&actual_root)
            })
            .unwrap_or_else(|| {
                tracing::info!(root = %actual_root.display(), "no detection rule matched, falling back to static");
                DetectionResult::fallback(actual_root.clone())
            });

        result.has_dockerfile = actual_root.join("Dockerfile").exists();

        // Explicit configuration beats detection.
        if config.install_command.is_some() {
            result.install_command = config.install_command.clone();
        }
        if config.build_command.is_some() {
            result.build_command = config.build_command.clone();
        }
        if config.start_command.is_some() {
            result.start_command = config.start_command.clone();
        }
        if config.output_dir.is_some() {
            result.output_dir = config.output_dir.clone();
        }

        result
    }

    /// The project's actual root may be a subdirectory of the clone when
    /// the registration configures one and it exists.
    fn resolve_root(root: &Path, config: &ProjectConfig) -> PathBuf {
        match &config.root_dir {
            Some(sub) if !sub.is_empty() && sub != "." => {
                let candidate = root.join(sub);
                if candidate.is_dir() {
                    candidate
                } else {
                    tracing::warn!(root_dir = %sub, "configured root directory missing, using clone root");
                    root.to_path_buf()
                }
            }
            _ => root.to_path_buf(),
        }
    }

    /// Resolve the directory holding static output: `build/` > `dist/` >
    /// `out/` > `.next/` > `public/` > project root, first existing wins.
    pub fn resolve_static_dir(root: &Path) -> PathBuf {
        for (dir, rationale) in STATIC_DIR_CANDIDATES {
            let candidate = root.join(dir);
            if candidate.is_dir() {
                tracing::info!(dir = dir, rationale = rationale, "resolved static output directory");
                return candidate;
            }
        }
        tracing::info!(root = %root.display(), "no output directory found, serving project root");
        root.to_path_buf()
    }

    /// If the static directory has no `index.html`, promote the first
    /// `.html` file found (directory listing order). No candidate means the
    /// directory is served as-is.
    pub fn ensure_index_html(dir: &Path) {
        if dir.join("index.html").exists() {
            return;
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "html").unwrap_or(false) {
                tracing::info!(from = %path.display(), "promoting first html file to index.html");
                if let Err(err) = std::fs::rename(&path, dir.join("index.html")) {
                    tracing::warn!(error = %err, "failed to promote index.html");
                }
                return;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-rule defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_node(root: &Path) -> DetectionResult {
    let manifest: serde_json::Value = std::fs::read_to_string(root.join("package.json"))
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or(serde_json::Value::Null);

    let package_manager = if root.join("pnpm-lock.yaml").exists() {
        PackageManager::Pnpm
    } else if root.join("yarn.lock").exists() {
        PackageManager::Yarn
    } else {
        PackageManager::Npm
    };
    let install_command = match package_manager {
        PackageManager::Pnpm => "pnpm install",
        PackageManager::Yarn => "yarn install",
        _ => "npm install",
    };

    let has_dependency = |name: &str| {
        ["dependencies", "devDependencies"]
            .iter()
            .any(|section| manifest[section].get(name).is_some())
    };
    let has_script = |name: &str| manifest["scripts"].get(name).is_some();

    let (framework, build_command, start_command, output_dir) = if has_dependency("next") {
        (
            Framework::NextJs,
            Some("npm run build"),
            Some("npm run start"),
            Some(".next"),
        )
    } else if has_dependency("vite") {
        (Framework::Vite, Some("npm run build"), None, Some("dist"))
    } else if has_dependency("react-scripts") {
        (
            Framework::CreateReactApp,
            Some("npm run build"),
            None,
            Some("build"),
        )
    } else {
        let start = if has_script("start") {
            Some("npm start")
        } else {
            Some("node index.js")
        };
        let build = if has_script("build") {
            Some("npm run build")
        } else {
            None
        };
        (Framework::Node, build, start, None)
    };

    DetectionResult {
        language: Language::Javascript,
        framework,
        package_manager,
        install_command: Some(install_command.to_string()),
        build_command: build_command.map(str::to_string),
        start_command: start_command.map(str::to_string),
        output_dir: output_dir.map(str::to_string),
        project_root: root.to_path_buf(),
        has_dockerfile: false,
    }
}

fn build_rust(root: &Path) -> DetectionResult {
    DetectionResult {
        language: Language::Rust,
        framework: Framework::Rust,
        package_manager: PackageManager::Cargo,
        install_command: None,
        build_command: Some("cargo build --release".to_string()),
        start_command: Some("cargo run --release".to_string()),
        output_dir: None,
        project_root: root.to_path_buf(),
        has_dockerfile: false,
    }
}

fn build_go(root: &Path) -> DetectionResult {
    DetectionResult {
        language: Language::Go,
        framework: Framework::Go,
        package_manager: PackageManager::GoMod,
        install_command: Some("go mod download".to_string()),
        build_command: Some("go build -o app .".to_string()),
        start_command: Some("./app".to_string()),
        output_dir: None,
        project_root: root.to_path_buf(),
        has_dockerfile: false,
    }
}

fn build_python(root: &Path) -> DetectionResult {
    let install = if root.join("requirements.txt").exists() {
        "pip install -r requirements.txt"
    } else {
        "pip install ."
    };
    DetectionResult {
        language: Language::Python,
        framework: Framework::Python,
        package_manager: PackageManager::Pip,
        install_command: Some(install.to_string()),
        build_command: None,
        start_command: Some("python main.py".to_string()),
        output_dir: None,
        project_root: root.to_path_buf(),
        has_dockerfile: false,
    }
}

fn build_php(root: &Path) -> DetectionResult {
    DetectionResult {
        language: Language::Php,
        framework: Framework::Php,
        package_manager: PackageManager::Composer,
        install_command: Some("composer install --no-dev".to_string()),
        build_command: None,
        start_command: Some("php -S 0.0.0.0:8000 -t public".to_string()),
        output_dir: None,
        project_root: root.to_path_buf(),
        has_dockerfile: false,
    }
}
