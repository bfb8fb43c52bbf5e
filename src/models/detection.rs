use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Javascript,
    Python,
    Rust,
    Go,
    Php,
    Static,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Javascript => write!(f, "javascript"),
            Self::Python => write!(f, "python"),
            Self::Rust => write!(f, "rust"),
            Self::Go => write!(f, "go"),
            Self::Php => write!(f, "php"),
            Self::Static => write!(f, "static"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    NextJs,
    Vite,
    CreateReactApp,
    Node,
    Python,
    Rust,
    Go,
    Php,
    Static,
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NextJs => write!(f, "nextjs"),
            Self::Vite => write!(f, "vite"),
            Self::CreateReactApp => write!(f, "create-react-app"),
            Self::Node => write!(f, "node"),
            Self::Python => write!(f, "python"),
            Self::Rust => write!(f, "rust"),
            Self::Go => write!(f, "go"),
            Self::Php => write!(f, "php"),
            Self::Static => write!(f, "static"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
    Pip,
    Cargo,
    GoMod,
    Composer,
    None,
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Npm => write!(f, "npm"),
            Self::Yarn => write!(f, "yarn"),
            Self::Pnpm => write!(f, "pnpm"),
            Self::Pip => write!(f, "pip"),
            Self::Cargo => write!(f, "cargo"),
            Self::GoMod => write!(f, "go"),
            Self::Composer => write!(f, "composer"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Result of scanning a checked-out tree. Computed once per pipeline run;
/// defaults here lose to explicit per-project configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub language: Language,
    pub framework: Framework,
    pub package_manager: PackageManager,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub output_dir: Option<String>,
    /// May differ from the clone root when a subdirectory holds the manifest.
    pub project_root: PathBuf,
    pub has_dockerfile: bool,
}

impl DetectionResult {
    pub fn fallback(project_root: PathBuf) -> Self {
        Self {
            language: Language::Static,
            framework: Framework::Static,
            package_manager: PackageManager::None,
            install_command: None,
            build_command: None,
            start_command: None,
            output_dir: None,
            project_root,
            has_dockerfile: false,
        }
    }

    /// Static artifacts are served from disk; anything with a process to
    /// start (or its own Dockerfile) is containerized.
    pub fn is_static(&self) -> bool {
        self.start_command.is_none() && !self.has_dockerfile
    }
}

/// Per-project configuration supplied by the registration layer. Every
/// field here overrides the corresponding detected default when present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub root_dir: Option<String>,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub test_command: Option<String>,
    pub output_dir: Option<String>,
    pub container_port: Option<u16>,
    #[serde(default)]
    pub skip_tests: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_is_static() {
        let det = DetectionResult::fallback(PathBuf::from("/work/dep-1"));
        assert!(det.is_static());
        assert_eq!(det.language, Language::Static);
        assert_eq!(det.package_manager, PackageManager::None);
    }

    #[test]
    fn test_start_command_makes_containerized() {
        let mut det = DetectionResult::fallback(PathBuf::from("/work/dep-1"));
        det.start_command = Some("node server.js".to_string());
        assert!(!det.is_static());
    }

    #[test]
    fn test_dockerfile_makes_containerized() {
        let mut det = DetectionResult::fallback(PathBuf::from("/work/dep-1"));
        det.has_dockerfile = true;
        assert!(!det.is_static());
    }

    #[test]
    fn test_framework_serializes_lowercase() {
        let json = serde_json::to_string(&Framework::NextJs).unwrap();
        assert_eq!(json, "\"nextjs\"");
    }
}
