use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// One attempt to build and publish a specific commit of a project
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Deployment {
    pub id: String, // unique identifier, also names the work directory
    pub project: String,
    pub branch: String,
    pub commit_hash: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub status: DeploymentStatus,
    pub log: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Deploying,
    Ready,
    Failed,
    Cancelled,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Building => write!(f, "BUILDING"),
            Self::Deploying => write!(f, "DEPLOYING"),
            Self::Ready => write!(f, "READY"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl DeploymentStatus {
    /// Terminal states admit no further transition except cancellation,
    /// which is handled before the run finalizes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Cancelled)
    }
}

impl Deployment {
    pub fn new(id: String, project: String, branch: String) -> Self {
        Self {
            id,
            project,
            branch,
            commit_hash: None,
            commit_message: None,
            commit_author: None,
            status: DeploymentStatus::Pending,
            log: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_deployment_is_pending() {
        let dep = Deployment::new("dep-1".into(), "acme-app".into(), "main".into());
        assert_eq!(dep.status, DeploymentStatus::Pending);
        assert!(dep.completed_at.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(DeploymentStatus::Ready.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(DeploymentStatus::Cancelled.is_terminal());
        assert!(!DeploymentStatus::Building.is_terminal());
        assert!(!DeploymentStatus::Deploying.is_terminal());
        assert!(!DeploymentStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&DeploymentStatus::Building).unwrap();
        assert_eq!(json, "\"BUILDING\"");
    }
}
