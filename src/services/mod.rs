pub mod builder;
pub mod deployer;
pub mod detector;
pub mod git;
pub mod pipeline;
pub mod ports;
pub mod proxy;
pub mod queue;
pub mod status;

pub use builder::{Artifact, BuildResult, BuilderService};
pub use deployer::{DeployResult, DeployerService};
pub use detector::Detector;
pub use git::{parse_repo_url, CloneResult, GitService, RepoProvider};
pub use pipeline::{PipelineRequest, PipelineRunner};
pub use ports::{FilePortAllocator, InMemoryPortAllocator, PortAllocator};
pub use proxy::{ProxyManager, VhostTarget};
pub use queue::{PipelineQueue, QueuePosition};
pub use status::{PipelineStatus, StatusStore, StatusUpdate};
