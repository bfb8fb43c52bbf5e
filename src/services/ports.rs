use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::EngineError;

/// Reservation registry for container host ports. The deployer treats this
/// as the source of truth: a port is free iff no owner holds it here.
///
/// Owners are strings (`project/deployment-id` during a rollout), so a
/// replacement deployment can hold its own port while the previous one is
/// still serving.
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Reserve a port for `owner`: the existing reservation if one is held,
    /// otherwise the first free port at-or-above the base offset.
    async fn reserve(&self, owner: &str) -> Result<u16, EngineError>;
    /// Release `owner`'s reservation. Releasing a missing owner is a no-op.
    async fn release(&self, owner: &str) -> Result<(), EngineError>;
    async fn lookup(&self, owner: &str) -> Option<u16>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FilePortAllocator — persisted owner -> port map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// File-backed allocator. The map is guarded by a mutex and rewritten
/// through a temp-file rename so concurrent writers cannot corrupt it.
pub struct FilePortAllocator {
    path: PathBuf,
    base_port: u16,
    limit: u16,
    state: Mutex<HashMap<String, u16>>,
}

impl FilePortAllocator {
    pub fn new(path: PathBuf, base_port: u16, port_range: u16) -> Result<Self, EngineError> {
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), error = %err, "port map unreadable, starting empty");
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            base_port,
            limit: base_port.saturating_add(port_range),
            state: Mutex::new(state),
        })
    }

    fn persist(&self, map: &HashMap<String, u16>) -> Result<(), EngineError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)?;

        let raw = serde_json::to_string_pretty(map)
            .map_err(|err| EngineError::Deploy(format!("serializing port map: {}", err)))?;

        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        std::fs::write(tmp.path(), raw)?;
        tmp.persist(&self.path)
            .map_err(|err| EngineError::Io(err.error))?;
        Ok(())
    }

    fn first_free(&self, map: &HashMap<String, u16>) -> Result<u16, EngineError> {
        let mut port = self.base_port;
        while port < self.limit {
            if !map.values().any(|&held| held == port) {
                return Ok(port);
            }
            port += 1;
        }
        Err(EngineError::PortExhaustion {
            base: self.base_port,
            limit: self.limit,
        })
    }
}

#[async_trait]
impl PortAllocator for FilePortAllocator {
    async fn reserve(&self, owner: &str) -> Result<u16, EngineError> {
        let mut map = self.state.lock().await;
        if let Some(&port) = map.get(owner) {
            return Ok(port);
        }

        let port = self.first_free(&map)?;
        map.insert(owner.to_string(), port);
        self.persist(&map)?;
        tracing::info!(owner = %owner, port = port, "reserved port");
        Ok(port)
    }

    async fn release(&self, owner: &str) -> Result<(), EngineError> {
        let mut map = self.state.lock().await;
        if map.remove(owner).is_some() {
            self.persist(&map)?;
            tracing::info!(owner = %owner, "released port");
        }
        Ok(())
    }

    async fn lookup(&self, owner: &str) -> Option<u16> {
        self.state.lock().await.get(owner).copied()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// InMemoryPortAllocator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Non-persisted allocator with the same semantics, for tests and
/// ephemeral setups.
pub struct InMemoryPortAllocator {
    base_port: u16,
    limit: u16,
    state: Mutex<HashMap<String, u16>>,
}

impl InMemoryPortAllocator {
    pub fn new(base_port: u16, port_range: u16) -> Self {
        Self {
            base_port,
            limit: base_port.saturating_add(port_range),
            state: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PortAllocator for InMemoryPortAllocator {
    async fn reserve(&self, owner: &str) -> Result<u16, EngineError> {
        let mut map = self.state.lock().await;
        if let Some(&port) = map.get(owner) {
            return Ok(port);
        }
        let mut port = self.base_port;
        while port < self.limit {
            if !map.values().any(|&held| held == port) {
                map.insert(owner.to_string(), port);
                return Ok(port);
            }
            port += 1;
        }
        Err(EngineError::PortExhaustion {
            base: self.base_port,
            limit: self.limit,
        })
    }

    async fn release(&self, owner: &str) -> Result<(), EngineError> {
        self.state.lock().await.remove(owner);
        Ok(())
    }

    async fn lookup(&self, owner: &str) -> Option<u16> {
        self.state.lock().await.get(owner).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_allocator(dir: &std::path::Path, range: u16) -> FilePortAllocator {
        FilePortAllocator::new(dir.join("ports.json"), 10000, range).unwrap()
    }

    #[tokio::test]
    async fn test_reserve_starts_at_base() {
        let dir = tempfile::tempdir().unwrap();
        let ports = file_allocator(dir.path(), 100);
        assert_eq!(ports.reserve("a").await.unwrap(), 10000);
        assert_eq!(ports.reserve("b").await.unwrap(), 10001);
    }

    #[tokio::test]
    async fn test_reserve_is_stable_per_owner() {
        let dir = tempfile::tempdir().unwrap();
        let ports = file_allocator(dir.path(), 100);
        let first = ports.reserve("a").await.unwrap();
        let second = ports.reserve("a").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_release_frees_port_for_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let ports = file_allocator(dir.path(), 100);
        ports.reserve("a").await.unwrap();
        ports.reserve("b").await.unwrap();
        ports.release("a").await.unwrap();
        assert_eq!(ports.lookup("a").await, None);
        assert_eq!(ports.reserve("c").await.unwrap(), 10000);
    }

    #[tokio::test]
    async fn test_exhaustion_is_structured_error() {
        let dir = tempfile::tempdir().unwrap();
        let ports = file_allocator(dir.path(), 2);
        ports.reserve("a").await.unwrap();
        ports.reserve("b").await.unwrap();
        let err = ports.reserve("c").await.unwrap_err();
        assert!(matches!(err, EngineError::PortExhaustion { .. }));
    }

    #[tokio::test]
    async fn test_reservations_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ports = file_allocator(dir.path(), 100);
            ports.reserve("a").await.unwrap();
            ports.reserve("b").await.unwrap();
        }
        let reloaded = file_allocator(dir.path(), 100);
        assert_eq!(reloaded.lookup("a").await, Some(10000));
        assert_eq!(reloaded.lookup("b").await, Some(10001));
        assert_eq!(reloaded.reserve("c").await.unwrap(), 10002);
    }

    #[tokio::test]
    async fn test_port_map_file_is_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let ports = file_allocator(dir.path(), 100);
        ports.reserve("a").await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join("ports.json")).unwrap();
        let parsed: HashMap<String, u16> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.get("a"), Some(&10000));
    }

    #[tokio::test]
    async fn test_in_memory_allocator_same_semantics() {
        let ports = InMemoryPortAllocator::new(9000, 2);
        assert_eq!(ports.reserve("a").await.unwrap(), 9000);
        assert_eq!(ports.reserve("b").await.unwrap(), 9001);
        assert!(ports.reserve("c").await.is_err());
        ports.release("a").await.unwrap();
        assert_eq!(ports.reserve("c").await.unwrap(), 9000);
    }
}
