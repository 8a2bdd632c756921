//! Replication domain configuration

use crate::dn::Dn;
use crate::protocol::{AssuredMode, AssuredRequest};
use crate::types::{GroupId, ReplicaId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Assured replication mode requested for local writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AssuredKind {
    /// Publish and return, never wait
    #[default]
    NotAssured,
    /// Wait until enough servers stored the update
    SafeData,
    /// Wait until the receiving servers replayed the update
    SafeRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssuredConfig {
    pub kind: AssuredKind,

    /// Servers that must hold the update, the writer included
    pub sd_level: u8,

    /// How long a writer waits for the acknowledgement
    pub timeout_ms: u64,
}

impl Default for AssuredConfig {
    fn default() -> Self {
        Self {
            kind: AssuredKind::NotAssured,
            sd_level: 1,
            timeout_ms: 2_000,
        }
    }
}

impl AssuredConfig {
    pub fn safe_data(level: u8, timeout: Duration) -> Self {
        Self {
            kind: AssuredKind::SafeData,
            sd_level: level,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn safe_read(timeout: Duration) -> Self {
        Self {
            kind: AssuredKind::SafeRead,
            timeout_ms: timeout.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Flags to stamp on outgoing updates, `None` when not assured
    pub fn request(&self) -> Option<AssuredRequest> {
        let mode = match self.kind {
            AssuredKind::NotAssured => return None,
            AssuredKind::SafeData => AssuredMode::SafeData,
            AssuredKind::SafeRead => AssuredMode::SafeRead,
        };
        Some(AssuredRequest {
            mode,
            safe_data_level: self.sd_level,
        })
    }
}

/// Configuration of one replicated suffix on one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Root of the replicated subtree
    pub base_dn: Dn,

    pub replica_id: ReplicaId,

    pub group_id: GroupId,

    pub assured: AssuredConfig,

    /// Age after which historical tuples and tombstones may go
    pub purge_delay_ms: u64,

    /// Resolve naming conflicts instead of failing the replay
    pub solve_conflicts: bool,

    /// Number of tasks replaying remote updates
    pub replay_workers: usize,

    /// How long an update may wait for a missing entry
    pub holdback_expiry_ms: u64,

    pub max_holdback: usize,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            base_dn: Dn::root(),
            replica_id: ReplicaId(1),
            group_id: GroupId::default(),
            assured: AssuredConfig::default(),
            purge_delay_ms: 259_200_000, // 3 days
            solve_conflicts: true,
            replay_workers: 1,
            holdback_expiry_ms: 30_000,
            max_holdback: 10_000,
        }
    }
}

impl DomainConfig {
    pub fn new(base_dn: Dn, replica_id: ReplicaId) -> Self {
        Self {
            base_dn,
            replica_id,
            ..Default::default()
        }
    }

    /// Load from a JSON file; absent fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("invalid domain configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_group(mut self, group_id: GroupId) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_assured(mut self, assured: AssuredConfig) -> Self {
        self.assured = assured;
        self
    }

    pub fn with_purge_delay(mut self, delay: Duration) -> Self {
        self.purge_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_solve_conflicts(mut self, enabled: bool) -> Self {
        self.solve_conflicts = enabled;
        self
    }

    pub fn with_replay_workers(mut self, workers: usize) -> Self {
        self.replay_workers = workers;
        self
    }

    pub fn with_holdback(mut self, expiry: Duration, max_held: usize) -> Self {
        self.holdback_expiry_ms = expiry.as_millis() as u64;
        self.max_holdback = max_held;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.base_dn.is_root() {
            return Err(Error::Config("base_dn must not be empty".into()));
        }
        if self.replay_workers == 0 {
            return Err(Error::Config("replay_workers must be at least 1".into()));
        }
        if self.max_holdback == 0 {
            return Err(Error::Config("max_holdback must be at least 1".into()));
        }
        if self.assured.kind != AssuredKind::NotAssured && self.assured.timeout_ms == 0 {
            return Err(Error::Config("assured timeout must be positive".into()));
        }
        if self.assured.kind == AssuredKind::SafeData && self.assured.sd_level == 0 {
            return Err(Error::Config("safe data level must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Dn {
        Dn::parse("dc=example,dc=com").unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = DomainConfig::new(base(), ReplicaId(3));
        assert_eq!(config.assured.kind, AssuredKind::NotAssured);
        assert!(config.solve_conflicts);
        assert!(config.validate().is_ok());
        assert!(DomainConfig::default().validate().is_err());
    }

    #[test]
    fn test_from_json_partial() {
        let config = DomainConfig::from_json_str(
            r#"{
                "base_dn": "dc=example,dc=com",
                "replica_id": 7,
                "group_id": 2,
                "assured": { "kind": "safe-data", "sd_level": 2 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.base_dn, base());
        assert_eq!(config.replica_id, ReplicaId(7));
        assert_eq!(config.group_id, GroupId(2));
        assert_eq!(config.assured.kind, AssuredKind::SafeData);
        assert_eq!(config.assured.timeout_ms, 2_000);
        assert_eq!(config.replay_workers, 1);
    }

    #[test]
    fn test_invalid_json_rejected() {
        let err = DomainConfig::from_json_str(r#"{ "base_dn": "dc=x", "replay_workers": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(DomainConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_assured_request() {
        assert!(AssuredConfig::default().request().is_none());
        let request = AssuredConfig::safe_data(2, Duration::from_secs(5)).request().unwrap();
        assert_eq!(request.mode, AssuredMode::SafeData);
        assert_eq!(request.safe_data_level, 2);
        assert_eq!(AssuredConfig::safe_read(Duration::from_secs(1)).timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domain.json");
        let config = DomainConfig::new(base(), ReplicaId(4)).with_assured(AssuredConfig::safe_read(Duration::from_millis(1500)));
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(DomainConfig::from_json_file(&path).unwrap(), config);
    }
}
