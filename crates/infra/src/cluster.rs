//! Cluster membership, as consumed by fan-out.
//!
//! Membership itself is maintained elsewhere; this module only defines the narrow
//! "list current members" boundary plus a static implementation.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use clustercmd_core::MemberId;

/// One live process in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDescriptor {
    pub id: MemberId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl MemberDescriptor {
    pub fn new(id: MemberId) -> Self {
        Self {
            id,
            host: None,
            pid: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cluster registry unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    /// Current members, in a stable order.
    async fn list_members(&self) -> Result<Vec<MemberDescriptor>, RegistryError>;
}

#[async_trait]
impl<R> ClusterRegistry for Arc<R>
where
    R: ClusterRegistry + ?Sized,
{
    async fn list_members(&self) -> Result<Vec<MemberDescriptor>, RegistryError> {
        (**self).list_members().await
    }
}

/// Fixed member list, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticClusterRegistry {
    members: RwLock<Vec<MemberDescriptor>>,
}

impl StaticClusterRegistry {
    pub fn new(members: Vec<MemberDescriptor>) -> Self {
        Self {
            members: RwLock::new(members),
        }
    }

    /// Registry listing the given ids, in order.
    pub fn from_ids(ids: impl IntoIterator<Item = MemberId>) -> Self {
        Self::new(ids.into_iter().map(MemberDescriptor::new).collect())
    }

    /// Parse a comma-separated id list such as `CLUSTER_MEMBERS`. Blank entries are skipped.
    pub fn parse_ids(raw: &str) -> Result<Vec<MemberId>, clustercmd_core::CoreError> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(MemberId::new)
            .collect()
    }

    pub fn set_members(&self, members: Vec<MemberDescriptor>) {
        if let Ok(mut guard) = self.members.write() {
            *guard = members;
        }
    }
}

#[async_trait]
impl ClusterRegistry for StaticClusterRegistry {
    async fn list_members(&self) -> Result<Vec<MemberDescriptor>, RegistryError> {
        self.members
            .read()
            .map(|m| m.clone())
            .map_err(|_| RegistryError::Unavailable("lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ids_skips_blanks() {
        let ids = StaticClusterRegistry::parse_ids(" m1, ,m2 ,").unwrap();
        let keys: Vec<&str> = ids.iter().map(MemberId::as_str).collect();
        assert_eq!(keys, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn lists_members_in_order_and_can_be_replaced() {
        let registry = StaticClusterRegistry::from_ids([
            MemberId::new("m1").unwrap(),
            MemberId::new("m2").unwrap(),
        ]);
        let listed = registry.list_members().await.unwrap();
        assert_eq!(listed[0].id.as_str(), "m1");
        assert_eq!(listed[1].id.as_str(), "m2");

        registry.set_members(vec![MemberDescriptor::new(MemberId::new("m3").unwrap()).with_pid(7)]);
        let listed = registry.list_members().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].pid, Some(7));
    }
}
