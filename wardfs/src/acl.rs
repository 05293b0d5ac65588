use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::fs::errors::{FsError, FsResult};
use crate::fs::types::{LogicalPath, Principal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessRight {
    Read,
    Write,
}

/// One grant visible through the SHARES attribute.
#[derive(Debug, Clone, Serialize)]
pub struct ShareEntry {
    pub grantee: Principal,
    pub rights: Vec<AccessRight>,
}

/// The external permission authority consulted before every operation.
///
/// Implementations may block: callers always run on a dedicated session
/// worker. The service identity is the store's own business to privilege.
pub trait AclStore: Send + Sync {
    /// `Ok(())` when `principal` holds `right` on `path`, otherwise
    /// `FsError::PermissionDenied`.
    fn require(
        &self,
        principal: &Principal,
        path: &LogicalPath,
        right: AccessRight,
    ) -> FsResult<()>;

    /// Grants for a whole batch of paths, resolved in one query. Paths with
    /// no grants map to an empty list or may be absent from the result.
    fn list_shares(
        &self,
        paths: &[LogicalPath],
    ) -> FsResult<HashMap<LogicalPath, Vec<ShareEntry>>>;
}

/// In-memory prefix-grant store for tests and embedders without a real
/// permission backend. Rules: the service identity may do anything, a user
/// owns their `/home/<name>` subtree, everything else needs an explicit
/// grant on a covering prefix.
pub struct MemoryAclStore {
    grants: DashMap<String, Vec<(Principal, Vec<AccessRight>)>>,
}

impl MemoryAclStore {
    pub fn new() -> Self {
        MemoryAclStore {
            grants: DashMap::new(),
        }
    }

    pub fn grant(&self, grantee: &Principal, prefix: &LogicalPath, rights: &[AccessRight]) {
        self.grants
            .entry(prefix.as_str().to_string())
            .or_default()
            .push((grantee.clone(), rights.to_vec()));
    }

    pub fn revoke_all(&self, prefix: &LogicalPath) {
        self.grants.remove(prefix.as_str());
    }

    fn granted(&self, principal: &Principal, path: &LogicalPath, right: AccessRight) -> bool {
        self.grants.iter().any(|entry| {
            let covers = LogicalPath::parse(entry.key())
                .map(|prefix| path.starts_with(&prefix))
                .unwrap_or(false);
            covers
                && entry.value().iter().any(|(grantee, rights)| {
                    grantee == principal && rights.contains(&right)
                })
        })
    }
}

impl Default for MemoryAclStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AclStore for MemoryAclStore {
    fn require(
        &self,
        principal: &Principal,
        path: &LogicalPath,
        right: AccessRight,
    ) -> FsResult<()> {
        if principal.is_service() {
            return Ok(());
        }
        if path.home_owner() == Some(principal.name()) {
            return Ok(());
        }
        if self.granted(principal, path, right) {
            return Ok(());
        }
        Err(FsError::PermissionDenied)
    }

    fn list_shares(
        &self,
        paths: &[LogicalPath],
    ) -> FsResult<HashMap<LogicalPath, Vec<ShareEntry>>> {
        let mut result: HashMap<LogicalPath, Vec<ShareEntry>> = HashMap::new();
        for path in paths {
            let mut entries = Vec::new();
            for grant in self.grants.iter() {
                let covers = LogicalPath::parse(grant.key())
                    .map(|prefix| path.starts_with(&prefix))
                    .unwrap_or(false);
                if !covers {
                    continue;
                }
                for (grantee, rights) in grant.value() {
                    entries.push(ShareEntry {
                        grantee: grantee.clone(),
                        rights: rights.clone(),
                    });
                }
            }
            result.insert(path.clone(), entries);
        }
        Ok(result)
    }
}
