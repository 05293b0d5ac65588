use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::acl::{AccessRight, AclStore};
use crate::events::{EventSink, FileEvent, FileEventKind};
use crate::fs::errors::FsResult;
use crate::fs::sandbox::{Expect, PathSandbox};
use crate::fs::types::{LogicalPath, Principal, SensitivityLevel};
use crate::fs::xattrs::XattrStore;

/// Resolves the sensitivity level that applies to a node: its own declared
/// level when present, otherwise the nearest ancestor's, otherwise
/// `Private`.
///
/// The cache holds own levels only, including the knowledge that a node
/// declares none. Inherited results are never cached, so changing a
/// directory's level is visible to the whole subtree immediately without
/// descendant invalidation. Deletes and moves invalidate by prefix instead.
pub struct SensitivityResolver {
    sandbox: Arc<PathSandbox>,
    xattrs: Arc<XattrStore>,
    acl: Arc<dyn AclStore>,
    events: Arc<EventSink>,
    /// Internal resolution runs as the service identity: the ancestor walk
    /// crosses `/home`, which a user principal cannot resolve.
    service: Principal,
    cache: DashMap<String, Option<SensitivityLevel>>,
}

impl SensitivityResolver {
    pub fn new(
        sandbox: Arc<PathSandbox>,
        xattrs: Arc<XattrStore>,
        acl: Arc<dyn AclStore>,
        events: Arc<EventSink>,
        service: Principal,
    ) -> Self {
        SensitivityResolver {
            sandbox,
            xattrs,
            acl,
            events,
            service,
            cache: DashMap::new(),
        }
    }

    /// The level declared directly on the node, `None` when unset.
    pub fn own_level(&self, logical: &LogicalPath) -> FsResult<Option<SensitivityLevel>> {
        if let Some(hit) = self.cache.get(logical.as_str()) {
            return Ok(*hit);
        }
        let disk = self
            .sandbox
            .resolve_logical(&self.service, logical, Expect::Any)?;
        let level = self.xattrs.sensitivity(&disk)?;
        self.cache.insert(logical.as_str().to_string(), level);
        Ok(level)
    }

    /// Walks the node and its ancestors toward the root; the first declared
    /// level wins.
    pub fn effective_level(&self, logical: &LogicalPath) -> FsResult<SensitivityLevel> {
        let mut cursor = Some(logical.clone());
        while let Some(path) = cursor {
            if let Some(level) = self.own_level(&path)? {
                return Ok(level);
            }
            cursor = path.parent();
        }
        Ok(SensitivityLevel::Private)
    }

    /// Declares or clears the node's own level. Clearing restores
    /// inheritance immediately.
    pub fn set_level(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        level: Option<SensitivityLevel>,
    ) -> FsResult<()> {
        debug!(path = %logical, ?level, "set sensitivity");
        self.acl.require(principal, logical, AccessRight::Write)?;
        let disk = self.sandbox.resolve_logical(principal, logical, Expect::Any)?;
        self.xattrs.set_sensitivity(&disk, level)?;
        self.cache.insert(logical.as_str().to_string(), level);
        if self.events.has_subscribers() {
            self.events.emit(FileEvent::new(
                FileEventKind::SensitivityChanged { level },
                logical.clone(),
                principal.clone(),
            ));
        }
        Ok(())
    }

    pub fn invalidate(&self, logical: &LogicalPath) {
        self.cache.remove(logical.as_str());
    }

    /// Drops cached own-levels for a path and everything beneath it. Called
    /// after deletes and moves, where paths stop naming the nodes they
    /// named before.
    pub fn invalidate_subtree(&self, prefix: &LogicalPath) {
        let prefix_str = prefix.as_str().to_string();
        self.cache.retain(|key, _| !key_has_prefix(key, &prefix_str));
    }
}

fn key_has_prefix(key: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    key == prefix || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefix_matching_is_component_wise() {
        assert!(key_has_prefix("/a/b", "/a"));
        assert!(key_has_prefix("/a", "/a"));
        assert!(!key_has_prefix("/ab", "/a"));
        assert!(key_has_prefix("/anything", "/"));
    }
}
