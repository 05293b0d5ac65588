use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::acl::{AccessRight, AclStore, ShareEntry};
use crate::fs::errors::{FsError, FsResult};
use crate::fs::sandbox::{DiskPath, Expect, PathSandbox};
use crate::fs::sensitivity::SensitivityResolver;
use crate::fs::types::{
    to_millis, AttributeSet, FileKind, FileRow, ListRequest, LogicalPath, Page, Principal,
    SortKey, SortOrder,
};
use crate::fs::xattrs::XattrStore;

/// Stat and directory listing. A single `lstat` establishes existence and
/// feeds the kind, size, mode and timestamp columns; the attribute group
/// (identity, created-at, sensitivity) is read only when a requested column
/// needs it; SHARES is one batched query against the ACL store per call.
pub struct AttributeReader {
    sandbox: Arc<PathSandbox>,
    xattrs: Arc<XattrStore>,
    sensitivity: Arc<SensitivityResolver>,
    acl: Arc<dyn AclStore>,
    service: Principal,
}

impl AttributeReader {
    pub fn new(
        sandbox: Arc<PathSandbox>,
        xattrs: Arc<XattrStore>,
        sensitivity: Arc<SensitivityResolver>,
        acl: Arc<dyn AclStore>,
        service: Principal,
    ) -> Self {
        AttributeReader {
            sandbox,
            xattrs,
            sensitivity,
            acl,
            service,
        }
    }

    /// Stats one path. `permission_checked` marks a READ check already
    /// performed by an enclosing call (the listing pass), in which case the
    /// ACL store is not consulted again.
    pub fn stat(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        attrs: AttributeSet,
        permission_checked: bool,
    ) -> FsResult<FileRow> {
        debug!(path = %logical, ?attrs, "stat");
        if !permission_checked {
            self.acl.require(principal, logical, AccessRight::Read)?;
        }
        let shares = if attrs.contains(AttributeSet::SHARES) {
            let mut batch = self.acl.list_shares(std::slice::from_ref(logical))?;
            Some(batch.remove(logical).unwrap_or_default())
        } else {
            None
        };
        self.load_row(principal, logical, attrs, shares)
    }

    /// Stats a batch of paths. SHARES is resolved as one query across the
    /// whole input; a path that vanishes mid-call yields `None` instead of
    /// aborting the batch.
    pub fn stat_many(
        &self,
        principal: &Principal,
        logicals: &[LogicalPath],
        attrs: AttributeSet,
    ) -> FsResult<Vec<Option<FileRow>>> {
        debug!(count = logicals.len(), ?attrs, "stat_many");
        let shares = if attrs.contains(AttributeSet::SHARES) {
            Some(self.acl.list_shares(logicals)?)
        } else {
            None
        };

        let mut rows = Vec::with_capacity(logicals.len());
        for logical in logicals {
            self.acl.require(principal, logical, AccessRight::Read)?;
            let preloaded = shares
                .as_ref()
                .map(|map| map.get(logical).cloned().unwrap_or_default());
            match self.load_row(principal, logical, attrs, preloaded) {
                Ok(row) => rows.push(Some(row)),
                Err(FsError::NotFound) => rows.push(None),
                Err(err) => return Err(err),
            }
        }
        Ok(rows)
    }

    /// Paginated, sorted listing in two passes: the first stats every child
    /// with only the attribute the sort key needs, the second stats just the
    /// requested page window with the full attribute set. Children that
    /// vanish between the passes drop out of the page.
    pub fn list_directory(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        request: &ListRequest,
    ) -> FsResult<Page<FileRow>> {
        debug!(path = %logical, sort = ?request.sort_key, "list_directory");
        self.acl.require(principal, logical, AccessRight::Read)?;
        let disk = self
            .sandbox
            .resolve_logical(principal, logical, Expect::Directory)?;

        let children = self.enumerate(logical, &disk, request.kind_filter)?;

        let pass_one_attrs = AttributeSet::PATH | request.sort_key.required_attributes();
        let mut rows = Vec::with_capacity(children.len());
        for child in &children {
            match self.load_row(principal, child, pass_one_attrs, None) {
                Ok(row) => rows.push(row),
                Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }

        let key = request.sort_key;
        rows.sort_by(|a, b| {
            let ordering = compare_rows(a, b, key);
            match request.sort_order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });

        let total = rows.len() as u64;
        let (page, items_per_page, window): (u32, u32, &[FileRow]) = match request.pagination {
            Some(p) => {
                if p.items_per_page == 0 {
                    return Err(FsError::bad_request("items_per_page must be positive"));
                }
                let start = (p.page as usize).saturating_mul(p.items_per_page as usize);
                let end = start
                    .saturating_add(p.items_per_page as usize)
                    .min(rows.len());
                let window = if start >= rows.len() {
                    &[][..]
                } else {
                    &rows[start..end]
                };
                (p.page, p.items_per_page, window)
            }
            None => (0, total.min(u32::MAX as u64) as u32, &rows[..]),
        };

        let window_paths: Vec<LogicalPath> = window.iter().map(|row| row.path.clone()).collect();
        let shares = if request.attributes.contains(AttributeSet::SHARES) {
            Some(self.acl.list_shares(&window_paths)?)
        } else {
            None
        };

        let mut items = Vec::with_capacity(window_paths.len());
        for path in &window_paths {
            let preloaded = shares
                .as_ref()
                .map(|map| map.get(path).cloned().unwrap_or_default());
            match self.load_row(principal, path, request.attributes, preloaded) {
                Ok(row) => items.push(row),
                Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(Page {
            items,
            items_in_total: total,
            page,
            items_per_page,
        })
    }

    /// Children of a directory, symlinks dropped, filtered by kind.
    fn enumerate(
        &self,
        logical: &LogicalPath,
        disk: &DiskPath,
        kind_filter: Option<FileKind>,
    ) -> FsResult<Vec<LogicalPath>> {
        let mut children = Vec::new();
        for entry in fs::read_dir(disk)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                continue;
            }
            if let Some(filter) = kind_filter {
                let is_dir = file_type.is_dir();
                if (filter == FileKind::Directory) != is_dir {
                    continue;
                }
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(parent = %logical, "skipping child with non-UTF-8 name");
                continue;
            };
            match logical.join(name) {
                Ok(child) => children.push(child),
                Err(_) => {
                    warn!(parent = %logical, name, "skipping child with unmappable name");
                }
            }
        }
        Ok(children)
    }

    /// Populates one row. The caller has already established permission and
    /// resolved SHARES when requested.
    fn load_row(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        attrs: AttributeSet,
        shares: Option<Vec<ShareEntry>>,
    ) -> FsResult<FileRow> {
        let disk = self.sandbox.resolve_logical(principal, logical, Expect::Any)?;
        let mut row = FileRow::new(logical.clone());

        // The lstat doubles as the existence check for attribute sets that
        // need no metadata column.
        let meta = fs::symlink_metadata(&disk)?;
        if meta.file_type().is_symlink() {
            // A link that appeared after resolution; treat as absent.
            return Err(FsError::NotFound);
        }
        let meta = attrs.needs_metadata().then_some(meta);

        if let Some(meta) = &meta {
            if attrs.contains(AttributeSet::KIND) {
                row.kind = Some(if meta.is_dir() {
                    FileKind::Directory
                } else {
                    FileKind::File
                });
            }
            if attrs.contains(AttributeSet::SIZE) {
                row.size = Some(meta.len());
            }
            if attrs.contains(AttributeSet::UNIX_MODE) {
                row.unix_mode = Some(meta.mode() & 0o7777);
            }
            if attrs.contains(AttributeSet::TIMESTAMPS) {
                row.modified_at = Some(to_millis(meta.modified()?));
                row.accessed_at = Some(to_millis(meta.accessed()?));
            }
        }

        if attrs.contains(AttributeSet::INODE) {
            row.inode = match self.xattrs.identity(&disk)? {
                Some(identity) => Some(identity),
                None => meta.as_ref().map(|m| m.ino().to_string()),
            };
        }
        if attrs.contains(AttributeSet::TIMESTAMPS) {
            row.created_at = match self.xattrs.created_at(&disk)? {
                Some(millis) => Some(millis),
                None => row.modified_at,
            };
        }
        if attrs.contains(AttributeSet::OWNER) {
            row.owner = Some(
                logical
                    .home_owner()
                    .map(str::to_string)
                    .unwrap_or_else(|| self.service.name().to_string()),
            );
        }
        if attrs.contains(AttributeSet::SENSITIVITY) {
            row.sensitivity_own = self.sensitivity.own_level(logical)?;
            row.sensitivity_effective = Some(self.sensitivity.effective_level(logical)?);
        }
        if attrs.contains(AttributeSet::SHARES) {
            row.shares = Some(shares.unwrap_or_default());
        }

        Ok(row)
    }
}

fn case_insensitive(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

fn name_of(row: &FileRow) -> &str {
    row.path.file_name().unwrap_or("")
}

fn compare_rows(a: &FileRow, b: &FileRow, key: SortKey) -> Ordering {
    match key {
        SortKey::Path => case_insensitive(a.path.as_str(), b.path.as_str()),
        SortKey::Kind => {
            // Directories sort before files, ties by name.
            let rank = |row: &FileRow| match row.kind {
                Some(FileKind::Directory) => 0,
                _ => 1,
            };
            rank(a)
                .cmp(&rank(b))
                .then_with(|| case_insensitive(name_of(a), name_of(b)))
        }
        SortKey::CreatedAt => a
            .created_at
            .cmp(&b.created_at)
            .then_with(|| case_insensitive(name_of(a), name_of(b))),
        SortKey::ModifiedAt => a
            .modified_at
            .cmp(&b.modified_at)
            .then_with(|| case_insensitive(name_of(a), name_of(b))),
        SortKey::Size => a
            .size
            .cmp(&b.size)
            .then_with(|| case_insensitive(name_of(a), name_of(b))),
        SortKey::Sensitivity => {
            // A node with no own level sorts under the literal "inherit".
            let label = |row: &FileRow| row.sensitivity_own.map(|l| l.as_str()).unwrap_or("inherit");
            case_insensitive(label(a), label(b))
                .then_with(|| case_insensitive(name_of(a), name_of(b)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(path: &str, kind: FileKind, size: u64) -> FileRow {
        let mut row = FileRow::new(LogicalPath::parse(path).unwrap());
        row.kind = Some(kind);
        row.size = Some(size);
        row
    }

    #[test]
    fn test_kind_sort_puts_directories_first() {
        let a = row("/d/beta", FileKind::File, 1);
        let b = row("/d/alpha", FileKind::Directory, 1);
        assert_eq!(compare_rows(&a, &b, SortKey::Kind), Ordering::Greater);
        let c = row("/d/Alpha", FileKind::Directory, 1);
        assert_eq!(compare_rows(&b, &c, SortKey::Kind), Ordering::Equal);
    }

    #[test]
    fn test_size_sort_breaks_ties_by_name() {
        let a = row("/d/b", FileKind::File, 5);
        let b = row("/d/a", FileKind::File, 5);
        assert_eq!(compare_rows(&a, &b, SortKey::Size), Ordering::Greater);
        let c = row("/d/c", FileKind::File, 3);
        assert_eq!(compare_rows(&a, &c, SortKey::Size), Ordering::Greater);
    }

    #[test]
    fn test_sensitivity_sort_uses_inherit_label() {
        let mut a = row("/d/a", FileKind::File, 1);
        a.sensitivity_own = Some(crate::fs::types::SensitivityLevel::Confidential);
        let b = row("/d/b", FileKind::File, 1);
        // "confidential" < "inherit" case-insensitively.
        assert_eq!(compare_rows(&a, &b, SortKey::Sensitivity), Ordering::Less);
    }
}
