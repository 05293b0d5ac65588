use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::acl::{AccessRight, AclStore};
use crate::events::{EventSink, FileEvent, FileEventKind};
use crate::fs::errors::{FsError, FsResult};
use crate::fs::metrics::FileSystemStats;
use crate::fs::sandbox::{DiskPath, Expect, PathSandbox};
use crate::fs::sensitivity::SensitivityResolver;
use crate::fs::types::{now_millis, FileKind, LogicalPath, Principal, WriteConflictPolicy};
use crate::fs::xattrs::{XattrStore, XATTR_SENSITIVITY};

const MAX_NAME_VARIANTS: u32 = 10_000;

/// All tree mutations. Every operation checks permission before touching
/// the disk, emits one event for the path it was asked to operate on, and
/// bumps the matching counters on success.
pub struct MutationEngine {
    sandbox: Arc<PathSandbox>,
    xattrs: Arc<XattrStore>,
    sensitivity: Arc<SensitivityResolver>,
    acl: Arc<dyn AclStore>,
    events: Arc<EventSink>,
    stats: Arc<FileSystemStats>,
}

impl MutationEngine {
    pub fn new(
        sandbox: Arc<PathSandbox>,
        xattrs: Arc<XattrStore>,
        sensitivity: Arc<SensitivityResolver>,
        acl: Arc<dyn AclStore>,
        events: Arc<EventSink>,
        stats: Arc<FileSystemStats>,
    ) -> Self {
        MutationEngine {
            sandbox,
            xattrs,
            sensitivity,
            acl,
            events,
            stats,
        }
    }

    pub fn mkdir(&self, principal: &Principal, logical: &LogicalPath) -> FsResult<()> {
        debug!(path = %logical, "mkdir");
        let parent = logical
            .parent()
            .ok_or_else(|| FsError::bad_request("cannot create the root"))?;
        self.acl.require(principal, &parent, AccessRight::Write)?;
        let disk = self.sandbox.resolve_logical(principal, logical, Expect::Any)?;

        fs::create_dir(&disk)?;
        self.xattrs.stamp_new_node(&disk, principal, now_millis())?;

        self.stats.directories_created.fetch_add(1, Ordering::Relaxed);
        self.emit(
            principal,
            logical,
            FileEventKind::Created {
                kind: FileKind::Directory,
            },
        );
        Ok(())
    }

    /// Recursive delete. Children are removed before their parent, links
    /// are unlinked without being followed, and both a missing target and
    /// children vanishing mid-walk count as success.
    pub fn remove(&self, principal: &Principal, logical: &LogicalPath) -> FsResult<()> {
        debug!(path = %logical, "remove");
        let parent = logical
            .parent()
            .ok_or_else(|| FsError::bad_request("cannot remove the root"))?;
        self.acl.require(principal, &parent, AccessRight::Write)?;
        self.acl.require(principal, logical, AccessRight::Write)?;
        let disk = self.sandbox.resolve_logical(principal, logical, Expect::Any)?;

        let meta = match fs::symlink_metadata(&disk) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %logical, "remove of a missing path");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
            Ok(meta) => meta,
        };

        if meta.is_dir() && !meta.file_type().is_symlink() {
            remove_tree(disk.as_path())?;
            self.stats.directories_deleted.fetch_add(1, Ordering::Relaxed);
        } else {
            match fs::remove_file(&disk) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            self.stats.files_deleted.fetch_add(1, Ordering::Relaxed);
        }

        self.sensitivity.invalidate_subtree(logical);
        self.emit(principal, logical, FileEventKind::Deleted);
        Ok(())
    }

    /// Copies a node. Directory copies recurse; file copies carry content,
    /// mode and user attributes but mint a fresh identity. Returns the path
    /// actually written, which differs from `to` under the rename policy.
    pub fn copy(
        &self,
        principal: &Principal,
        from: &LogicalPath,
        to: &LogicalPath,
        policy: WriteConflictPolicy,
    ) -> FsResult<LogicalPath> {
        debug!(from = %from, to = %to, ?policy, "copy");
        self.acl.require(principal, from, AccessRight::Read)?;
        self.acl.require(principal, to, AccessRight::Write)?;
        if from == to {
            return Err(FsError::bad_request("source and destination are the same path"));
        }
        let from_disk = self.sandbox.resolve_logical(principal, from, Expect::Any)?;
        let to_disk = self.sandbox.resolve_logical(principal, to, Expect::Any)?;
        let src_meta = fs::symlink_metadata(&from_disk)?;
        if src_meta.is_dir() && to.starts_with(from) {
            return Err(FsError::bad_request("cannot copy a directory into itself"));
        }

        let final_to = match fs::symlink_metadata(&to_disk) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.copy_tree(&from_disk, &to_disk)?;
                to.clone()
            }
            Err(err) => return Err(err.into()),
            Ok(dst_meta) => match policy {
                WriteConflictPolicy::Reject => return Err(FsError::AlreadyExists),
                WriteConflictPolicy::Overwrite => {
                    if !src_meta.is_dir() && !dst_meta.is_dir() {
                        // Truncating copy: the destination keeps its own
                        // identity and created-at.
                        fs::copy(&from_disk, &to_disk)?;
                    } else {
                        remove_node(to_disk.as_path())?;
                        self.copy_tree(&from_disk, &to_disk)?;
                    }
                    to.clone()
                }
                WriteConflictPolicy::Rename => {
                    let (variant, variant_disk) = self.next_free_variant(principal, to)?;
                    self.copy_tree(&from_disk, &variant_disk)?;
                    variant
                }
                WriteConflictPolicy::Merge => {
                    if src_meta.is_dir() && dst_meta.is_dir() {
                        self.merge_copy(&from_disk, &to_disk)?;
                        to.clone()
                    } else if !src_meta.is_dir() && !dst_meta.is_dir() {
                        fs::copy(&from_disk, &to_disk)?;
                        to.clone()
                    } else {
                        return Err(FsError::bad_request(
                            "cannot merge a file with a directory",
                        ));
                    }
                }
            },
        };

        self.sensitivity.invalidate_subtree(&final_to);
        self.stats.entries_copied.fetch_add(1, Ordering::Relaxed);
        self.emit(
            principal,
            &final_to,
            FileEventKind::Copied { from: from.clone() },
        );
        Ok(final_to)
    }

    /// Moves a node with `rename(2)`, which preserves inode, attributes and
    /// timestamps. When the destination exists both sides must be the same
    /// kind; directories only combine under the merge policy. Returns the
    /// path actually written.
    pub fn move_entry(
        &self,
        principal: &Principal,
        from: &LogicalPath,
        to: &LogicalPath,
        policy: WriteConflictPolicy,
    ) -> FsResult<LogicalPath> {
        debug!(from = %from, to = %to, ?policy, "move");
        let from_parent = from
            .parent()
            .ok_or_else(|| FsError::bad_request("cannot move the root"))?;
        self.acl.require(principal, &from_parent, AccessRight::Write)?;
        self.acl.require(principal, to, AccessRight::Write)?;
        if from == to {
            return Err(FsError::bad_request("source and destination are the same path"));
        }
        let from_disk = self.sandbox.resolve_logical(principal, from, Expect::Any)?;
        let to_disk = self.sandbox.resolve_logical(principal, to, Expect::Any)?;
        let src_meta = fs::symlink_metadata(&from_disk)?;
        if src_meta.is_dir() && to.starts_with(from) {
            return Err(FsError::bad_request("cannot move a directory into itself"));
        }

        let final_to = match fs::symlink_metadata(&to_disk) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                fs::rename(&from_disk, &to_disk)?;
                to.clone()
            }
            Err(err) => return Err(err.into()),
            Ok(dst_meta) if dst_meta.file_type().is_symlink() => {
                fs::remove_file(&to_disk)?;
                fs::rename(&from_disk, &to_disk)?;
                to.clone()
            }
            Ok(dst_meta) => {
                if src_meta.is_dir() != dst_meta.is_dir() {
                    return Err(FsError::bad_request(
                        "source and destination kinds differ",
                    ));
                }
                match policy {
                    WriteConflictPolicy::Reject => return Err(FsError::AlreadyExists),
                    WriteConflictPolicy::Rename => {
                        let (variant, variant_disk) = self.next_free_variant(principal, to)?;
                        fs::rename(&from_disk, &variant_disk)?;
                        variant
                    }
                    WriteConflictPolicy::Overwrite => {
                        if src_meta.is_dir() {
                            return Err(FsError::bad_request(
                                "directories do not overwrite; use merge",
                            ));
                        }
                        fs::rename(&from_disk, &to_disk)?;
                        to.clone()
                    }
                    WriteConflictPolicy::Merge => {
                        if src_meta.is_dir() {
                            self.merge_move(&from_disk, &to_disk)?;
                        } else {
                            fs::rename(&from_disk, &to_disk)?;
                        }
                        to.clone()
                    }
                }
            }
        };

        self.sensitivity.invalidate_subtree(from);
        self.sensitivity.invalidate_subtree(&final_to);
        self.stats.entries_moved.fetch_add(1, Ordering::Relaxed);
        self.emit(
            principal,
            &final_to,
            FileEventKind::Moved { from: from.clone() },
        );
        Ok(final_to)
    }

    /// One non-reserved attribute value; absence is `NotFound`.
    pub fn attribute(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        name: &str,
    ) -> FsResult<String> {
        debug!(path = %logical, name, "get attribute");
        self.acl.require(principal, logical, AccessRight::Read)?;
        let qualified = XattrStore::qualify_user_name(name)?;
        let disk = self.sandbox.resolve_logical(principal, logical, Expect::Any)?;
        if qualified == XATTR_SENSITIVITY {
            return self
                .xattrs
                .sensitivity(&disk)?
                .map(|level| level.as_str().to_string())
                .ok_or(FsError::NotFound);
        }
        self.xattrs
            .get_string(&disk, &qualified)?
            .ok_or(FsError::NotFound)
    }

    pub fn attributes(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
    ) -> FsResult<Vec<String>> {
        debug!(path = %logical, "list attributes");
        self.acl.require(principal, logical, AccessRight::Read)?;
        let disk = self.sandbox.resolve_logical(principal, logical, Expect::Any)?;
        if !disk.as_path().exists() {
            return Err(FsError::NotFound);
        }
        self.xattrs.list_user(&disk)
    }

    pub fn set_attribute(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        name: &str,
        value: &str,
    ) -> FsResult<()> {
        debug!(path = %logical, name, "set attribute");
        self.acl.require(principal, logical, AccessRight::Write)?;
        let qualified = XattrStore::qualify_user_name(name)?;
        if qualified == XATTR_SENSITIVITY {
            // Routed through the resolver so the cache stays coherent.
            let level = crate::fs::types::SensitivityLevel::parse(value).ok_or_else(|| {
                FsError::bad_request(format!("unknown sensitivity level: {value}"))
            })?;
            return self.sensitivity.set_level(principal, logical, Some(level));
        }
        let disk = self.sandbox.resolve_logical(principal, logical, Expect::Any)?;
        self.xattrs.set_string(&disk, &qualified, value)
    }

    pub fn remove_attribute(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        name: &str,
    ) -> FsResult<()> {
        debug!(path = %logical, name, "remove attribute");
        self.acl.require(principal, logical, AccessRight::Write)?;
        let qualified = XattrStore::qualify_user_name(name)?;
        if qualified == XATTR_SENSITIVITY {
            return self.sensitivity.set_level(principal, logical, None);
        }
        let disk = self.sandbox.resolve_logical(principal, logical, Expect::Any)?;
        self.xattrs.remove(&disk, &qualified)
    }

    /// First free `name(N)` variant next to `desired`, counter inserted
    /// before the final extension.
    pub(crate) fn next_free_variant(
        &self,
        principal: &Principal,
        desired: &LogicalPath,
    ) -> FsResult<(LogicalPath, DiskPath)> {
        let parent = desired
            .parent()
            .ok_or_else(|| FsError::bad_request("path has no parent"))?;
        let name = desired
            .file_name()
            .ok_or_else(|| FsError::bad_request("path has no name"))?;
        for counter in 1..=MAX_NAME_VARIANTS {
            let candidate = parent.join(&variant_name(name, counter))?;
            let disk = self
                .sandbox
                .resolve_logical(principal, &candidate, Expect::Any)?;
            match fs::symlink_metadata(&disk) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Ok((candidate, disk))
                }
                Err(err) => return Err(err.into()),
                Ok(_) => {}
            }
        }
        Err(FsError::bad_request(format!(
            "no free name variant for {desired}"
        )))
    }

    fn copy_tree(&self, src: &DiskPath, dst: &DiskPath) -> FsResult<()> {
        let meta = fs::symlink_metadata(src)?;
        if meta.file_type().is_symlink() {
            return Ok(());
        }
        if meta.is_dir() {
            fs::create_dir(dst)?;
            fs::set_permissions(dst, meta.permissions())?;
            self.xattrs.stamp_copy(src, dst)?;
            for entry in fs::read_dir(src)? {
                let entry = entry?;
                if entry.file_type()?.is_symlink() {
                    continue;
                }
                let name_os = entry.file_name();
                let Some(name) = name_os.to_str() else {
                    warn!(path = %src.as_path().display(), "skipping child with non-UTF-8 name");
                    continue;
                };
                self.copy_tree(&src.join(name), &dst.join(name))?;
            }
        } else {
            fs::copy(src, dst)?;
            self.xattrs.stamp_copy(src, dst)?;
        }
        Ok(())
    }

    fn merge_copy(&self, src: &DiskPath, dst: &DiskPath) -> FsResult<()> {
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            let name_os = entry.file_name();
            let Some(name) = name_os.to_str() else {
                warn!(path = %src.as_path().display(), "skipping child with non-UTF-8 name");
                continue;
            };
            let child_src = src.join(name);
            let child_dst = dst.join(name);
            match fs::symlink_metadata(&child_dst) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    self.copy_tree(&child_src, &child_dst)?;
                }
                Err(err) => return Err(err.into()),
                Ok(dst_meta) if dst_meta.file_type().is_symlink() => {
                    warn!(path = %child_dst.as_path().display(), "removing symlink in merge target");
                    fs::remove_file(&child_dst)?;
                    self.copy_tree(&child_src, &child_dst)?;
                }
                Ok(dst_meta) => {
                    let src_meta = fs::symlink_metadata(&child_src)?;
                    match (src_meta.is_dir(), dst_meta.is_dir()) {
                        (true, true) => self.merge_copy(&child_src, &child_dst)?,
                        (false, false) => {
                            fs::copy(&child_src, &child_dst)?;
                        }
                        _ => {
                            return Err(FsError::bad_request(
                                "cannot merge a file with a directory",
                            ))
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn merge_move(&self, src: &DiskPath, dst: &DiskPath) -> FsResult<()> {
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            let name_os = entry.file_name();
            let Some(name) = name_os.to_str() else {
                warn!(path = %src.as_path().display(), "skipping child with non-UTF-8 name");
                continue;
            };
            let child_src = src.join(name);
            let child_dst = dst.join(name);
            let src_meta = fs::symlink_metadata(&child_src)?;
            if src_meta.file_type().is_symlink() {
                warn!(path = %child_src.as_path().display(), "dropping symlink during merge");
                fs::remove_file(&child_src)?;
                continue;
            }
            match fs::symlink_metadata(&child_dst) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    fs::rename(&child_src, &child_dst)?;
                }
                Err(err) => return Err(err.into()),
                Ok(dst_meta) if dst_meta.file_type().is_symlink() => {
                    fs::remove_file(&child_dst)?;
                    fs::rename(&child_src, &child_dst)?;
                }
                Ok(dst_meta) => match (src_meta.is_dir(), dst_meta.is_dir()) {
                    (true, true) => self.merge_move(&child_src, &child_dst)?,
                    (false, false) => fs::rename(&child_src, &child_dst)?,
                    _ => {
                        return Err(FsError::bad_request(
                            "cannot merge a file with a directory",
                        ))
                    }
                },
            }
        }
        fs::remove_dir(src)?;
        Ok(())
    }

    fn emit(&self, principal: &Principal, path: &LogicalPath, kind: FileEventKind) {
        if self.events.has_subscribers() {
            self.events
                .emit(FileEvent::new(kind, path.clone(), principal.clone()));
        }
    }
}

/// Children-first recursive delete on an explicit worklist. Links are
/// unlinked, never followed; nodes vanishing mid-walk are not errors.
pub(crate) fn remove_tree(root: &Path) -> FsResult<()> {
    let mut stack: Vec<(PathBuf, bool)> = vec![(root.to_path_buf(), false)];
    while let Some((path, children_done)) = stack.pop() {
        if children_done {
            match fs::remove_dir(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            continue;
        }
        let meta = match fs::symlink_metadata(&path) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
            Ok(meta) => meta,
        };
        if meta.is_dir() && !meta.file_type().is_symlink() {
            stack.push((path.clone(), true));
            match fs::read_dir(&path) {
                Ok(entries) => {
                    for entry in entries {
                        stack.push((entry?.path(), false));
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        } else {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

/// Removes whatever sits at `path`, file or tree; absence is success.
pub(crate) fn remove_node(path: &Path) -> FsResult<()> {
    match fs::symlink_metadata(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
        Ok(meta) if meta.is_dir() && !meta.file_type().is_symlink() => remove_tree(path),
        Ok(_) => match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        },
    }
}

pub(crate) fn variant_name(name: &str, counter: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => format!("{stem}({counter}).{extension}"),
        _ => format!("{name}({counter})"),
    }
}
