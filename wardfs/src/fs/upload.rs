use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::GzDecoder;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::acl::{AccessRight, AclStore};
use crate::events::{EventSink, FileEvent, FileEventKind};
use crate::fs::errors::{FsError, FsResult};
use crate::fs::metrics::FileSystemStats;
use crate::fs::mutations::{remove_node, MutationEngine};
use crate::fs::sandbox::{DiskPath, Expect, PathSandbox};
use crate::fs::sensitivity::SensitivityResolver;
use crate::fs::types::{now_millis, FileKind, LogicalPath, Principal, WriteConflictPolicy};
use crate::fs::xattrs::XattrStore;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Streaming extraction of a tar or tar+gzip archive into a target
/// directory, applying the conflict policy entry by entry.
///
/// WRITE on the target directory is checked once up front; the per-entry
/// writes then run with that enclosing check established. Entries stream
/// straight from the archive to disk; nothing is buffered whole.
pub struct BulkExtractor {
    sandbox: Arc<PathSandbox>,
    xattrs: Arc<XattrStore>,
    mutations: Arc<MutationEngine>,
    sensitivity: Arc<SensitivityResolver>,
    acl: Arc<dyn AclStore>,
    events: Arc<EventSink>,
    stats: Arc<FileSystemStats>,
}

impl BulkExtractor {
    pub fn new(
        sandbox: Arc<PathSandbox>,
        xattrs: Arc<XattrStore>,
        mutations: Arc<MutationEngine>,
        sensitivity: Arc<SensitivityResolver>,
        acl: Arc<dyn AclStore>,
        events: Arc<EventSink>,
        stats: Arc<FileSystemStats>,
    ) -> Self {
        BulkExtractor {
            sandbox,
            xattrs,
            mutations,
            sensitivity,
            acl,
            events,
            stats,
        }
    }

    /// Extracts `reader` into `target`. The returned paths are the declined
    /// collision points under the reject policy and the renamed
    /// destinations under the rename policy; empty otherwise.
    pub fn extract<R: Read>(
        &self,
        principal: &Principal,
        target: &LogicalPath,
        policy: WriteConflictPolicy,
        reader: R,
    ) -> FsResult<Vec<LogicalPath>> {
        debug!(target = %target, ?policy, "extract archive");
        self.acl.require(principal, target, AccessRight::Write)?;
        let target_disk = self
            .sandbox
            .resolve_logical(principal, target, Expect::Directory)?;
        // The target must already exist.
        fs::metadata(&target_disk)?;

        let mut buffered = BufReader::new(reader);
        let gzipped = {
            let head = buffered.fill_buf()?;
            head.len() >= GZIP_MAGIC.len() && head[..GZIP_MAGIC.len()] == GZIP_MAGIC
        };

        let mut state = ExtractionState::default();
        let run_result = if gzipped {
            self.run(
                principal,
                target,
                policy,
                tar::Archive::new(GzDecoder::new(buffered)),
                &mut state,
            )
        } else {
            self.run(
                principal,
                target,
                policy,
                tar::Archive::new(buffered),
                &mut state,
            )
        };
        // Written entries stay written even when the stream aborts, so the
        // cache must not serve pre-extraction answers either way.
        self.sensitivity.invalidate_subtree(target);
        run_result?;
        Ok(state.results)
    }

    fn run<R: Read>(
        &self,
        principal: &Principal,
        target: &LogicalPath,
        policy: WriteConflictPolicy,
        mut archive: tar::Archive<R>,
        state: &mut ExtractionState,
    ) -> FsResult<()> {
        for entry in archive.entries()? {
            let mut entry = entry?;
            self.process_entry(principal, target, policy, &mut entry, state)?;
        }
        Ok(())
    }

    fn process_entry<R: Read>(
        &self,
        principal: &Principal,
        target: &LogicalPath,
        policy: WriteConflictPolicy,
        entry: &mut tar::Entry<'_, R>,
        state: &mut ExtractionState,
    ) -> FsResult<()> {
        let entry_type = entry.header().entry_type();
        let rel = entry.path()?.into_owned();
        let logical = entry_logical(target, &rel)?;
        if logical == *target {
            return Ok(());
        }
        let logical = state.remap(&logical)?;
        if state.is_suppressed(&logical) {
            return Ok(());
        }

        match entry_type {
            tar::EntryType::Directory => self.write_directory(principal, &logical, policy, state),
            tar::EntryType::Regular => self.write_file(principal, &logical, policy, entry, state),
            other => {
                warn!(path = %logical, kind = ?other, "skipping unsupported archive entry");
                Ok(())
            }
        }
    }

    fn write_directory(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        policy: WriteConflictPolicy,
        state: &mut ExtractionState,
    ) -> FsResult<()> {
        let disk = self.sandbox.resolve_logical(principal, logical, Expect::Any)?;
        match fs::symlink_metadata(&disk) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.create_fresh_directory(principal, logical, &disk)
            }
            Err(err) => Err(err.into()),
            Ok(meta) if meta.is_dir() => {
                if policy == WriteConflictPolicy::Reject {
                    state.reject(logical.clone());
                }
                // Directories combine under every other policy.
                Ok(())
            }
            Ok(_) => match policy {
                WriteConflictPolicy::Reject => {
                    state.reject(logical.clone());
                    Ok(())
                }
                WriteConflictPolicy::Overwrite => {
                    remove_node(disk.as_path())?;
                    self.create_fresh_directory(principal, logical, &disk)
                }
                WriteConflictPolicy::Merge => Err(FsError::bad_request(
                    "cannot merge a file with a directory",
                )),
                WriteConflictPolicy::Rename => {
                    let (variant, variant_disk) =
                        self.mutations.next_free_variant(principal, logical)?;
                    self.create_fresh_directory(principal, &variant, &variant_disk)?;
                    state.results.push(variant.clone());
                    // Everything beneath the old name lands under the new.
                    state.add_remap(logical.clone(), variant);
                    Ok(())
                }
            },
        }
    }

    fn write_file<R: Read>(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        policy: WriteConflictPolicy,
        entry: &mut tar::Entry<'_, R>,
        state: &mut ExtractionState,
    ) -> FsResult<()> {
        let disk = self.sandbox.resolve_logical(principal, logical, Expect::Any)?;
        match fs::symlink_metadata(&disk) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.create_missing_ancestors(principal, &disk)?;
                self.write_fresh_file(principal, logical, &disk, entry)
            }
            Err(err) => Err(err.into()),
            Ok(meta) if !meta.is_dir() => match policy {
                WriteConflictPolicy::Reject => {
                    state.reject(logical.clone());
                    Ok(())
                }
                WriteConflictPolicy::Overwrite | WriteConflictPolicy::Merge => {
                    self.overwrite_file(principal, logical, &disk, entry)
                }
                WriteConflictPolicy::Rename => {
                    let (variant, variant_disk) =
                        self.mutations.next_free_variant(principal, logical)?;
                    self.write_fresh_file(principal, &variant, &variant_disk, entry)?;
                    state.results.push(variant);
                    Ok(())
                }
            },
            Ok(_) => match policy {
                WriteConflictPolicy::Reject => {
                    state.reject(logical.clone());
                    Ok(())
                }
                WriteConflictPolicy::Overwrite => {
                    remove_node(disk.as_path())?;
                    self.write_fresh_file(principal, logical, &disk, entry)
                }
                WriteConflictPolicy::Merge => Err(FsError::bad_request(
                    "cannot merge a file with a directory",
                )),
                WriteConflictPolicy::Rename => {
                    let (variant, variant_disk) =
                        self.mutations.next_free_variant(principal, logical)?;
                    self.write_fresh_file(principal, &variant, &variant_disk, entry)?;
                    state.results.push(variant);
                    Ok(())
                }
            },
        }
    }

    fn create_fresh_directory(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        disk: &DiskPath,
    ) -> FsResult<()> {
        self.create_missing_ancestors(principal, disk)?;
        fs::create_dir_all(disk)?;
        self.xattrs.stamp_new_node(disk, principal, now_millis())?;
        self.stats.directories_created.fetch_add(1, Ordering::Relaxed);
        self.stats
            .archive_entries_written
            .fetch_add(1, Ordering::Relaxed);
        self.emit(
            principal,
            logical,
            FileEventKind::Created {
                kind: FileKind::Directory,
            },
        );
        Ok(())
    }

    /// Archives do not always carry their directory entries. Parents
    /// synthesized for an orphaned entry get the same birth stamps as
    /// explicitly created directories.
    fn create_missing_ancestors(&self, principal: &Principal, disk: &DiskPath) -> FsResult<()> {
        let mut missing: Vec<PathBuf> = Vec::new();
        let mut cursor = disk.as_path().parent();
        while let Some(dir) = cursor {
            match fs::symlink_metadata(dir) {
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    missing.push(dir.to_path_buf());
                    cursor = dir.parent();
                }
                Err(err) => return Err(err.into()),
            }
        }

        for dir in missing.into_iter().rev() {
            let dir = DiskPath::new(dir);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    self.xattrs.stamp_new_node(&dir, principal, now_millis())?;
                    self.stats.directories_created.fetch_add(1, Ordering::Relaxed);
                }
                // Raced into existence by another session.
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn write_fresh_file<R: Read>(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        disk: &DiskPath,
        entry: &mut tar::Entry<'_, R>,
    ) -> FsResult<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(disk)?;
        let copied = io::copy(entry, &mut file)?;
        drop(file);
        if let Ok(mode) = entry.header().mode() {
            fs::set_permissions(disk, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        self.xattrs.stamp_new_node(disk, principal, now_millis())?;

        self.stats.bytes_written.fetch_add(copied, Ordering::Relaxed);
        self.stats.files_created.fetch_add(1, Ordering::Relaxed);
        self.stats
            .archive_entries_written
            .fetch_add(1, Ordering::Relaxed);
        self.emit(
            principal,
            logical,
            FileEventKind::Created {
                kind: FileKind::File,
            },
        );
        Ok(())
    }

    /// Truncating write onto an existing file: its identity and created-at
    /// survive, only the content changes.
    fn overwrite_file<R: Read>(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        disk: &DiskPath,
        entry: &mut tar::Entry<'_, R>,
    ) -> FsResult<()> {
        let mut file = fs::OpenOptions::new().write(true).truncate(true).open(disk)?;
        let copied = io::copy(entry, &mut file)?;
        self.stats.bytes_written.fetch_add(copied, Ordering::Relaxed);
        self.stats
            .archive_entries_written
            .fetch_add(1, Ordering::Relaxed);
        self.emit(principal, logical, FileEventKind::Modified);
        Ok(())
    }

    fn emit(&self, principal: &Principal, path: &LogicalPath, kind: FileEventKind) {
        if self.events.has_subscribers() {
            self.events
                .emit(FileEvent::new(kind, path.clone(), principal.clone()));
        }
    }
}

/// Conflict bookkeeping for one extraction run.
#[derive(Default)]
struct ExtractionState {
    results: Vec<LogicalPath>,
    suppressed: Vec<LogicalPath>,
    remaps: Vec<(LogicalPath, LogicalPath)>,
}

impl ExtractionState {
    /// Records a declined collision; everything beneath it is skipped
    /// silently from here on.
    fn reject(&mut self, logical: LogicalPath) {
        debug!(path = %logical, "conflict rejected");
        self.results.push(logical.clone());
        self.suppressed.push(logical);
    }

    fn is_suppressed(&self, logical: &LogicalPath) -> bool {
        self.suppressed.iter().any(|root| logical.starts_with(root))
    }

    fn add_remap(&mut self, from: LogicalPath, to: LogicalPath) {
        self.remaps.push((from, to));
    }

    /// Applies the longest matching directory rename to an entry path.
    fn remap(&self, logical: &LogicalPath) -> FsResult<LogicalPath> {
        let best = self
            .remaps
            .iter()
            .filter(|(from, _)| logical.starts_with(from))
            .max_by_key(|(from, _)| from.as_str().len());
        let Some((from, to)) = best else {
            return Ok(logical.clone());
        };
        let Some(rest) = logical.strip_prefix(from) else {
            return Ok(logical.clone());
        };
        if rest.is_empty() {
            return Ok(to.clone());
        }
        let mut rebuilt = to.clone();
        for part in rest.split('/') {
            rebuilt = rebuilt.join(part)?;
        }
        Ok(rebuilt)
    }
}

/// Maps an archive entry name onto the logical namespace, relative to the
/// extraction target. `..`, absolute names and non-UTF-8 names are hostile
/// and abort the stream.
fn entry_logical(target: &LogicalPath, rel: &Path) -> FsResult<LogicalPath> {
    let mut logical = target.clone();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                let Some(part) = part.to_str() else {
                    return Err(FsError::bad_request(
                        "archive entry name is not valid UTF-8",
                    ));
                };
                logical = logical.join(part)?;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FsError::bad_request(
                    "archive entry escapes the target directory",
                ));
            }
        }
    }
    Ok(logical)
}

/// `std::io::Read` over a channel of byte chunks, for feeding an archive
/// from an async producer. Must run on a blocking thread, which is where
/// session workers live.
pub struct ChannelReader {
    receiver: mpsc::UnboundedReceiver<Bytes>,
    current: Bytes,
}

impl ChannelReader {
    pub fn new(receiver: mpsc::UnboundedReceiver<Bytes>) -> Self {
        ChannelReader {
            receiver,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.receiver.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let len = buf.len().min(self.current.len());
        let chunk = self.current.split_to(len);
        buf[..len].copy_from_slice(&chunk);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_names_resolve_relative_to_target() {
        let target = LogicalPath::parse("/home/alice/up").unwrap();
        assert_eq!(
            entry_logical(&target, Path::new("a/b")).unwrap().as_str(),
            "/home/alice/up/a/b"
        );
        assert_eq!(
            entry_logical(&target, Path::new("./a/")).unwrap().as_str(),
            "/home/alice/up/a"
        );
        // A literal environment-variable name is just a file name.
        assert_eq!(
            entry_logical(&target, Path::new("$PWD")).unwrap().as_str(),
            "/home/alice/up/$PWD"
        );
    }

    #[test]
    fn test_hostile_entry_names_are_rejected() {
        let target = LogicalPath::parse("/home/alice/up").unwrap();
        assert!(matches!(
            entry_logical(&target, Path::new("../escape")),
            Err(FsError::BadRequest(_))
        ));
        assert!(matches!(
            entry_logical(&target, Path::new("/etc/passwd")),
            Err(FsError::BadRequest(_))
        ));
        assert!(matches!(
            entry_logical(&target, Path::new("a/../../b")),
            Err(FsError::BadRequest(_))
        ));
    }

    #[test]
    fn test_remap_applies_longest_prefix() {
        let mut state = ExtractionState::default();
        state.add_remap(
            LogicalPath::parse("/t/d").unwrap(),
            LogicalPath::parse("/t/d(1)").unwrap(),
        );
        state.add_remap(
            LogicalPath::parse("/t/d/deep").unwrap(),
            LogicalPath::parse("/t/d(1)/deep(1)").unwrap(),
        );

        let mapped = state
            .remap(&LogicalPath::parse("/t/d/deep/file").unwrap())
            .unwrap();
        assert_eq!(mapped.as_str(), "/t/d(1)/deep(1)/file");
        let mapped = state.remap(&LogicalPath::parse("/t/d/other").unwrap()).unwrap();
        assert_eq!(mapped.as_str(), "/t/d(1)/other");
        let mapped = state.remap(&LogicalPath::parse("/t/x").unwrap()).unwrap();
        assert_eq!(mapped.as_str(), "/t/x");
    }

    #[test]
    fn test_rejection_suppresses_the_subtree() {
        let mut state = ExtractionState::default();
        state.reject(LogicalPath::parse("/t/test").unwrap());
        assert!(state.is_suppressed(&LogicalPath::parse("/t/test").unwrap()));
        assert!(state.is_suppressed(&LogicalPath::parse("/t/test/file").unwrap()));
        assert!(!state.is_suppressed(&LogicalPath::parse("/t/tester").unwrap()));
        assert_eq!(state.results.len(), 1);
    }

    #[test]
    fn test_channel_reader_drains_chunks() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Bytes::from_static(b"hello ")).unwrap();
        tx.send(Bytes::from_static(b"world")).unwrap();
        drop(tx);

        let mut reader = ChannelReader::new(rx);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }
}
