use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error};

use crate::acl::{AccessRight, AclStore};
use crate::events::{EventSink, FileEvent, FileEventKind};
use crate::fs::errors::{FsError, FsResult};
use crate::fs::metrics::FileSystemStats;
use crate::fs::sandbox::{Expect, PathSandbox};
use crate::fs::sensitivity::SensitivityResolver;
use crate::fs::types::{now_millis, FileKind, LogicalPath, Principal};
use crate::fs::xattrs::XattrStore;

/// An open read window. `remaining` is `None` for a read to end of file.
pub struct InputStream {
    file: File,
    logical: LogicalPath,
    remaining: Option<u64>,
}

/// An open write handle. `created` drives the close event kind.
pub struct OutputStream {
    file: File,
    logical: LogicalPath,
    created: bool,
    bytes_written: u64,
}

/// Per-session stream state: at most one input and one output stream.
/// The slots live inside the session worker, which is what scopes the
/// single-slot contract to a session.
#[derive(Default)]
pub struct StreamSlots {
    input: Option<InputStream>,
    output: Option<OutputStream>,
}

impl StreamSlots {
    /// Both sides release when the session worker drops its state.
    pub fn release_all(&mut self) {
        self.input = None;
        self.output = None;
    }
}

/// Opens, feeds and closes the per-session streams. Chunk calls take the
/// stream out of its slot for the syscall and restore it only on success,
/// so a failed transfer can never leak an occupied slot.
pub struct StreamManager {
    sandbox: Arc<PathSandbox>,
    xattrs: Arc<XattrStore>,
    sensitivity: Arc<SensitivityResolver>,
    acl: Arc<dyn AclStore>,
    events: Arc<EventSink>,
    stats: Arc<FileSystemStats>,
    read_buffer_size: usize,
}

impl StreamManager {
    pub fn new(
        sandbox: Arc<PathSandbox>,
        xattrs: Arc<XattrStore>,
        sensitivity: Arc<SensitivityResolver>,
        acl: Arc<dyn AclStore>,
        events: Arc<EventSink>,
        stats: Arc<FileSystemStats>,
        read_buffer_size: usize,
    ) -> Self {
        StreamManager {
            sandbox,
            xattrs,
            sensitivity,
            acl,
            events,
            stats,
            read_buffer_size,
        }
    }

    /// Opens the session's output stream. Acquiring an occupied slot is a
    /// caller contract violation and fatal.
    pub fn open_output(
        &self,
        slots: &mut StreamSlots,
        principal: &Principal,
        logical: &LogicalPath,
        allow_overwrite: bool,
    ) -> FsResult<()> {
        debug!(path = %logical, allow_overwrite, "open output stream");
        if slots.output.is_some() {
            error!(path = %logical, "output stream slot is already held");
            return Err(FsError::critical("output stream slot is already held"));
        }
        if logical.parent().is_none() {
            return Err(FsError::bad_request("cannot write the root"));
        }
        self.acl.require(principal, logical, AccessRight::Write)?;
        let disk = self.sandbox.resolve_logical(principal, logical, Expect::Any)?;

        let (file, created) = if allow_overwrite {
            match OpenOptions::new().write(true).create_new(true).open(&disk) {
                Ok(file) => (file, true),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    // Overwrite keeps the node's identity and created-at.
                    (OpenOptions::new().write(true).truncate(true).open(&disk)?, false)
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            (
                OpenOptions::new().write(true).create_new(true).open(&disk)?,
                true,
            )
        };
        if created {
            self.xattrs.stamp_new_node(&disk, principal, now_millis())?;
        }

        slots.output = Some(OutputStream {
            file,
            logical: logical.clone(),
            created,
            bytes_written: 0,
        });
        Ok(())
    }

    pub fn write_chunk(&self, slots: &mut StreamSlots, data: &Bytes) -> FsResult<()> {
        let mut stream = slots
            .output
            .take()
            .ok_or_else(|| FsError::bad_request("no output stream is open"))?;
        stream.file.write_all(data)?;
        stream.bytes_written += data.len() as u64;
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.stats.write_operations.fetch_add(1, Ordering::Relaxed);
        slots.output = Some(stream);
        Ok(())
    }

    /// Flushes and releases the output slot, returning the bytes written.
    pub fn close_output(&self, slots: &mut StreamSlots, principal: &Principal) -> FsResult<u64> {
        let mut stream = slots
            .output
            .take()
            .ok_or_else(|| FsError::bad_request("no output stream is open"))?;
        stream.file.flush()?;
        debug!(path = %stream.logical, bytes = stream.bytes_written, "close output stream");

        if stream.created {
            self.stats.files_created.fetch_add(1, Ordering::Relaxed);
        }
        self.sensitivity.invalidate(&stream.logical);
        if self.events.has_subscribers() {
            let kind = if stream.created {
                FileEventKind::Created {
                    kind: FileKind::File,
                }
            } else {
                FileEventKind::Modified
            };
            self.events
                .emit(FileEvent::new(kind, stream.logical.clone(), principal.clone()));
        }
        Ok(stream.bytes_written)
    }

    /// Opens the session's input stream, optionally bounded to a byte
    /// range `[start, end)`. The end is clamped to the file length.
    pub fn open_input(
        &self,
        slots: &mut StreamSlots,
        principal: &Principal,
        logical: &LogicalPath,
        range: Option<(u64, u64)>,
    ) -> FsResult<()> {
        debug!(path = %logical, ?range, "open input stream");
        if slots.input.is_some() {
            error!(path = %logical, "input stream slot is already held");
            return Err(FsError::critical("input stream slot is already held"));
        }
        self.acl.require(principal, logical, AccessRight::Read)?;
        let disk = self.sandbox.resolve_logical(principal, logical, Expect::Any)?;

        let mut file = File::open(&disk)?;
        let meta = file.metadata()?;
        if meta.is_dir() {
            return Err(FsError::bad_request(format!("cannot stream a directory: {logical}")));
        }
        let remaining = match range {
            None => None,
            Some((start, end)) => {
                if start > end {
                    return Err(FsError::bad_request("inverted read range"));
                }
                if start > meta.len() {
                    return Err(FsError::bad_request("read range starts past end of file"));
                }
                file.seek(SeekFrom::Start(start))?;
                Some(end.min(meta.len()) - start)
            }
        };

        slots.input = Some(InputStream {
            file,
            logical: logical.clone(),
            remaining,
        });
        Ok(())
    }

    /// Next chunk from the open input stream; an empty buffer marks the end
    /// of the window.
    pub fn read_chunk(&self, slots: &mut StreamSlots, max_len: Option<usize>) -> FsResult<Bytes> {
        let mut stream = slots
            .input
            .take()
            .ok_or_else(|| FsError::bad_request("no input stream is open"))?;
        let cap = max_len.unwrap_or(self.read_buffer_size).max(1);
        let want = match stream.remaining {
            Some(remaining) => remaining.min(cap as u64) as usize,
            None => cap,
        };
        if want == 0 {
            slots.input = Some(stream);
            return Ok(Bytes::new());
        }

        let mut buffer = vec![0u8; want];
        let read = stream.file.read(&mut buffer)?;
        buffer.truncate(read);
        if let Some(remaining) = &mut stream.remaining {
            *remaining -= read as u64;
        }
        self.stats.bytes_read.fetch_add(read as u64, Ordering::Relaxed);
        self.stats.read_operations.fetch_add(1, Ordering::Relaxed);
        slots.input = Some(stream);
        Ok(Bytes::from(buffer))
    }

    /// Releases the input slot. Closing an idle slot is a no-op.
    pub fn close_input(&self, slots: &mut StreamSlots) {
        if let Some(stream) = slots.input.take() {
            debug!(path = %stream.logical, "close input stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::MemoryAclStore;
    use crate::config::Settings;

    fn manager() -> (StreamManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("home/alice")).unwrap();
        let settings = Settings::new(dir.path());
        let sandbox = Arc::new(PathSandbox::new(&settings).unwrap());
        let xattrs = Arc::new(XattrStore::new());
        let acl: Arc<dyn AclStore> = Arc::new(MemoryAclStore::new());
        let events = Arc::new(EventSink::new());
        let stats = Arc::new(FileSystemStats::new());
        let service = Principal::service("_service");
        let sensitivity = Arc::new(SensitivityResolver::new(
            sandbox.clone(),
            xattrs.clone(),
            acl.clone(),
            events.clone(),
            service,
        ));
        let manager = StreamManager::new(
            sandbox,
            xattrs,
            sensitivity,
            acl,
            events,
            stats,
            64 * 1024,
        );
        (manager, dir)
    }

    fn path(raw: &str) -> LogicalPath {
        LogicalPath::parse(raw).unwrap()
    }

    #[test]
    fn test_double_open_is_fatal() {
        let (manager, _dir) = manager();
        let alice = Principal::user("alice");
        let mut slots = StreamSlots::default();

        manager
            .open_output(&mut slots, &alice, &path("/home/alice/a"), false)
            .unwrap();
        let err = manager
            .open_output(&mut slots, &alice, &path("/home/alice/b"), false)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let (manager, _dir) = manager();
        let alice = Principal::user("alice");
        let mut slots = StreamSlots::default();
        let target = path("/home/alice/data.bin");

        manager.open_output(&mut slots, &alice, &target, false).unwrap();
        manager
            .write_chunk(&mut slots, &Bytes::from_static(b"hello world"))
            .unwrap();
        let written = manager.close_output(&mut slots, &alice).unwrap();
        assert_eq!(written, 11);

        manager
            .open_input(&mut slots, &alice, &target, Some((6, 11)))
            .unwrap();
        let chunk = manager.read_chunk(&mut slots, None).unwrap();
        assert_eq!(&chunk[..], b"world");
        let end = manager.read_chunk(&mut slots, None).unwrap();
        assert!(end.is_empty());
        manager.close_input(&mut slots);
    }

    #[test]
    fn test_create_new_rejects_collision_without_overwrite() {
        let (manager, _dir) = manager();
        let alice = Principal::user("alice");
        let mut slots = StreamSlots::default();
        let target = path("/home/alice/once");

        manager.open_output(&mut slots, &alice, &target, false).unwrap();
        manager.close_output(&mut slots, &alice).unwrap();

        let err = manager
            .open_output(&mut slots, &alice, &target, false)
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists));
        // The failed open must not have occupied the slot.
        manager.open_output(&mut slots, &alice, &target, true).unwrap();
        manager.close_output(&mut slots, &alice).unwrap();
    }

    #[test]
    fn test_invalid_ranges_are_rejected() {
        let (manager, dir) = manager();
        std::fs::write(dir.path().join("home/alice/f"), b"abc").unwrap();
        let alice = Principal::user("alice");
        let mut slots = StreamSlots::default();

        assert!(matches!(
            manager.open_input(&mut slots, &alice, &path("/home/alice/f"), Some((5, 2))),
            Err(FsError::BadRequest(_))
        ));
        assert!(matches!(
            manager.open_input(&mut slots, &alice, &path("/home/alice/f"), Some((9, 12))),
            Err(FsError::BadRequest(_))
        ));
        // A clamped end is fine.
        manager
            .open_input(&mut slots, &alice, &path("/home/alice/f"), Some((1, 99)))
            .unwrap();
        let chunk = manager.read_chunk(&mut slots, None).unwrap();
        assert_eq!(&chunk[..], b"bc");
    }

    #[test]
    fn test_close_idle_input_is_a_no_op() {
        let (manager, _dir) = manager();
        let mut slots = StreamSlots::default();
        manager.close_input(&mut slots);
    }
}
