use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::Settings;
use crate::fs::errors::{FsError, FsResult};
use crate::fs::types::{LogicalPath, Principal};

/// An on-disk path under the configured root. Only [`PathSandbox`]
/// manufactures these; everything that touches the disk goes through one.
#[derive(Debug, Clone)]
pub struct DiskPath(PathBuf);

impl DiskPath {
    pub(crate) fn new(path: PathBuf) -> Self {
        DiskPath(path)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub(crate) fn join(&self, name: &str) -> DiskPath {
        DiskPath(self.0.join(name))
    }
}

impl AsRef<Path> for DiskPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// What the caller expects to find at the resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Any,
    Directory,
}

/// Maps logical paths onto the shared on-disk tree and enforces the jail.
///
/// Users resolve against `<root>` but must land under `<root>/home`; the
/// service identity may land anywhere under `<root>`. A symlink found at a
/// resolved leaf is deleted on sight so links are never followed, returned,
/// or listed.
pub struct PathSandbox {
    root: PathBuf,
    home_root: PathBuf,
    max_disk_path_len: usize,
}

impl PathSandbox {
    pub fn new(settings: &Settings) -> FsResult<Self> {
        let root = fs::canonicalize(&settings.root)?;
        let home_root = root.join("home");
        Ok(PathSandbox {
            root,
            home_root,
            max_disk_path_len: settings.max_disk_path_len,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parses and resolves in one step.
    pub fn resolve(
        &self,
        principal: &Principal,
        raw: &str,
        expect: Expect,
    ) -> FsResult<(LogicalPath, DiskPath)> {
        let logical = LogicalPath::parse(raw)?;
        let disk = self.resolve_logical(principal, &logical, expect)?;
        Ok((logical, disk))
    }

    /// Maps an already-normalized logical path onto the disk, enforcing
    /// containment, path-length limits and the no-symlink rule.
    pub fn resolve_logical(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        expect: Expect,
    ) -> FsResult<DiskPath> {
        let disk = if logical.is_root() {
            self.root.clone()
        } else {
            let mut joined = self.root.clone();
            for component in logical.components() {
                joined.push(component);
            }
            joined
        };

        let contained = match principal {
            Principal::User(_) => disk.starts_with(&self.home_root),
            Principal::Service(_) => disk.starts_with(&self.root),
        };
        if !contained {
            debug!(principal = %principal, path = %logical, "path outside the principal's jail");
            return Err(FsError::bad_request(format!(
                "path escapes the principal's root: {logical}"
            )));
        }

        if disk.as_os_str().len() > self.max_disk_path_len {
            return Err(FsError::bad_request(format!(
                "resolved path exceeds {} bytes",
                self.max_disk_path_len
            )));
        }

        match fs::symlink_metadata(&disk) {
            Ok(meta) if meta.file_type().is_symlink() => {
                // Links are hostile in a jailed namespace. Remove and treat
                // the path as absent.
                warn!(path = %logical, "removing symlink found inside the tree");
                fs::remove_file(&disk)?;
            }
            Ok(meta) => {
                if expect == Expect::Directory && !meta.is_dir() {
                    return Err(FsError::bad_request(format!(
                        "not a directory: {logical}"
                    )));
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(DiskPath::new(disk))
    }

    /// The home-directory holder for a logical path, if it lies in a home.
    pub fn logical_owner<'a>(&self, logical: &'a LogicalPath) -> Option<&'a str> {
        logical.home_owner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (PathSandbox, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("home/alice")).unwrap();
        let sandbox = PathSandbox::new(&Settings::new(dir.path())).unwrap();
        (sandbox, dir)
    }

    #[test]
    fn test_user_resolves_inside_home() {
        let (sandbox, dir) = sandbox();
        let alice = Principal::user("alice");
        let (logical, disk) = sandbox
            .resolve(&alice, "/home/alice/doc.txt", Expect::Any)
            .unwrap();
        assert_eq!(logical.as_str(), "/home/alice/doc.txt");
        assert_eq!(
            disk.as_path(),
            fs::canonicalize(dir.path()).unwrap().join("home/alice/doc.txt")
        );
    }

    #[test]
    fn test_user_cannot_leave_home_subtree() {
        let (sandbox, _dir) = sandbox();
        let alice = Principal::user("alice");
        // An escape answers the same kind as a lexically malformed path.
        assert!(matches!(
            sandbox.resolve(&alice, "/etc/passwd", Expect::Any),
            Err(FsError::BadRequest(_))
        ));
        assert!(matches!(
            sandbox.resolve(&alice, "/home/../etc", Expect::Any),
            Err(FsError::BadRequest(_))
        ));
    }

    #[test]
    fn test_lexical_escape_is_rejected_before_any_syscall() {
        let (sandbox, _dir) = sandbox();
        let alice = Principal::user("alice");
        assert!(matches!(
            sandbox.resolve(&alice, "/home/alice/../../../etc", Expect::Any),
            Err(FsError::BadRequest(_))
        ));
        assert!(matches!(
            sandbox.resolve(&alice, "/home/alice/bad\nname", Expect::Any),
            Err(FsError::BadRequest(_))
        ));
    }

    #[test]
    fn test_service_sees_the_whole_tree() {
        let (sandbox, _dir) = sandbox();
        let svc = Principal::service("_service");
        assert!(sandbox.resolve(&svc, "/srv/data", Expect::Any).is_ok());
        assert!(sandbox.resolve(&svc, "/", Expect::Directory).is_ok());
    }

    #[test]
    fn test_symlink_leaf_is_deleted_on_resolve() {
        let (sandbox, dir) = sandbox();
        let link = dir.path().join("home/alice/link");
        std::os::unix::fs::symlink("/etc", &link).unwrap();

        let alice = Principal::user("alice");
        sandbox
            .resolve(&alice, "/home/alice/link", Expect::Any)
            .unwrap();
        assert!(fs::symlink_metadata(&link).is_err());
    }

    #[test]
    fn test_expect_directory_rejects_files() {
        let (sandbox, dir) = sandbox();
        fs::write(dir.path().join("home/alice/file"), b"x").unwrap();

        let alice = Principal::user("alice");
        assert!(matches!(
            sandbox.resolve(&alice, "/home/alice/file", Expect::Directory),
            Err(FsError::BadRequest(_))
        ));
        assert!(sandbox
            .resolve(&alice, "/home/alice", Expect::Directory)
            .is_ok());
        // A missing node satisfies any expectation.
        assert!(sandbox
            .resolve(&alice, "/home/alice/new", Expect::Directory)
            .is_ok());
    }

    #[test]
    fn test_disk_path_length_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("home/alice")).unwrap();
        let mut settings = Settings::new(dir.path());
        settings.max_disk_path_len = 64;
        let sandbox = PathSandbox::new(&settings).unwrap();

        let alice = Principal::user("alice");
        let long = format!("/home/alice/{}", "x".repeat(100));
        assert!(matches!(
            sandbox.resolve(&alice, &long, Expect::Any),
            Err(FsError::BadRequest(_))
        ));
    }
}
