use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use tracing::warn;
use uuid::Uuid;

use crate::fs::errors::{FsError, FsResult};
use crate::fs::sandbox::DiskPath;
use crate::fs::types::{Principal, SensitivityLevel};

/// Reserved attribute names. The generic attribute operations refuse to
/// touch these directly.
pub const XATTR_ID: &str = "user.wardfs.id";
pub const XATTR_CREATED_AT: &str = "user.wardfs.created_at";
pub const XATTR_CREATOR: &str = "user.wardfs.creator";
pub const XATTR_SENSITIVITY: &str = "user.wardfs.sensitivity";

const RESERVED_PREFIX: &str = "user.wardfs.";
const USER_PREFIX: &str = "user.";

/// Typed access to the extended attributes this crate keeps on every node,
/// plus the generic user-namespace attribute surface.
pub struct XattrStore;

impl XattrStore {
    pub fn new() -> Self {
        XattrStore
    }

    fn get_raw(&self, disk: &DiskPath, name: &str) -> FsResult<Option<Vec<u8>>> {
        Ok(xattr::get(disk.as_path(), name)?)
    }

    pub fn get_string(&self, disk: &DiskPath, name: &str) -> FsResult<Option<String>> {
        match self.get_raw(disk, name)? {
            Some(bytes) => match String::from_utf8(bytes) {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    warn!(path = %disk.as_path().display(), name, "ignoring non-UTF-8 attribute value");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn set_string(&self, disk: &DiskPath, name: &str, value: &str) -> FsResult<()> {
        xattr::set(disk.as_path(), name, value.as_bytes())?;
        Ok(())
    }

    /// Removing an attribute that is not set maps ENODATA onto `NotFound`.
    pub fn remove(&self, disk: &DiskPath, name: &str) -> FsResult<()> {
        match xattr::remove(disk.as_path(), name) {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::ENODATA) => Err(FsError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Non-reserved user-namespace attribute names, with the `user.` prefix
    /// stripped for presentation.
    pub fn list_user(&self, disk: &DiskPath) -> FsResult<Vec<String>> {
        let mut names = Vec::new();
        for attr in xattr::list(disk.as_path())? {
            let Some(name) = os_str_to_str(&attr) else {
                continue;
            };
            if name.starts_with(RESERVED_PREFIX) || !name.starts_with(USER_PREFIX) {
                continue;
            }
            names.push(name[USER_PREFIX.len()..].to_string());
        }
        names.sort();
        Ok(names)
    }

    /// Maps a caller-supplied bare name onto the `user.` namespace,
    /// refusing names that would collide with the reserved set.
    pub fn qualify_user_name(name: &str) -> FsResult<String> {
        if name.is_empty() || name.contains('\0') || name.contains('\n') {
            return Err(FsError::bad_request(format!("invalid attribute name: {name}")));
        }
        let qualified = format!("{USER_PREFIX}{name}");
        if qualified.starts_with(RESERVED_PREFIX) && qualified != XATTR_SENSITIVITY {
            return Err(FsError::bad_request(format!("attribute name is reserved: {name}")));
        }
        Ok(qualified)
    }

    pub fn identity(&self, disk: &DiskPath) -> FsResult<Option<String>> {
        self.get_string(disk, XATTR_ID)
    }

    pub fn created_at(&self, disk: &DiskPath) -> FsResult<Option<u64>> {
        Ok(self
            .get_string(disk, XATTR_CREATED_AT)?
            .and_then(|raw| raw.parse::<u64>().ok()))
    }

    pub fn creator(&self, disk: &DiskPath) -> FsResult<Option<String>> {
        self.get_string(disk, XATTR_CREATOR)
    }

    pub fn sensitivity(&self, disk: &DiskPath) -> FsResult<Option<SensitivityLevel>> {
        Ok(self
            .get_string(disk, XATTR_SENSITIVITY)?
            .and_then(|raw| SensitivityLevel::parse(&raw)))
    }

    pub fn set_sensitivity(
        &self,
        disk: &DiskPath,
        level: Option<SensitivityLevel>,
    ) -> FsResult<()> {
        match level {
            Some(level) => self.set_string(disk, XATTR_SENSITIVITY, level.as_str()),
            None => match self.remove(disk, XATTR_SENSITIVITY) {
                // Clearing an absent level is idempotent.
                Err(FsError::NotFound) if disk.as_path().exists() => Ok(()),
                other => other,
            },
        }
    }

    /// Stamps the identity attributes a freshly created node carries.
    pub fn stamp_new_node(
        &self,
        disk: &DiskPath,
        principal: &Principal,
        now: u64,
    ) -> FsResult<()> {
        self.set_string(disk, XATTR_ID, &Uuid::new_v4().to_string())?;
        self.set_string(disk, XATTR_CREATED_AT, &now.to_string())?;
        self.set_string(disk, XATTR_CREATOR, principal.name())?;
        Ok(())
    }

    /// Carries user attributes from `from` onto a copy at `to`, minting a
    /// fresh identity: no two live nodes ever share one.
    pub fn stamp_copy(&self, from: &DiskPath, to: &DiskPath) -> FsResult<()> {
        for attr in xattr::list(from.as_path())? {
            let Some(name) = os_str_to_str(&attr) else {
                continue;
            };
            if !name.starts_with(USER_PREFIX) || name == XATTR_ID {
                continue;
            }
            if let Some(value) = self.get_raw(from, &name)? {
                xattr::set(to.as_path(), OsStr::new(name.as_str()), &value)?;
            }
        }
        self.set_string(to, XATTR_ID, &Uuid::new_v4().to_string())?;
        Ok(())
    }
}

impl Default for XattrStore {
    fn default() -> Self {
        Self::new()
    }
}

fn os_str_to_str(attr: &OsStr) -> Option<String> {
    std::str::from_utf8(attr.as_bytes()).ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file() -> (DiskPath, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("node");
        std::fs::write(&path, b"data").unwrap();
        (DiskPath::new(path), dir)
    }

    #[test]
    fn test_stamp_new_node_sets_all_reserved_attributes() {
        let (disk, _dir) = temp_file();
        let alice = Principal::user("alice");
        XattrStore::new().stamp_new_node(&disk, &alice, 1234).unwrap();

        let store = XattrStore::new();
        assert!(store.identity(&disk).unwrap().is_some());
        assert_eq!(store.created_at(&disk).unwrap(), Some(1234));
        assert_eq!(store.creator(&disk).unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn test_stamp_copy_mints_a_fresh_identity() {
        let dir = tempfile::tempdir().unwrap();
        let from = DiskPath::new(dir.path().join("from"));
        let to = DiskPath::new(dir.path().join("to"));
        std::fs::write(from.as_path(), b"a").unwrap();
        std::fs::write(to.as_path(), b"a").unwrap();

        let store = XattrStore::new();
        store.stamp_new_node(&from, &Principal::user("alice"), 99).unwrap();
        store.set_string(&from, "user.tag", "blue").unwrap();
        store.stamp_copy(&from, &to).unwrap();

        assert_ne!(store.identity(&from).unwrap(), store.identity(&to).unwrap());
        assert_eq!(store.created_at(&to).unwrap(), Some(99));
        assert_eq!(store.get_string(&to, "user.tag").unwrap().as_deref(), Some("blue"));
    }

    #[test]
    fn test_reserved_names_are_shielded() {
        assert!(XattrStore::qualify_user_name("tag").is_ok());
        assert!(matches!(
            XattrStore::qualify_user_name("wardfs.id"),
            Err(FsError::BadRequest(_))
        ));
        assert!(matches!(
            XattrStore::qualify_user_name(""),
            Err(FsError::BadRequest(_))
        ));
        // The sensitivity key is the one reserved name with a public route.
        assert_eq!(
            XattrStore::qualify_user_name("wardfs.sensitivity").unwrap(),
            XATTR_SENSITIVITY
        );
    }

    #[test]
    fn test_list_user_hides_reserved_names() {
        let (disk, _dir) = temp_file();
        let store = XattrStore::new();
        store.stamp_new_node(&disk, &Principal::user("alice"), 1).unwrap();
        store.set_string(&disk, "user.tag", "x").unwrap();
        store.set_string(&disk, "user.note", "y").unwrap();

        assert_eq!(store.list_user(&disk).unwrap(), vec!["note", "tag"]);
    }

    #[test]
    fn test_clearing_absent_sensitivity_is_idempotent() {
        let (disk, _dir) = temp_file();
        let store = XattrStore::new();
        store.set_sensitivity(&disk, None).unwrap();
        store
            .set_sensitivity(&disk, Some(SensitivityLevel::Confidential))
            .unwrap();
        assert_eq!(
            store.sensitivity(&disk).unwrap(),
            Some(SensitivityLevel::Confidential)
        );
        store.set_sensitivity(&disk, None).unwrap();
        assert_eq!(store.sensitivity(&disk).unwrap(), None);
    }
}
