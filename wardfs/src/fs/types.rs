use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::acl::ShareEntry;
use crate::fs::errors::{FsError, FsResult};

/// Longest accepted name for a single path component, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// The acting identity behind every operation.
///
/// Users live under `/home/<name>` and are jailed there; service identities
/// see the whole tree and are used for internal resolution (sensitivity
/// inheritance walks) and administrative work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Principal {
    User(String),
    Service(String),
}

impl Principal {
    pub fn user(name: impl Into<String>) -> Self {
        Principal::User(name.into())
    }

    pub fn service(name: impl Into<String>) -> Self {
        Principal::Service(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Principal::User(name) | Principal::Service(name) => name,
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, Principal::Service(_))
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An absolute, normalized path in the caller's logical namespace.
///
/// Construction via [`LogicalPath::parse`] performs all lexical validation:
/// the path must be absolute, `.` and `..` collapse without ever escaping the
/// root, components must not contain newlines and must fit [`MAX_NAME_LEN`].
/// The stored form never has a trailing slash (except the root itself).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LogicalPath(String);

impl LogicalPath {
    pub fn root() -> Self {
        LogicalPath("/".to_string())
    }

    pub fn parse(raw: &str) -> FsResult<Self> {
        if raw.is_empty() {
            return Err(FsError::bad_request("empty path"));
        }
        if !raw.starts_with('/') {
            return Err(FsError::bad_request(format!("path is not absolute: {raw}")));
        }

        let mut parts: Vec<&str> = Vec::new();
        for component in raw.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(FsError::bad_request(format!(
                            "path escapes the filesystem root: {raw}"
                        )));
                    }
                }
                name => {
                    validate_name(name)?;
                    parts.push(name);
                }
            }
        }

        if parts.is_empty() {
            return Ok(Self::root());
        }
        Ok(LogicalPath(format!("/{}", parts.join("/"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|part| !part.is_empty())
    }

    /// `None` only at the root.
    pub fn parent(&self) -> Option<LogicalPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(LogicalPath(self.0[..idx].to_string())),
            None => None,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rfind('/').map(|idx| &self.0[idx + 1..])
    }

    /// Appends one validated component.
    pub fn join(&self, name: &str) -> FsResult<LogicalPath> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(FsError::bad_request(format!("invalid file name: {name}")));
        }
        validate_name(name)?;
        if self.is_root() {
            Ok(LogicalPath(format!("/{name}")))
        } else {
            Ok(LogicalPath(format!("{}/{name}", self.0)))
        }
    }

    /// Component-wise prefix test: `/ab` is not a prefix of `/abc`.
    pub fn starts_with(&self, prefix: &LogicalPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        if !self.0.starts_with(&prefix.0) {
            return false;
        }
        self.0.len() == prefix.0.len() || self.0.as_bytes()[prefix.0.len()] == b'/'
    }

    /// The remainder after `prefix`, without a leading slash. Empty when the
    /// paths are equal, `None` when `prefix` is not a prefix.
    pub fn strip_prefix(&self, prefix: &LogicalPath) -> Option<String> {
        if !self.starts_with(prefix) {
            return None;
        }
        if self.0 == prefix.0 {
            return Some(String::new());
        }
        let offset = if prefix.is_root() { 1 } else { prefix.0.len() + 1 };
        Some(self.0[offset..].to_string())
    }

    /// The `<user>` in `/home/<user>[/...]`, if any.
    pub fn home_owner(&self) -> Option<&str> {
        let mut components = self.components();
        if components.next() != Some("home") {
            return None;
        }
        components.next()
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_name(name: &str) -> FsResult<()> {
    if name.contains('\n') {
        return Err(FsError::bad_request("path component contains a newline"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::bad_request(format!(
            "path component exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::File => "FILE",
            FileKind::Directory => "DIRECTORY",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document classification, inherited from the nearest ancestor that
/// declares one. The implicit default at the root is `Private`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensitivityLevel {
    Private,
    Confidential,
    Sensitive,
}

impl SensitivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensitivityLevel::Private => "PRIVATE",
            SensitivityLevel::Confidential => "CONFIDENTIAL",
            SensitivityLevel::Sensitive => "SENSITIVE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PRIVATE" => Some(SensitivityLevel::Private),
            "CONFIDENTIAL" => Some(SensitivityLevel::Confidential),
            "SENSITIVE" => Some(SensitivityLevel::Sensitive),
            _ => None,
        }
    }
}

impl fmt::Display for SensitivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags::bitflags! {
    /// Which columns of a [`FileRow`] a stat call should populate. Every
    /// flag a caller leaves out saves the syscalls that would feed it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttributeSet: u32 {
        const PATH        = 1 << 0;
        const INODE       = 1 << 1;
        const KIND        = 1 << 2;
        const TIMESTAMPS  = 1 << 3;
        const SIZE        = 1 << 4;
        const UNIX_MODE   = 1 << 5;
        const OWNER       = 1 << 6;
        const SHARES      = 1 << 7;
        const SENSITIVITY = 1 << 8;
    }
}

impl AttributeSet {
    /// The flags served by a single `lstat`.
    pub fn needs_metadata(&self) -> bool {
        self.intersects(
            AttributeSet::INODE
                | AttributeSet::KIND
                | AttributeSet::TIMESTAMPS
                | AttributeSet::SIZE
                | AttributeSet::UNIX_MODE,
        )
    }
}

impl Default for AttributeSet {
    fn default() -> Self {
        AttributeSet::PATH | AttributeSet::KIND
    }
}

/// How a mutation resolves a name collision at its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteConflictPolicy {
    Reject,
    Overwrite,
    Merge,
    Rename,
}

impl Default for WriteConflictPolicy {
    fn default() -> Self {
        WriteConflictPolicy::Rename
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortKey {
    Kind,
    Path,
    CreatedAt,
    ModifiedAt,
    Size,
    Sensitivity,
}

impl SortKey {
    /// The extra attributes the first listing pass must load to sort.
    pub fn required_attributes(&self) -> AttributeSet {
        match self {
            SortKey::Kind => AttributeSet::KIND,
            SortKey::Path => AttributeSet::empty(),
            SortKey::CreatedAt | SortKey::ModifiedAt => AttributeSet::TIMESTAMPS,
            SortKey::Size => AttributeSet::SIZE,
            SortKey::Sensitivity => AttributeSet::SENSITIVITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Zero-based page index.
    pub page: u32,
    pub items_per_page: u32,
}

#[derive(Debug, Clone)]
pub struct ListRequest {
    pub kind_filter: Option<FileKind>,
    pub pagination: Option<Pagination>,
    pub sort_key: SortKey,
    pub sort_order: SortOrder,
    pub attributes: AttributeSet,
}

impl Default for ListRequest {
    fn default() -> Self {
        ListRequest {
            kind_filter: None,
            pagination: None,
            sort_key: SortKey::Path,
            sort_order: SortOrder::Ascending,
            attributes: AttributeSet::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub items_in_total: u64,
    pub page: u32,
    pub items_per_page: u32,
}

/// One stat result. Everything but `path` is populated only when the
/// matching [`AttributeSet`] flag was requested.
#[derive(Debug, Clone, Serialize)]
pub struct FileRow {
    pub path: LogicalPath,
    /// Identity attribute when present, `st_ino` as a fallback.
    pub inode: Option<String>,
    pub kind: Option<FileKind>,
    pub created_at: Option<u64>,
    pub modified_at: Option<u64>,
    pub accessed_at: Option<u64>,
    pub size: Option<u64>,
    pub unix_mode: Option<u32>,
    pub owner: Option<String>,
    pub shares: Option<Vec<ShareEntry>>,
    /// The level declared directly on this node, if any.
    pub sensitivity_own: Option<SensitivityLevel>,
    /// The inherited level that actually applies.
    pub sensitivity_effective: Option<SensitivityLevel>,
}

impl FileRow {
    pub fn new(path: LogicalPath) -> Self {
        FileRow {
            path,
            inode: None,
            kind: None,
            created_at: None,
            modified_at: None,
            accessed_at: None,
            size: None,
            unix_mode: None,
            owner: None,
            shares: None,
            sensitivity_own: None,
            sensitivity_effective: None,
        }
    }
}

/// Milliseconds since the epoch; the timestamp unit used everywhere.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
