//! Multi-tenant, permission-checked virtual filesystem over a real POSIX
//! directory tree.
//!
//! Every caller is a [`Principal`](fs::types::Principal) whose paths are
//! normalized, jailed under the configured root and checked against an
//! [`AclStore`](acl::AclStore) before any syscall. Node identity, creation
//! time and sensitivity live in `user.*` extended attributes, so the
//! backing filesystem must support them. Operations run serialized per
//! principal on a dedicated blocking worker; see
//! [`WardFs::session`](fs::WardFs::session).

pub mod acl;
pub mod config;
pub mod events;
pub mod fs;
pub mod task;


pub use crate::acl::{AccessRight, AclStore, MemoryAclStore, ShareEntry};
pub use crate::config::Settings;
pub use crate::events::{EventSink, FileEvent, FileEventKind};
pub use crate::fs::errors::{FsError, FsResult};
pub use crate::fs::session::FsSession;
pub use crate::fs::types::{
    AttributeSet, FileKind, FileRow, ListRequest, LogicalPath, Page, Pagination, Principal,
    SensitivityLevel, SortKey, SortOrder, WriteConflictPolicy,
};
pub use crate::fs::WardFs;
