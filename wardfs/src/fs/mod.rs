pub mod attributes;
pub mod errors;
pub mod metrics;
pub mod mutations;
pub mod sandbox;
pub mod sensitivity;
pub mod session;
pub mod streams;
pub mod types;
pub mod upload;
pub mod xattrs;

use std::fs;
use std::io::Read;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use self::attributes::AttributeReader;
use self::errors::FsResult;
use self::metrics::FileSystemStats;
use self::mutations::MutationEngine;
use self::sandbox::PathSandbox;
use self::sensitivity::SensitivityResolver;
use self::session::FsSession;
use self::streams::{StreamManager, StreamSlots};
use self::types::{
    AttributeSet, FileRow, ListRequest, LogicalPath, Page, Principal, SensitivityLevel,
    WriteConflictPolicy,
};
use self::upload::BulkExtractor;
use self::xattrs::XattrStore;
use crate::acl::AclStore;
use crate::config::Settings;
use crate::events::{EventSink, FileEvent};

/// The permission-checked virtual filesystem over one on-disk root.
///
/// All state around that root lives here. Operations are synchronous real
/// syscalls; callers that want the serialized per-principal queue go
/// through [`WardFs::session`] instead of calling these directly.
pub struct WardFs {
    pub settings: Settings,
    pub stats: Arc<FileSystemStats>,
    sandbox: Arc<PathSandbox>,
    sensitivity: Arc<SensitivityResolver>,
    attributes: AttributeReader,
    mutations: Arc<MutationEngine>,
    streams: StreamManager,
    extractor: BulkExtractor,
    events: Arc<EventSink>,
}

impl WardFs {
    /// Builds the filesystem over `settings.root`, creating the root and
    /// its `home` subtree when absent.
    pub fn new(settings: Settings, acl: Arc<dyn AclStore>) -> FsResult<Arc<Self>> {
        fs::create_dir_all(settings.root.join("home"))?;

        let sandbox = Arc::new(PathSandbox::new(&settings)?);
        let xattrs = Arc::new(XattrStore::new());
        let events = Arc::new(EventSink::new());
        let stats = Arc::new(FileSystemStats::new());
        let service = Principal::service(&settings.service_user);

        let sensitivity = Arc::new(SensitivityResolver::new(
            sandbox.clone(),
            xattrs.clone(),
            acl.clone(),
            events.clone(),
            service.clone(),
        ));
        let attributes = AttributeReader::new(
            sandbox.clone(),
            xattrs.clone(),
            sensitivity.clone(),
            acl.clone(),
            service,
        );
        let mutations = Arc::new(MutationEngine::new(
            sandbox.clone(),
            xattrs.clone(),
            sensitivity.clone(),
            acl.clone(),
            events.clone(),
            stats.clone(),
        ));
        let streams = StreamManager::new(
            sandbox.clone(),
            xattrs.clone(),
            sensitivity.clone(),
            acl.clone(),
            events.clone(),
            stats.clone(),
            settings.read_buffer_size,
        );
        let extractor = BulkExtractor::new(
            sandbox.clone(),
            xattrs,
            mutations.clone(),
            sensitivity.clone(),
            acl,
            events.clone(),
            stats.clone(),
        );

        info!(root = %sandbox.root().display(), "filesystem ready");
        Ok(Arc::new(WardFs {
            settings,
            stats,
            sandbox,
            sensitivity,
            attributes,
            mutations,
            streams,
            extractor,
            events,
        }))
    }

    /// Spawns the principal's dedicated worker and hands back its queue.
    pub fn session(self: &Arc<Self>, principal: &Principal) -> FsSession {
        FsSession::spawn(self.clone(), principal.clone())
    }

    /// New receiver on the fire-and-forget event stream.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FileEvent> {
        self.events.subscribe()
    }

    pub fn root(&self) -> &std::path::Path {
        self.sandbox.root()
    }

    pub fn stat(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        attributes: AttributeSet,
    ) -> FsResult<FileRow> {
        self.stats.record_operation();
        self.attributes.stat(principal, logical, attributes, false)
    }

    pub fn stat_many(
        &self,
        principal: &Principal,
        logicals: &[LogicalPath],
        attributes: AttributeSet,
    ) -> FsResult<Vec<Option<FileRow>>> {
        self.stats.record_operation();
        self.attributes.stat_many(principal, logicals, attributes)
    }

    pub fn list_directory(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        request: &ListRequest,
    ) -> FsResult<Page<FileRow>> {
        self.stats.record_operation();
        self.attributes.list_directory(principal, logical, request)
    }

    pub fn mkdir(&self, principal: &Principal, logical: &LogicalPath) -> FsResult<()> {
        self.stats.record_operation();
        self.mutations.mkdir(principal, logical)
    }

    pub fn remove(&self, principal: &Principal, logical: &LogicalPath) -> FsResult<()> {
        self.stats.record_operation();
        self.mutations.remove(principal, logical)
    }

    pub fn copy(
        &self,
        principal: &Principal,
        from: &LogicalPath,
        to: &LogicalPath,
        policy: WriteConflictPolicy,
    ) -> FsResult<LogicalPath> {
        self.stats.record_operation();
        self.mutations.copy(principal, from, to, policy)
    }

    pub fn move_entry(
        &self,
        principal: &Principal,
        from: &LogicalPath,
        to: &LogicalPath,
        policy: WriteConflictPolicy,
    ) -> FsResult<LogicalPath> {
        self.stats.record_operation();
        self.mutations.move_entry(principal, from, to, policy)
    }

    pub fn attribute(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        name: &str,
    ) -> FsResult<String> {
        self.stats.record_operation();
        self.mutations.attribute(principal, logical, name)
    }

    pub fn attributes(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
    ) -> FsResult<Vec<String>> {
        self.stats.record_operation();
        self.mutations.attributes(principal, logical)
    }

    pub fn set_attribute(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        name: &str,
        value: &str,
    ) -> FsResult<()> {
        self.stats.record_operation();
        self.mutations.set_attribute(principal, logical, name, value)
    }

    pub fn remove_attribute(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        name: &str,
    ) -> FsResult<()> {
        self.stats.record_operation();
        self.mutations.remove_attribute(principal, logical, name)
    }

    pub fn effective_sensitivity(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
    ) -> FsResult<SensitivityLevel> {
        self.stats.record_operation();
        // Reading the level needs READ on the node, same as any attribute.
        self.attributes
            .stat(principal, logical, AttributeSet::PATH, false)?;
        self.sensitivity.effective_level(logical)
    }

    pub fn set_sensitivity(
        &self,
        principal: &Principal,
        logical: &LogicalPath,
        level: Option<SensitivityLevel>,
    ) -> FsResult<()> {
        self.stats.record_operation();
        self.sensitivity.set_level(principal, logical, level)
    }

    pub fn open_output(
        &self,
        slots: &mut StreamSlots,
        principal: &Principal,
        logical: &LogicalPath,
        allow_overwrite: bool,
    ) -> FsResult<()> {
        self.stats.record_operation();
        self.streams
            .open_output(slots, principal, logical, allow_overwrite)
    }

    pub fn write_chunk(&self, slots: &mut StreamSlots, data: &bytes::Bytes) -> FsResult<()> {
        self.stats.record_operation();
        self.streams.write_chunk(slots, data)
    }

    pub fn close_output(&self, slots: &mut StreamSlots, principal: &Principal) -> FsResult<u64> {
        self.stats.record_operation();
        self.streams.close_output(slots, principal)
    }

    pub fn open_input(
        &self,
        slots: &mut StreamSlots,
        principal: &Principal,
        logical: &LogicalPath,
        range: Option<(u64, u64)>,
    ) -> FsResult<()> {
        self.stats.record_operation();
        self.streams.open_input(slots, principal, logical, range)
    }

    pub fn read_chunk(
        &self,
        slots: &mut StreamSlots,
        max_len: Option<usize>,
    ) -> FsResult<bytes::Bytes> {
        self.stats.record_operation();
        self.streams.read_chunk(slots, max_len)
    }

    pub fn close_input(&self, slots: &mut StreamSlots) {
        self.stats.record_operation();
        self.streams.close_input(slots)
    }

    pub fn extract<R: Read>(
        &self,
        principal: &Principal,
        target: &LogicalPath,
        policy: WriteConflictPolicy,
        reader: R,
    ) -> FsResult<Vec<LogicalPath>> {
        self.stats.record_operation();
        self.extractor.extract(principal, target, policy, reader)
    }
}
