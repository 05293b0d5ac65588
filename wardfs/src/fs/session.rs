use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::fs::errors::{FsError, FsResult};
use crate::fs::streams::StreamSlots;
use crate::fs::types::{
    AttributeSet, FileRow, ListRequest, LogicalPath, Page, Principal, SensitivityLevel,
    WriteConflictPolicy,
};
use crate::fs::WardFs;
use crate::task::spawn_blocking_named;

type Reply<T> = oneshot::Sender<FsResult<T>>;

/// One queued filesystem operation. Paths travel as raw client strings and
/// are parsed on the worker so that malformed input surfaces through the
/// same reply channel as every other failure.
pub enum SessionCommand {
    Stat {
        path: String,
        attributes: AttributeSet,
        reply: Reply<FileRow>,
    },
    StatMany {
        paths: Vec<String>,
        attributes: AttributeSet,
        reply: Reply<Vec<Option<FileRow>>>,
    },
    ListDirectory {
        path: String,
        request: ListRequest,
        reply: Reply<Page<FileRow>>,
    },
    Mkdir {
        path: String,
        reply: Reply<()>,
    },
    Remove {
        path: String,
        reply: Reply<()>,
    },
    Copy {
        from: String,
        to: String,
        policy: WriteConflictPolicy,
        reply: Reply<LogicalPath>,
    },
    Move {
        from: String,
        to: String,
        policy: WriteConflictPolicy,
        reply: Reply<LogicalPath>,
    },
    Attribute {
        path: String,
        name: String,
        reply: Reply<String>,
    },
    Attributes {
        path: String,
        reply: Reply<Vec<String>>,
    },
    SetAttribute {
        path: String,
        name: String,
        value: String,
        reply: Reply<()>,
    },
    RemoveAttribute {
        path: String,
        name: String,
        reply: Reply<()>,
    },
    EffectiveSensitivity {
        path: String,
        reply: Reply<SensitivityLevel>,
    },
    SetSensitivity {
        path: String,
        level: Option<SensitivityLevel>,
        reply: Reply<()>,
    },
    OpenOutput {
        path: String,
        allow_overwrite: bool,
        reply: Reply<()>,
    },
    WriteChunk {
        data: Bytes,
        reply: Reply<()>,
    },
    CloseOutput {
        reply: Reply<u64>,
    },
    OpenInput {
        path: String,
        range: Option<(u64, u64)>,
        reply: Reply<()>,
    },
    ReadChunk {
        max_len: Option<usize>,
        reply: Reply<Bytes>,
    },
    CloseInput {
        reply: Reply<()>,
    },
    Extract {
        path: String,
        policy: WriteConflictPolicy,
        reader: Box<dyn Read + Send>,
        reply: Reply<Vec<LogicalPath>>,
    },
}

/// Handle to one principal's serialized operation queue.
///
/// Every method enqueues a command and awaits its reply; the dedicated
/// worker executes strictly in submission order, one operation at a time.
/// Dropping the last handle closes the queue and the worker drains and
/// exits, releasing any open stream slots with it.
#[derive(Debug, Clone)]
pub struct FsSession {
    principal: Principal,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl FsSession {
    pub(crate) fn spawn(fs: Arc<WardFs>, principal: Principal) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let name = format!("session-{}", principal.name());
        let worker_principal = principal.clone();
        spawn_blocking_named(&name, move || {
            session_worker(fs, worker_principal, receiver)
        });
        FsSession {
            principal,
            commands,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    async fn submit<T, F>(&self, build: F) -> FsResult<T>
    where
        F: FnOnce(Reply<T>) -> SessionCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| FsError::critical("session worker is gone"))?;
        rx.await
            .map_err(|_| FsError::critical("session worker dropped the reply"))?
    }

    pub async fn stat(&self, path: &str, attributes: AttributeSet) -> FsResult<FileRow> {
        let path = path.to_string();
        self.submit(move |reply| SessionCommand::Stat {
            path,
            attributes,
            reply,
        })
        .await
    }

    pub async fn stat_many(
        &self,
        paths: Vec<String>,
        attributes: AttributeSet,
    ) -> FsResult<Vec<Option<FileRow>>> {
        self.submit(move |reply| SessionCommand::StatMany {
            paths,
            attributes,
            reply,
        })
        .await
    }

    pub async fn list_directory(
        &self,
        path: &str,
        request: ListRequest,
    ) -> FsResult<Page<FileRow>> {
        let path = path.to_string();
        self.submit(move |reply| SessionCommand::ListDirectory {
            path,
            request,
            reply,
        })
        .await
    }

    pub async fn mkdir(&self, path: &str) -> FsResult<()> {
        let path = path.to_string();
        self.submit(move |reply| SessionCommand::Mkdir { path, reply })
            .await
    }

    pub async fn remove(&self, path: &str) -> FsResult<()> {
        let path = path.to_string();
        self.submit(move |reply| SessionCommand::Remove { path, reply })
            .await
    }

    pub async fn copy(
        &self,
        from: &str,
        to: &str,
        policy: WriteConflictPolicy,
    ) -> FsResult<LogicalPath> {
        let from = from.to_string();
        let to = to.to_string();
        self.submit(move |reply| SessionCommand::Copy {
            from,
            to,
            policy,
            reply,
        })
        .await
    }

    pub async fn move_entry(
        &self,
        from: &str,
        to: &str,
        policy: WriteConflictPolicy,
    ) -> FsResult<LogicalPath> {
        let from = from.to_string();
        let to = to.to_string();
        self.submit(move |reply| SessionCommand::Move {
            from,
            to,
            policy,
            reply,
        })
        .await
    }

    pub async fn attribute(&self, path: &str, name: &str) -> FsResult<String> {
        let path = path.to_string();
        let name = name.to_string();
        self.submit(move |reply| SessionCommand::Attribute { path, name, reply })
            .await
    }

    pub async fn attributes(&self, path: &str) -> FsResult<Vec<String>> {
        let path = path.to_string();
        self.submit(move |reply| SessionCommand::Attributes { path, reply })
            .await
    }

    pub async fn set_attribute(&self, path: &str, name: &str, value: &str) -> FsResult<()> {
        let path = path.to_string();
        let name = name.to_string();
        let value = value.to_string();
        self.submit(move |reply| SessionCommand::SetAttribute {
            path,
            name,
            value,
            reply,
        })
        .await
    }

    pub async fn remove_attribute(&self, path: &str, name: &str) -> FsResult<()> {
        let path = path.to_string();
        let name = name.to_string();
        self.submit(move |reply| SessionCommand::RemoveAttribute { path, name, reply })
            .await
    }

    pub async fn effective_sensitivity(&self, path: &str) -> FsResult<SensitivityLevel> {
        let path = path.to_string();
        self.submit(move |reply| SessionCommand::EffectiveSensitivity { path, reply })
            .await
    }

    pub async fn set_sensitivity(
        &self,
        path: &str,
        level: Option<SensitivityLevel>,
    ) -> FsResult<()> {
        let path = path.to_string();
        self.submit(move |reply| SessionCommand::SetSensitivity { path, level, reply })
            .await
    }

    pub async fn open_output(&self, path: &str, allow_overwrite: bool) -> FsResult<()> {
        let path = path.to_string();
        self.submit(move |reply| SessionCommand::OpenOutput {
            path,
            allow_overwrite,
            reply,
        })
        .await
    }

    pub async fn write_chunk(&self, data: Bytes) -> FsResult<()> {
        self.submit(move |reply| SessionCommand::WriteChunk { data, reply })
            .await
    }

    pub async fn close_output(&self) -> FsResult<u64> {
        self.submit(move |reply| SessionCommand::CloseOutput { reply })
            .await
    }

    pub async fn open_input(&self, path: &str, range: Option<(u64, u64)>) -> FsResult<()> {
        let path = path.to_string();
        self.submit(move |reply| SessionCommand::OpenInput { path, range, reply })
            .await
    }

    pub async fn read_chunk(&self, max_len: Option<usize>) -> FsResult<Bytes> {
        self.submit(move |reply| SessionCommand::ReadChunk { max_len, reply })
            .await
    }

    pub async fn close_input(&self) -> FsResult<()> {
        self.submit(move |reply| SessionCommand::CloseInput { reply })
            .await
    }

    pub async fn extract(
        &self,
        path: &str,
        policy: WriteConflictPolicy,
        reader: impl Read + Send + 'static,
    ) -> FsResult<Vec<LogicalPath>> {
        let path = path.to_string();
        self.submit(move |reply| SessionCommand::Extract {
            path,
            policy,
            reader: Box::new(reader),
            reply,
        })
        .await
    }
}

fn session_worker(
    fs: Arc<WardFs>,
    principal: Principal,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) {
    debug!(principal = %principal, "session worker started");
    let mut slots = StreamSlots::default();
    while let Some(command) = commands.blocking_recv() {
        handle_command(&fs, &principal, &mut slots, command);
    }
    slots.release_all();
    debug!(principal = %principal, "session worker exiting");
}

/// Replies go out with `let _ =`: an abandoned caller must never stop the
/// worker, and a mutation that has begun issuing syscalls runs to
/// completion regardless.
fn handle_command(
    fs: &WardFs,
    principal: &Principal,
    slots: &mut StreamSlots,
    command: SessionCommand,
) {
    match command {
        SessionCommand::Stat {
            path,
            attributes,
            reply,
        } => {
            let result = LogicalPath::parse(&path)
                .and_then(|path| fs.stat(principal, &path, attributes));
            let _ = reply.send(result);
        }
        SessionCommand::StatMany {
            paths,
            attributes,
            reply,
        } => {
            let result = paths
                .iter()
                .map(|raw| LogicalPath::parse(raw))
                .collect::<FsResult<Vec<_>>>()
                .and_then(|paths| fs.stat_many(principal, &paths, attributes));
            let _ = reply.send(result);
        }
        SessionCommand::ListDirectory {
            path,
            request,
            reply,
        } => {
            let result = LogicalPath::parse(&path)
                .and_then(|path| fs.list_directory(principal, &path, &request));
            let _ = reply.send(result);
        }
        SessionCommand::Mkdir { path, reply } => {
            let result = LogicalPath::parse(&path).and_then(|path| fs.mkdir(principal, &path));
            let _ = reply.send(result);
        }
        SessionCommand::Remove { path, reply } => {
            let result = LogicalPath::parse(&path).and_then(|path| fs.remove(principal, &path));
            let _ = reply.send(result);
        }
        SessionCommand::Copy {
            from,
            to,
            policy,
            reply,
        } => {
            let result = LogicalPath::parse(&from).and_then(|from| {
                let to = LogicalPath::parse(&to)?;
                fs.copy(principal, &from, &to, policy)
            });
            let _ = reply.send(result);
        }
        SessionCommand::Move {
            from,
            to,
            policy,
            reply,
        } => {
            let result = LogicalPath::parse(&from).and_then(|from| {
                let to = LogicalPath::parse(&to)?;
                fs.move_entry(principal, &from, &to, policy)
            });
            let _ = reply.send(result);
        }
        SessionCommand::Attribute { path, name, reply } => {
            let result = LogicalPath::parse(&path)
                .and_then(|path| fs.attribute(principal, &path, &name));
            let _ = reply.send(result);
        }
        SessionCommand::Attributes { path, reply } => {
            let result =
                LogicalPath::parse(&path).and_then(|path| fs.attributes(principal, &path));
            let _ = reply.send(result);
        }
        SessionCommand::SetAttribute {
            path,
            name,
            value,
            reply,
        } => {
            let result = LogicalPath::parse(&path)
                .and_then(|path| fs.set_attribute(principal, &path, &name, &value));
            let _ = reply.send(result);
        }
        SessionCommand::RemoveAttribute { path, name, reply } => {
            let result = LogicalPath::parse(&path)
                .and_then(|path| fs.remove_attribute(principal, &path, &name));
            let _ = reply.send(result);
        }
        SessionCommand::EffectiveSensitivity { path, reply } => {
            let result = LogicalPath::parse(&path)
                .and_then(|path| fs.effective_sensitivity(principal, &path));
            let _ = reply.send(result);
        }
        SessionCommand::SetSensitivity { path, level, reply } => {
            let result = LogicalPath::parse(&path)
                .and_then(|path| fs.set_sensitivity(principal, &path, level));
            let _ = reply.send(result);
        }
        SessionCommand::OpenOutput {
            path,
            allow_overwrite,
            reply,
        } => {
            let result = LogicalPath::parse(&path)
                .and_then(|path| fs.open_output(slots, principal, &path, allow_overwrite));
            let _ = reply.send(result);
        }
        SessionCommand::WriteChunk { data, reply } => {
            let _ = reply.send(fs.write_chunk(slots, &data));
        }
        SessionCommand::CloseOutput { reply } => {
            let _ = reply.send(fs.close_output(slots, principal));
        }
        SessionCommand::OpenInput { path, range, reply } => {
            let result = LogicalPath::parse(&path)
                .and_then(|path| fs.open_input(slots, principal, &path, range));
            let _ = reply.send(result);
        }
        SessionCommand::ReadChunk { max_len, reply } => {
            let _ = reply.send(fs.read_chunk(slots, max_len));
        }
        SessionCommand::CloseInput { reply } => {
            fs.close_input(slots);
            let _ = reply.send(Ok(()));
        }
        SessionCommand::Extract {
            path,
            policy,
            reader,
            reply,
        } => {
            let result = LogicalPath::parse(&path)
                .and_then(|path| fs.extract(principal, &path, policy, reader));
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::MemoryAclStore;
    use crate::config::Settings;

    async fn session_fixture() -> (FsSession, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let fs = WardFs::new(Settings::new(dir.path()), Arc::new(MemoryAclStore::new())).unwrap();
        let service = fs.session(&Principal::service("_service"));
        service.mkdir("/home/alice").await.unwrap();
        (fs.session(&Principal::user("alice")), dir)
    }

    #[tokio::test]
    async fn test_commands_run_in_submission_order() {
        let (session, _dir) = session_fixture().await;

        session.mkdir("/home/alice/a").await.unwrap();
        session.mkdir("/home/alice/a/b").await.unwrap();
        let row = session
            .stat("/home/alice/a/b", AttributeSet::default())
            .await
            .unwrap();
        assert_eq!(row.path.as_str(), "/home/alice/a/b");
    }

    #[tokio::test]
    async fn test_malformed_paths_answer_bad_request() {
        let (session, _dir) = session_fixture().await;

        let err = session
            .stat("relative/path", AttributeSet::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::BadRequest(_)));
        let err = session.mkdir("/home/alice/../../..").await.unwrap_err();
        assert!(matches!(err, FsError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_path_normalizing_onto_home_answers_permission_denied() {
        let (session, _dir) = session_fixture().await;

        // "/home/alice/.." is well formed and collapses to "/home", still
        // inside the jail; creating it needs write access on "/", which
        // alice does not hold.
        let err = session.mkdir("/home/alice/..").await.unwrap_err();
        assert!(matches!(err, FsError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_abandoned_call_does_not_stop_the_worker() {
        let (session, _dir) = session_fixture().await;

        // The first poll sends the command; the zero timeout then drops the
        // future without awaiting the reply.
        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(0),
            session.mkdir("/home/alice/dropped"),
        )
        .await;
        drop(abandoned);

        // The worker still ran the abandoned mkdir and keeps serving.
        session.mkdir("/home/alice/after").await.unwrap();
        session
            .stat("/home/alice/dropped", AttributeSet::default())
            .await
            .unwrap();
    }
}
