//! Replication Protocol
//!
//! Messages exchanged between the hub and its edges.

use crate::domain::entities::{EntryKind, FsEntry, OpFamily};
use crate::domain::errors::SyncError;
use crate::domain::value_objects::RelPath;
use serde::{Deserialize, Serialize};

/// Message types for hub/edge communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// hub→edge: full snapshot, sent on connect
    State(Vec<FsEntry>),
    /// edge→hub: a local mutation to apply on the canonical root
    Operation(OperationRequest),
    /// hub→edge: a mutation of the canonical root
    Change(ChangeNotice),
    /// edge→hub: ask for the bytes of one file
    ContentQuery { path: String },
    /// hub→edge: answer to a content query
    Content { path: RelPath, content: Vec<u8> },
    /// either way: something the peer sent could not be handled
    OperationError(OperationError),
}

/// Get the message type as a string.
pub fn message_type_name(msg: &Message) -> &'static str {
    match msg {
        Message::State(_) => "state",
        Message::Operation(_) => "operation",
        Message::Change(_) => "change",
        Message::ContentQuery { .. } => "contentQuery",
        Message::Content { .. } => "content",
        Message::OperationError(_) => "operationError",
    }
}

/// Operation as it travels edge→hub.
///
/// `operation` stays a string so an unknown kind can still be reported
/// back together with its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation: String,
    pub path: String,
    pub content: Option<Vec<u8>>,
    pub new_path: Option<String>,
    pub mode: Option<u32>,
}

impl OperationRequest {
    fn bare(family: OpFamily, path: &RelPath) -> Self {
        Self {
            operation: family.as_str().to_string(),
            path: path.to_string(),
            content: None,
            new_path: None,
            mode: None,
        }
    }

    pub fn write(path: &RelPath, content: Vec<u8>) -> Self {
        Self {
            content: Some(content),
            ..Self::bare(OpFamily::Write, path)
        }
    }

    pub fn delete(path: &RelPath) -> Self {
        Self::bare(OpFamily::Delete, path)
    }

    pub fn mkdir(path: &RelPath) -> Self {
        Self::bare(OpFamily::Mkdir, path)
    }

    pub fn rename(from: &RelPath, to: &RelPath) -> Self {
        Self {
            new_path: Some(to.to_string()),
            ..Self::bare(OpFamily::Rename, from)
        }
    }

    pub fn chmod(path: &RelPath, mode: u32) -> Self {
        Self {
            mode: Some(mode),
            ..Self::bare(OpFamily::Chmod, path)
        }
    }

    /// Validate into a typed operation.
    pub fn parse(&self) -> Result<Operation, SyncError> {
        let family = OpFamily::from_str(&self.operation)
            .ok_or_else(|| SyncError::Protocol(format!("unknown operation kind: {}", self.operation)))?;
        let path = replicated_path(&self.path)?;

        let op = match family {
            OpFamily::Write => Operation::Write {
                path,
                content: self
                    .content
                    .clone()
                    .ok_or_else(|| SyncError::Protocol("write requires content".to_string()))?,
            },
            OpFamily::Delete => Operation::Delete { path },
            OpFamily::Mkdir => Operation::Mkdir { path },
            OpFamily::Rename => {
                let to = self
                    .new_path
                    .as_deref()
                    .ok_or_else(|| SyncError::Protocol("rename requires newPath".to_string()))?;
                Operation::Rename {
                    from: path,
                    to: replicated_path(to)?,
                }
            }
            OpFamily::Chmod => Operation::Chmod {
                path,
                mode: self
                    .mode
                    .ok_or_else(|| SyncError::Protocol("chmod requires mode".to_string()))?,
            },
        };
        Ok(op)
    }
}

fn replicated_path(raw: &str) -> Result<RelPath, SyncError> {
    let path = RelPath::parse(raw)?;
    if path.is_hidden() {
        return Err(SyncError::Protocol(format!("hidden paths are not replicated: {}", raw)));
    }
    Ok(path)
}

/// A validated edge operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Write { path: RelPath, content: Vec<u8> },
    Delete { path: RelPath },
    Mkdir { path: RelPath },
    Rename { from: RelPath, to: RelPath },
    Chmod { path: RelPath, mode: u32 },
}

impl Operation {
    pub fn family(&self) -> OpFamily {
        match self {
            Self::Write { .. } => OpFamily::Write,
            Self::Delete { .. } => OpFamily::Delete,
            Self::Mkdir { .. } => OpFamily::Mkdir,
            Self::Rename { .. } => OpFamily::Rename,
            Self::Chmod { .. } => OpFamily::Chmod,
        }
    }

    pub fn path(&self) -> &RelPath {
        match self {
            Self::Write { path, .. }
            | Self::Delete { path }
            | Self::Mkdir { path }
            | Self::Chmod { path, .. } => path,
            Self::Rename { from, .. } => from,
        }
    }
}

/// Event names of hub→edge change notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEventName {
    Add,
    Change,
    Unlink,
    AddDir,
    UnlinkDir,
    Chmod,
}

impl ChangeEventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Change => "change",
            Self::Unlink => "unlink",
            Self::AddDir => "addDir",
            Self::UnlinkDir => "unlinkDir",
            Self::Chmod => "chmod",
        }
    }
}

/// A mutation of the canonical root, broadcast by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub event: ChangeEventName,
    pub path: RelPath,
    pub kind: EntryKind,
    /// File bytes for add/change, when the file still existed at broadcast time
    pub content: Option<Vec<u8>>,
    pub mode: Option<u32>,
}

impl ChangeNotice {
    fn new(event: ChangeEventName, path: RelPath, kind: EntryKind) -> Self {
        Self {
            event,
            path,
            kind,
            content: None,
            mode: None,
        }
    }

    pub fn add(path: RelPath, content: Option<Vec<u8>>) -> Self {
        Self {
            content,
            ..Self::new(ChangeEventName::Add, path, EntryKind::File)
        }
    }

    pub fn change(path: RelPath, content: Option<Vec<u8>>) -> Self {
        Self {
            content,
            ..Self::new(ChangeEventName::Change, path, EntryKind::File)
        }
    }

    pub fn unlink(path: RelPath) -> Self {
        Self::new(ChangeEventName::Unlink, path, EntryKind::File)
    }

    pub fn add_dir(path: RelPath) -> Self {
        Self::new(ChangeEventName::AddDir, path, EntryKind::Directory)
    }

    pub fn unlink_dir(path: RelPath) -> Self {
        Self::new(ChangeEventName::UnlinkDir, path, EntryKind::Directory)
    }

    pub fn chmod(path: RelPath, kind: EntryKind, mode: u32) -> Self {
        Self {
            mode: Some(mode),
            ..Self::new(ChangeEventName::Chmod, path, kind)
        }
    }
}

/// Failure report sent to the peer that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub message: String,
    pub operation: String,
    pub path: String,
}

impl OperationError {
    pub fn new(message: impl Into<String>, operation: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            operation: operation.into(),
            path: path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> RelPath {
        RelPath::parse(s).unwrap()
    }

    #[test]
    fn test_parse_write() {
        let req = OperationRequest::write(&p("a.txt"), b"hello".to_vec());
        assert_eq!(req.operation, "write");
        assert_eq!(
            req.parse().unwrap(),
            Operation::Write {
                path: p("a.txt"),
                content: b"hello".to_vec()
            }
        );
    }

    #[test]
    fn test_parse_rename() {
        let req = OperationRequest::rename(&p("a.txt"), &p("b/a.txt"));
        let op = req.parse().unwrap();
        assert_eq!(op.family(), OpFamily::Rename);
        assert_eq!(op.path(), &p("a.txt"));
        assert!(matches!(op, Operation::Rename { to, .. } if to == p("b/a.txt")));
    }

    #[test]
    fn test_parse_unknown_kind() {
        let mut req = OperationRequest::delete(&p("a.txt"));
        req.operation = "truncate".to_string();
        let err = req.parse().unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(err.to_string().contains("truncate"));
    }

    #[test]
    fn test_parse_rejects_traversal() {
        let mut req = OperationRequest::delete(&p("a.txt"));
        req.path = "../../etc/passwd".to_string();
        assert!(matches!(req.parse(), Err(SyncError::Path(_))));
    }

    #[test]
    fn test_parse_rejects_hidden() {
        let mut req = OperationRequest::mkdir(&p("a"));
        req.path = ".git".to_string();
        assert!(matches!(req.parse(), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_parse_missing_fields() {
        let mut write = OperationRequest::write(&p("a"), vec![]);
        write.content = None;
        assert!(write.parse().is_err());

        let mut chmod = OperationRequest::chmod(&p("a"), 0o644);
        chmod.mode = None;
        assert!(chmod.parse().is_err());

        let mut rename = OperationRequest::rename(&p("a"), &p("b"));
        rename.new_path = None;
        assert!(rename.parse().is_err());
    }

    #[test]
    fn test_empty_write_is_valid() {
        let req = OperationRequest::write(&p("empty.txt"), Vec::new());
        assert!(req.parse().is_ok());
    }

    #[test]
    fn test_change_notice_builders() {
        let n = ChangeNotice::add(p("a"), Some(b"x".to_vec()));
        assert_eq!(n.event.as_str(), "add");
        assert_eq!(n.kind, EntryKind::File);

        let n = ChangeNotice::unlink_dir(p("d"));
        assert_eq!(n.event.as_str(), "unlinkDir");
        assert_eq!(n.kind, EntryKind::Directory);

        let n = ChangeNotice::chmod(p("d"), EntryKind::Directory, 0o700);
        assert_eq!(n.mode, Some(0o700));
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::State(vec![FsEntry::file(p("a.txt"), 5), FsEntry::directory(p("docs"))]);
        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_binary_content_survives() {
        let content: Vec<u8> = (0..=255).collect();
        let msg = Message::Content {
            path: p("blob.bin"),
            content: content.clone(),
        };
        let bytes = bincode::serialize(&msg).unwrap();
        match bincode::deserialize::<Message>(&bytes).unwrap() {
            Message::Content { content: c, .. } => assert_eq!(c, content),
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(message_type_name(&Message::State(vec![])), "state");
        assert_eq!(
            message_type_name(&Message::ContentQuery { path: "a".to_string() }),
            "contentQuery"
        );
        assert_eq!(
            message_type_name(&Message::OperationError(OperationError::new("m", "write", "a"))),
            "operationError"
        );
    }
}
