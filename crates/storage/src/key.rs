//! Storage keys and the routing rule that maps them onto a backend.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::{StorageError, StorageResult};

/// An ordered sequence of string segments identifying one resource,
/// e.g. `["session", project_id, session_id]`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StorageKey(Vec<String>);

/// Where a key lives, decided once at the facade boundary.
///
/// Anything that is not one of the record-store shapes is a [`KeyRoute::File`]
/// key and is served by the legacy JSON file store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRoute<'a> {
    /// `["message", session_id, message_id]`
    Message {
        session_id: &'a str,
        message_id: &'a str,
    },
    /// `["message", session_id]`
    Messages { session_id: &'a str },
    /// `["session", project_id, session_id]`
    Session {
        project_id: &'a str,
        session_id: &'a str,
    },
    /// `["session", project_id]`
    Sessions { project_id: &'a str },
    /// `["session_diff", session_id]`
    SessionDiff { session_id: &'a str },
    File,
}

impl KeyRoute<'_> {
    /// Whether the route is owned by the record store.
    pub fn is_routed(&self) -> bool {
        !matches!(self, KeyRoute::File)
    }

    /// Whether the route names a collection rather than a single record.
    pub fn is_listing(&self) -> bool {
        matches!(self, KeyRoute::Messages { .. } | KeyRoute::Sessions { .. })
    }
}

impl StorageKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A new key with `segment` appended.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Segments joined by `/`; used in error messages and logs.
    pub fn joined(&self) -> String {
        self.0.join("/")
    }

    /// Ensure every segment is a plain file name: not empty, not `.` or `..`,
    /// and free of separators and roots.
    pub fn check_segments(&self) -> StorageResult<()> {
        match self.0.iter().find(|segment| !is_plain_segment(segment)) {
            Some(segment) => Err(StorageError::InvalidKey {
                key: self.joined(),
                reason: format!("segment {:?} is not a plain name", segment),
            }),
            None => Ok(()),
        }
    }

    /// Relative path of the JSON document backing this key in the file store.
    pub fn file_path(&self) -> PathBuf {
        let mut path: PathBuf = self.0.iter().collect();
        path.set_extension(match path.extension() {
            Some(ext) => format!("{}.json", ext.to_string_lossy()),
            None => "json".to_string(),
        });
        path
    }

    /// Relative directory under which keys with this prefix are stored.
    pub fn dir_path(&self) -> PathBuf {
        self.0.iter().collect()
    }

    /// Classify the key. Checked in priority order: message record, message
    /// listing, session record, session listing, session diff, file.
    pub fn route(&self) -> KeyRoute<'_> {
        let segments: Vec<&str> = self.0.iter().map(String::as_str).collect();
        match segments.as_slice() {
            &["message", session_id, message_id] => KeyRoute::Message {
                session_id,
                message_id,
            },
            &["message", session_id] => KeyRoute::Messages { session_id },
            &["session", project_id, session_id] => KeyRoute::Session {
                project_id,
                session_id,
            },
            &["session", project_id] => KeyRoute::Sessions { project_id },
            &["session_diff", session_id] => KeyRoute::SessionDiff { session_id },
            _ => KeyRoute::File,
        }
    }
}

fn is_plain_segment(segment: &str) -> bool {
    if segment.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey({:?})", self.0)
    }
}

impl From<Vec<String>> for StorageKey {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl From<&StorageKey> for StorageKey {
    fn from(key: &StorageKey) -> Self {
        key.clone()
    }
}

impl From<&[&str]> for StorageKey {
    fn from(segments: &[&str]) -> Self {
        Self::new(segments.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for StorageKey {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}
