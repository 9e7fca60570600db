//! Import sources: polymorphic fetchers delivering module text.
//!
//! Each kind polls (or is handed) its source and invokes the injected
//! content sink exactly once per observed revision. Fetch failures degrade
//! the source's health; the last good content stays published until a newer
//! revision succeeds.

mod file;
mod git;
mod http;
mod inline;

use std::sync::Arc;

use async_trait::async_trait;
pub(crate) use file::FileSource;
use flow_core::component::ArgumentsError;
use flow_core::health::Health;
use flow_syntax::Value;
pub(crate) use git::GitSource;
pub(crate) use http::HttpSource;
pub(crate) use inline::InlineSource;
use tokio_util::sync::CancellationToken;

/// Block names for the import kinds.
pub(crate) const BLOCK_IMPORT_STRING: &str = "import.string";
pub(crate) const BLOCK_IMPORT_FILE: &str = "import.file";
pub(crate) const BLOCK_IMPORT_GIT: &str = "import.git";
pub(crate) const BLOCK_IMPORT_HTTP: &str = "import.http";

/// The supported import source kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Content written inline in the importing configuration.
    Inline,
    /// A local file polled for modification.
    File,
    /// A file inside a remote Git repository, fetched on a cadence.
    Git,
    /// A URL polled over HTTP.
    Http,
}

impl SourceKind {
    /// Map a block name to its source kind.
    #[must_use]
    pub fn from_block_name(name: &str) -> Option<Self> {
        match name {
            BLOCK_IMPORT_STRING => Some(Self::Inline),
            BLOCK_IMPORT_FILE => Some(Self::File),
            BLOCK_IMPORT_GIT => Some(Self::Git),
            BLOCK_IMPORT_HTTP => Some(Self::Http),
            _ => None,
        }
    }
}

/// Errors surfaced by import sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source's arguments failed to decode or validate.
    #[error(transparent)]
    Arguments(#[from] ArgumentsError),

    /// A local file could not be read.
    #[error("failed to read `{path}`: {reason}")]
    File {
        /// The path that failed.
        path: String,
        /// Why it failed.
        reason: String,
    },

    /// An HTTP poll failed.
    #[error("http fetch failed: {0}")]
    Http(String),

    /// A Git operation failed.
    #[error("git fetch failed: {0}")]
    Git(String),
}

/// Receives each new revision of the imported text.
pub(crate) type ContentSink = Arc<dyn Fn(String) + Send + Sync>;

/// Contract shared by every import source kind.
#[async_trait]
pub(crate) trait ImportSource: Send + Sync {
    /// Apply (re-)evaluated arguments. May deliver content synchronously
    /// when the source can resolve it without I/O waits.
    fn update(&self, args: Value) -> Result<(), SourceError>;

    /// Poll or wait for changes until cancelled.
    async fn run(&self, ctx: CancellationToken) -> Result<(), SourceError>;

    /// The last decoded raw arguments.
    fn arguments(&self) -> Value;

    /// Source health: fetch failures show up here, malformed content does
    /// not (that is the consuming import node's concern).
    fn current_health(&self) -> Health;
}

/// Construct the source implementation for a kind.
///
/// `checkout_dir` is the node's data directory; only the Git source uses
/// it, for its working clone.
pub(crate) fn new_import_source(
    kind: SourceKind,
    checkout_dir: std::path::PathBuf,
    sink: ContentSink,
) -> Box<dyn ImportSource> {
    match kind {
        SourceKind::Inline => Box::new(InlineSource::new(sink)),
        SourceKind::File => Box::new(FileSource::new(sink)),
        SourceKind::Git => Box::new(GitSource::new(checkout_dir, sink)),
        SourceKind::Http => Box::new(HttpSource::new(sink)),
    }
}

/// Tracks the last delivered content so each revision is emitted once.
pub(crate) struct ContentTracker {
    sink: ContentSink,
    last: std::sync::Mutex<Option<String>>,
}

impl ContentTracker {
    pub(crate) fn new(sink: ContentSink) -> Self {
        Self { sink, last: std::sync::Mutex::new(None) }
    }

    /// Deliver `content` if it differs from the previous revision.
    pub(crate) fn deliver(&self, content: String) {
        {
            let mut last = self.last.lock().unwrap();
            if last.as_deref() == Some(content.as_str()) {
                return;
            }
            *last = Some(content.clone());
        }
        (self.sink)(content);
    }
}

pub(crate) mod humantime_serde {
    //! Serde adapter for humantime-formatted durations in source arguments.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
