//! `import.file`: a local module file polled for modification.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use flow_core::component::{decode_arguments, ComponentArguments};
use flow_core::health::Health;
use flow_syntax::Value;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{humantime_serde, ContentSink, ContentTracker, ImportSource, SourceError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct FileArguments {
    filename: String,

    #[serde(with = "humantime_serde")]
    poll_frequency: Duration,
}

impl Default for FileArguments {
    fn default() -> Self {
        Self { filename: String::new(), poll_frequency: Duration::from_secs(1) }
    }
}

impl ComponentArguments for FileArguments {
    fn validate(&self) -> Result<(), flow_core::component::ArgumentsError> {
        if self.filename.is_empty() {
            return Err(flow_core::component::ArgumentsError::Validation(
                "filename must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// File source with content polling.
///
/// The initial read happens synchronously on update so consumers evaluated
/// in the same load pass already see the module content.
pub(crate) struct FileSource {
    args: Mutex<FileArguments>,
    tracker: ContentTracker,
    health: Mutex<Health>,
}

impl FileSource {
    pub(crate) fn new(sink: ContentSink) -> Self {
        Self {
            args: Mutex::new(FileArguments::default()),
            tracker: ContentTracker::new(sink),
            health: Mutex::new(Health::unknown("file source created")),
        }
    }

    fn poll_once(&self) {
        let filename = self.args.lock().unwrap().filename.clone();
        match std::fs::read_to_string(&filename) {
            Ok(content) => {
                *self.health.lock().unwrap() =
                    Health::healthy(format!("read {filename}"));
                self.tracker.deliver(content);
            }
            Err(err) => {
                // Keep the last good content; just surface the failure.
                warn!(%filename, %err, "failed to read module file");
                *self.health.lock().unwrap() = Health::unhealthy(format!(
                    "failed to read `{filename}`: {err}"
                ));
            }
        }
    }
}

#[async_trait]
impl ImportSource for FileSource {
    fn update(&self, args: Value) -> Result<(), SourceError> {
        let args: FileArguments = decode_arguments(args)?;
        *self.args.lock().unwrap() = args;
        self.poll_once();
        Ok(())
    }

    async fn run(&self, ctx: CancellationToken) -> Result<(), SourceError> {
        loop {
            let frequency = self.args.lock().unwrap().poll_frequency;
            tokio::select! {
                () = ctx.cancelled() => return Ok(()),
                () = tokio::time::sleep(frequency) => {}
            }
            self.poll_once();
        }
    }

    fn arguments(&self) -> Value {
        serde_json::to_value(&*self.args.lock().unwrap()).unwrap_or(Value::Null)
    }

    fn current_health(&self) -> Health {
        self.health.lock().unwrap().clone()
    }
}
