//! `import.string`: module content written inline in the configuration.

use std::sync::Mutex;

use async_trait::async_trait;
use flow_core::component::{decode_arguments, ComponentArguments};
use flow_core::health::Health;
use flow_syntax::Value;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{ContentSink, ContentTracker, ImportSource, SourceError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct InlineArguments {
    content: String,
}

impl ComponentArguments for InlineArguments {}

/// Inline source: every evaluation that yields new text is a new revision.
pub(crate) struct InlineSource {
    args: Mutex<InlineArguments>,
    tracker: ContentTracker,
}

impl InlineSource {
    pub(crate) fn new(sink: ContentSink) -> Self {
        Self {
            args: Mutex::new(InlineArguments::default()),
            tracker: ContentTracker::new(sink),
        }
    }
}

#[async_trait]
impl ImportSource for InlineSource {
    fn update(&self, args: Value) -> Result<(), SourceError> {
        let args: InlineArguments = decode_arguments(args)?;
        let content = args.content.clone();
        *self.args.lock().unwrap() = args;
        self.tracker.deliver(content);
        Ok(())
    }

    async fn run(&self, ctx: CancellationToken) -> Result<(), SourceError> {
        // Inline content only changes through re-evaluation.
        ctx.cancelled().await;
        Ok(())
    }

    fn arguments(&self) -> Value {
        serde_json::to_value(&*self.args.lock().unwrap()).unwrap_or(Value::Null)
    }

    fn current_health(&self) -> Health {
        Health::healthy("inline content bound")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_inline_emits_once_per_revision() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink: ContentSink = {
            let delivered = delivered.clone();
            Arc::new(move |content| {
                assert!(content.starts_with("declare"));
                delivered.fetch_add(1, Ordering::SeqCst);
            })
        };
        let source = InlineSource::new(sink);

        source.update(json!({"content": "declare \"a\" {}"})).unwrap();
        source.update(json!({"content": "declare \"a\" {}"})).unwrap();
        source.update(json!({"content": "declare \"b\" {}"})).unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }
}
