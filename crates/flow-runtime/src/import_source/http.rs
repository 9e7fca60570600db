//! `import.http`: a module document polled from a URL.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use flow_core::component::{decode_arguments, ArgumentsError, ComponentArguments};
use flow_core::health::Health;
use flow_syntax::Value;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{humantime_serde, ContentSink, ContentTracker, ImportSource, SourceError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct HttpArguments {
    url: String,
    method: String,
    headers: BTreeMap<String, String>,

    #[serde(with = "humantime_serde")]
    poll_frequency: Duration,
}

impl Default for HttpArguments {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            poll_frequency: Duration::from_secs(60),
        }
    }
}

impl ComponentArguments for HttpArguments {
    fn validate(&self) -> Result<(), ArgumentsError> {
        if self.url.is_empty() {
            return Err(ArgumentsError::Validation("url must not be empty".to_string()));
        }
        if reqwest::Method::from_bytes(self.method.as_bytes()).is_err() {
            return Err(ArgumentsError::Validation(format!(
                "invalid http method `{}`",
                self.method
            )));
        }
        Ok(())
    }
}

/// HTTP polling source.
pub(crate) struct HttpSource {
    args: Mutex<HttpArguments>,
    client: reqwest::Client,
    tracker: ContentTracker,
    health: Mutex<Health>,
}

impl HttpSource {
    pub(crate) fn new(sink: ContentSink) -> Self {
        Self {
            args: Mutex::new(HttpArguments::default()),
            client: reqwest::Client::new(),
            tracker: ContentTracker::new(sink),
            health: Mutex::new(Health::unknown("http source created")),
        }
    }

    async fn poll_once(&self) {
        let args = self.args.lock().unwrap().clone();
        match self.fetch(&args).await {
            Ok(content) => {
                *self.health.lock().unwrap() =
                    Health::healthy(format!("fetched {}", args.url));
                self.tracker.deliver(content);
            }
            Err(err) => {
                warn!(url = %args.url, %err, "failed to fetch module over http");
                *self.health.lock().unwrap() = Health::unhealthy(err.to_string());
            }
        }
    }

    async fn fetch(&self, args: &HttpArguments) -> Result<String, SourceError> {
        let method = reqwest::Method::from_bytes(args.method.as_bytes())
            .map_err(|_| SourceError::Http(format!("invalid method `{}`", args.method)))?;
        let mut request = self.client.request(method, &args.url);
        for (name, value) in &args.headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|err| SourceError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SourceError::Http(format!(
                "`{}` returned status {}",
                args.url,
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|err| SourceError::Http(err.to_string()))
    }
}

#[async_trait]
impl ImportSource for HttpSource {
    fn update(&self, args: Value) -> Result<(), SourceError> {
        let args: HttpArguments = decode_arguments(args)?;
        *self.args.lock().unwrap() = args;
        // Content arrives on the next poll; consumers stay pending until
        // then.
        Ok(())
    }

    async fn run(&self, ctx: CancellationToken) -> Result<(), SourceError> {
        loop {
            self.poll_once().await;
            let frequency = self.args.lock().unwrap().poll_frequency;
            tokio::select! {
                () = ctx.cancelled() => return Ok(()),
                () = tokio::time::sleep(frequency) => {}
            }
        }
    }

    fn arguments(&self) -> Value {
        serde_json::to_value(&*self.args.lock().unwrap()).unwrap_or(Value::Null)
    }

    fn current_health(&self) -> Health {
        self.health.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_arguments_validation() {
        let sink: ContentSink = Arc::new(|_| {});
        let source = HttpSource::new(sink);

        assert!(source.update(json!({})).is_err());
        assert!(source
            .update(json!({"url": "http://localhost/m", "method": "FE TCH"}))
            .is_err());
        assert!(source
            .update(json!({
                "url": "http://localhost/m",
                "poll_frequency": "250ms",
                "headers": {"authorization": "Bearer t"},
            }))
            .is_ok());
    }

    #[test]
    fn test_default_arguments() {
        let sink: ContentSink = Arc::new(|_| {});
        let source = HttpSource::new(sink);
        source.update(json!({"url": "http://localhost/m"})).unwrap();
        let args = source.arguments();
        assert_eq!(args["method"], "GET");
        assert_eq!(args["poll_frequency"], "1m");
    }
}
