//! `import.git`: a module file fetched from a Git repository.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use flow_core::component::{decode_arguments, ArgumentsError, ComponentArguments};
use flow_core::health::Health;
use flow_syntax::Value;
use git2::build::RepoBuilder;
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{humantime_serde, ContentSink, ContentTracker, ImportSource, SourceError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct GitArguments {
    repository: String,
    revision: String,
    path: String,

    #[serde(with = "humantime_serde")]
    poll_frequency: Duration,

    basic_auth: Option<BasicAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct BasicAuth {
    username: String,
    password: String,
}

impl Default for GitArguments {
    fn default() -> Self {
        Self {
            repository: String::new(),
            revision: "HEAD".to_string(),
            path: String::new(),
            poll_frequency: Duration::from_secs(60),
            basic_auth: None,
        }
    }
}

impl ComponentArguments for GitArguments {
    fn validate(&self) -> Result<(), ArgumentsError> {
        if self.repository.is_empty() {
            return Err(ArgumentsError::Validation(
                "repository must not be empty".to_string(),
            ));
        }
        if self.path.is_empty() {
            return Err(ArgumentsError::Validation(
                "path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Git source: clones into the node's data directory and fetches on a
/// cadence, reading the module blob at the configured revision and path.
pub(crate) struct GitSource {
    args: Mutex<GitArguments>,
    checkout_dir: PathBuf,
    tracker: ContentTracker,
    health: Mutex<Health>,
}

impl GitSource {
    pub(crate) fn new(checkout_dir: PathBuf, sink: ContentSink) -> Self {
        Self {
            args: Mutex::new(GitArguments::default()),
            checkout_dir,
            tracker: ContentTracker::new(sink),
            health: Mutex::new(Health::unknown("git source created")),
        }
    }

    async fn poll_once(&self) {
        let args = self.args.lock().unwrap().clone();
        let dir = self.checkout_dir.clone();

        // git2 is blocking; keep it off the async workers.
        let fetched = tokio::task::spawn_blocking(move || fetch_content(&args, &dir))
            .await
            .unwrap_or_else(|err| Err(SourceError::Git(err.to_string())));

        match fetched {
            Ok(content) => {
                *self.health.lock().unwrap() = Health::healthy("repository fetched");
                self.tracker.deliver(content);
            }
            Err(err) => {
                warn!(%err, "failed to fetch module from git");
                *self.health.lock().unwrap() = Health::unhealthy(err.to_string());
            }
        }
    }
}

#[async_trait]
impl ImportSource for GitSource {
    fn update(&self, args: Value) -> Result<(), SourceError> {
        let args: GitArguments = decode_arguments(args)?;
        *self.args.lock().unwrap() = args;
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

fn fetch_options(args: &GitArguments) -> FetchOptions<'_> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(auth) = args.basic_auth.clone() {
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext(&auth.username, &auth.password)
        });
    }
    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}

fn fetch_content(args: &GitArguments, dir: &Path) -> Result<String, SourceError> {
    let repo = open_or_clone(args, dir)?;

    {
        let mut remote = repo
            .find_remote("origin")
            .map_err(|err| SourceError::Git(err.to_string()))?;
        remote
            .fetch(&[] as &[&str], Some(&mut fetch_options(args)), None)
            .map_err(|err| SourceError::Git(err.to_string()))?;
    }

    read_blob(&repo, &args.revision, &args.path)
}

fn open_or_clone(args: &GitArguments, dir: &Path) -> Result<Repository, SourceError> {
    if let Ok(repo) = Repository::open(dir) {
        return Ok(repo);
    }
    std::fs::create_dir_all(dir).map_err(|err| SourceError::Git(err.to_string()))?;
    RepoBuilder::new()
        .fetch_options(fetch_options(args))
        .clone(&args.repository, dir)
        .map_err(|err| SourceError::Git(err.to_string()))
}

fn read_blob(repo: &Repository, revision: &str, path: &str) -> Result<String, SourceError> {
    let object = repo
        .revparse_single(revision)
        .map_err(|err| SourceError::Git(format!("unknown revision `{revision}`: {err}")))?;
    let commit = object
        .peel_to_commit()
        .map_err(|err| SourceError::Git(err.to_string()))?;
    let tree = commit
        .tree()
        .map_err(|err| SourceError::Git(err.to_string()))?;
    let entry = tree
        .get_path(Path::new(path))
        .map_err(|err| SourceError::Git(format!("no file `{path}` at `{revision}`: {err}")))?;
    let blob = repo
        .find_blob(entry.id())
        .map_err(|err| SourceError::Git(err.to_string()))?;
    String::from_utf8(blob.content().to_vec())
        .map_err(|_| SourceError::Git(format!("`{path}` is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_arguments_validation() {
        let sink: ContentSink = Arc::new(|_| {});
        let source = GitSource::new(PathBuf::from("/tmp/unused"), sink);

        assert!(source.update(json!({})).is_err());
        assert!(source.update(json!({"repository": "https://example.com/mods.git"})).is_err());
        assert!(source
            .update(json!({
                "repository": "https://example.com/mods.git",
                "path": "modules/main",
                "revision": "v1.2.0",
                "basic_auth": {"username": "ci", "password": "token"},
            }))
            .is_ok());
        assert_eq!(source.arguments()["revision"], "v1.2.0");
    }

    #[test]
    fn test_reads_blob_from_local_repository() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("module"), "declare \"t\" {}").unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new("module")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@localhost").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "add module", &tree, &[])
            .unwrap();

        let content = read_blob(&repo, "HEAD", "module").unwrap();
        assert_eq!(content, "declare \"t\" {}");

        let err = read_blob(&repo, "HEAD", "missing").unwrap_err();
        assert!(matches!(err, SourceError::Git(_)));
    }
}
