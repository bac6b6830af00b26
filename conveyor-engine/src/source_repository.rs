//! Per-build artifact sources.
//!
//! Gets and puts register the artifacts they materialize under their step
//! name; tasks and task config files consume them. The repository belongs
//! to exactly one build and is only mutated by step registration.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncRead;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("failed to stream file: {0}")]
    StreamFailed(String),
}

/// An artifact materialized on a worker, readable file by file.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn stream_file(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, ArtifactError>;
}

#[derive(Default)]
pub struct SourceRepository {
    sources: Mutex<HashMap<String, Arc<dyn ArtifactSource>>>,
}

impl SourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, source: Arc<dyn ArtifactSource>) {
        self.sources.lock().unwrap().insert(name.to_string(), source);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ArtifactSource>> {
        self.sources.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;

    /// An artifact source backed by an in-memory file map.
    pub struct FakeArtifactSource {
        files: HashMap<String, Vec<u8>>,
    }

    impl FakeArtifactSource {
        pub fn new() -> Self {
            FakeArtifactSource {
                files: HashMap::new(),
            }
        }

        pub fn with_file(mut self, path: &str, contents: &[u8]) -> Self {
            self.files.insert(path.to_string(), contents.to_vec());
            self
        }
    }

    #[async_trait]
    impl ArtifactSource for FakeArtifactSource {
        async fn stream_file(
            &self,
            path: &str,
        ) -> Result<Box<dyn AsyncRead + Send + Unpin>, ArtifactError> {
            match self.files.get(path) {
                Some(contents) => Ok(Box::new(std::io::Cursor::new(contents.clone()))),
                None => Err(ArtifactError::FileNotFound(path.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeArtifactSource;
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn registered_sources_are_retrievable() {
        let repo = SourceRepository::new();
        assert!(repo.get("some-input").is_none());

        let source = Arc::new(FakeArtifactSource::new().with_file("task.yml", b"platform: linux"));
        repo.register("some-input", source);

        let source = repo.get("some-input").expect("registered");
        let mut reader = source.stream_file("task.yml").await.unwrap();
        let mut contents = String::new();
        reader.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "platform: linux");

        assert!(matches!(
            source.stream_file("missing").await,
            Err(ArtifactError::FileNotFound(_))
        ));
    }
}
