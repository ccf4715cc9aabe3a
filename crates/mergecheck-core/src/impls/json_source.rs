//! Change-request metadata exported to JSON files.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::GenerateError;
use crate::domain::change::{ChangeRequest, ChangeRequestRef};
use crate::ports::ChangeRequestSource;

/// Reads a JSON file holding one `ChangeRequest` or an array of them.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<ChangeRequest>, GenerateError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| GenerateError::Source(format!("{}: {e}", self.path.display())))?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| GenerateError::Source(format!("{}: {e}", self.path.display())))?;
        let parsed = if value.is_array() {
            serde_json::from_value(value)
        } else {
            serde_json::from_value(value).map(|one| vec![one])
        };
        parsed.map_err(|e| GenerateError::Source(format!("{}: {e}", self.path.display())))
    }
}

#[async_trait]
impl ChangeRequestSource for JsonFileSource {
    async fn fetch(&self, reference: &ChangeRequestRef) -> Result<ChangeRequest, GenerateError> {
        self.load()
            .await?
            .into_iter()
            .find(|cr| &cr.reference == reference)
            .ok_or_else(|| GenerateError::NotFound(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METADATA: &str = r#"[
        {
            "owner": "octo", "repo": "widgets", "number": 42,
            "title": "Add gizmo",
            "target_repo_url": "https://github.com/octo/widgets.git",
            "source_repo_url": "https://github.com/fork/widgets.git",
            "target": {"branch": "main", "commit": "1111111"},
            "source": {"branch": "gizmo", "commit": "2222222"},
            "root_files": ["build.gradle", "settings.gradle"]
        },
        {
            "owner": "octo", "repo": "widgets", "number": 43,
            "target_repo_url": "https://github.com/octo/widgets.git",
            "target": {"branch": "main", "commit": "1111111"},
            "source": {"branch": "fix", "commit": "3333333"}
        }
    ]"#;

    #[tokio::test]
    async fn finds_requested_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prs.json");
        std::fs::write(&path, METADATA).unwrap();
        let source = JsonFileSource::new(&path);

        let reference: ChangeRequestRef = "https://github.com/octo/widgets/pull/42".parse().unwrap();
        let cr = source.fetch(&reference).await.unwrap();
        assert_eq!(cr.title.as_deref(), Some("Add gizmo"));
        assert_eq!(cr.root_files.len(), 2);

        let missing: ChangeRequestRef = "https://github.com/octo/widgets/pull/99".parse().unwrap();
        assert!(matches!(
            source.fetch(&missing).await,
            Err(GenerateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn accepts_a_single_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pr.json");
        let one: serde_json::Value = serde_json::from_str(METADATA).unwrap();
        std::fs::write(&path, one[1].to_string()).unwrap();

        let reference: ChangeRequestRef = "github.com/octo/widgets/pull/43".parse().unwrap();
        let cr = JsonFileSource::new(&path).fetch(&reference).await.unwrap();
        assert_eq!(cr.source.branch, "fix");
        assert!(cr.source_repo_url.is_none());
    }
}
