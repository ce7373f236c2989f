//! Project file browsing for the assistant
//!
//! Read-only access to the files of a single project, rooted at
//! `<projects_dir>/<project>`. Paths handed in by the model are checked
//! lexically, then canonicalized; anything that would leave the project root,
//! including through a symlink, is rejected.

use schemars::generate::SchemaSettings;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Maximum number of bytes returned by a single read
pub const MAX_READ_BYTES: usize = 100_000;

/// Maximum number of paths returned by a search
pub const MAX_SEARCH_HITS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum FilesystemError {
    #[error("Path escapes the project root: {0}")]
    OutsideRoot(String),
    #[error("Project not found: {0}")]
    ProjectNotFound(String),
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the `project_files` tool should do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    List,
    Read,
    Search,
}

/// Arguments accepted by the `project_files` tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProjectFilesArgs {
    #[schemars(description = "list a directory, read a file, or search file names")]
    pub action: FileAction,
    #[schemars(description = "Path relative to the project root (defaults to the root)")]
    #[serde(default)]
    pub path: Option<String>,
    #[schemars(description = "Case-insensitive substring matched against file names (search only)")]
    #[serde(default)]
    pub query: Option<String>,
}

/// JSON schema for [`ProjectFilesArgs`], with sub-schemas inlined so it can be
/// sent verbatim as a tool `input_schema`.
pub fn project_files_schema() -> serde_json::Value {
    let schema = SchemaSettings::draft07()
        .with(|s| s.inline_subschemas = true)
        .into_generator()
        .into_root_schema_for::<ProjectFilesArgs>();

    let mut value = serde_json::to_value(&schema).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// A single directory entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: &'static str,
    pub size: u64,
}

/// File contents returned by a read
#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub size: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct ProjectFiles {
    root: PathBuf,
}

impl ProjectFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root directory of a project. The project name must be a single path segment.
    pub fn project_root(&self, project: &str) -> Result<PathBuf, FilesystemError> {
        let mut components = Path::new(project).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(self.root.join(name)),
            _ => Err(FilesystemError::OutsideRoot(project.to_string())),
        }
    }

    /// Resolve a project-relative path. `..` and absolute paths are refused
    /// outright; symlinks are followed and must still land inside the project.
    async fn resolve(
        &self,
        project: &str,
        relative: Option<&str>,
    ) -> Result<PathBuf, FilesystemError> {
        let project_root = self.project_root(project)?;
        if !tokio::fs::metadata(&project_root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(FilesystemError::ProjectNotFound(project.to_string()));
        }
        let project_root = tokio::fs::canonicalize(&project_root).await?;

        let mut resolved = project_root.clone();
        if let Some(rel) = relative {
            for component in Path::new(rel).components() {
                match component {
                    Component::Normal(part) => resolved.push(part),
                    Component::CurDir => {}
                    _ => return Err(FilesystemError::OutsideRoot(rel.to_string())),
                }
            }
        }

        let resolved = tokio::fs::canonicalize(&resolved).await?;
        if !resolved.starts_with(&project_root) {
            return Err(FilesystemError::OutsideRoot(
                relative.unwrap_or_default().to_string(),
            ));
        }
        Ok(resolved)
    }

    /// List the contents of a directory, sorted by name
    pub async fn list(
        &self,
        project: &str,
        path: Option<&str>,
    ) -> Result<Vec<DirEntry>, FilesystemError> {
        let dir = self.resolve(project, path).await?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut items = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let kind = if metadata.is_dir() {
                "dir"
            } else if metadata.is_file() {
                "file"
            } else {
                "other"
            };
            items.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                kind,
                size: metadata.len(),
            });
        }

        items.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Listed {} entries in {}", items.len(), dir.display());
        Ok(items)
    }

    /// Read a file as text, truncated to [`MAX_READ_BYTES`]
    pub async fn read(&self, project: &str, path: &str) -> Result<FileContent, FilesystemError> {
        let file = self.resolve(project, Some(path)).await?;
        let bytes = tokio::fs::read(&file).await?;
        let size = bytes.len() as u64;
        let text = String::from_utf8_lossy(&bytes);

        let (content, truncated) = if text.len() > MAX_READ_BYTES {
            let mut end = MAX_READ_BYTES;
            while !text.is_char_boundary(end) && end > 0 {
                end -= 1;
            }
            (text[..end].to_string(), true)
        } else {
            (text.into_owned(), false)
        };

        Ok(FileContent {
            path: path.to_string(),
            content,
            size,
            truncated,
        })
    }

    /// Recursively find files whose name contains `query` (case-insensitive).
    /// Returns project-relative paths, sorted, capped at [`MAX_SEARCH_HITS`].
    pub async fn search(&self, project: &str, query: &str) -> Result<Vec<String>, FilesystemError> {
        let root = self.resolve(project, None).await?;
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        let mut stack = vec![root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path.clone());
                }
                let name = entry.file_name().to_string_lossy().to_lowercase();
                if name.contains(&needle) {
                    if let Ok(rel) = path.strip_prefix(&root) {
                        let rel: Vec<String> = rel
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().to_string())
                            .collect();
                        hits.push(rel.join("/"));
                    }
                }
            }
        }

        hits.sort();
        hits.truncate(MAX_SEARCH_HITS);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_fixture() -> (tempfile::TempDir, ProjectFiles) {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("plant");
        std::fs::create_dir_all(project.join("views/overview")).unwrap();
        std::fs::write(project.join("README.md"), "plant project").unwrap();
        std::fs::write(project.join("views/overview/view.json"), "{}").unwrap();
        let files = ProjectFiles::new(dir.path());
        (dir, files)
    }

    #[tokio::test]
    async fn test_list_directory() {
        let (_dir, files) = project_fixture();
        let entries = files.list("plant", None).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["README.md", "views"]);
        assert_eq!(entries[1].kind, "dir");
    }

    #[tokio::test]
    async fn test_read_file() {
        let (_dir, files) = project_fixture();
        let file = files.read("plant", "README.md").await.unwrap();
        assert_eq!(file.content, "plant project");
        assert!(!file.truncated);
    }

    #[tokio::test]
    async fn test_read_truncates_large_files() {
        let (dir, files) = project_fixture();
        let big = "x".repeat(MAX_READ_BYTES + 10);
        std::fs::write(dir.path().join("plant/big.txt"), big).unwrap();

        let file = files.read("plant", "big.txt").await.unwrap();
        assert!(file.truncated);
        assert_eq!(file.content.len(), MAX_READ_BYTES);
        assert_eq!(file.size, (MAX_READ_BYTES + 10) as u64);
    }

    #[tokio::test]
    async fn test_search_is_recursive_and_case_insensitive() {
        let (_dir, files) = project_fixture();
        let hits = files.search("plant", "VIEW").await.unwrap();
        assert_eq!(
            hits,
            vec!["views", "views/overview", "views/overview/view.json"]
        );
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let (_dir, files) = project_fixture();
        assert!(matches!(
            files.read("plant", "../secret.txt").await,
            Err(FilesystemError::OutsideRoot(_))
        ));
        assert!(matches!(
            files.list("../plant", None).await,
            Err(FilesystemError::OutsideRoot(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejects_symlink_out_of_project() {
        let (dir, files) = project_fixture();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "TOP-SECRET").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("plant/link")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("plant/secret-link.txt"),
        )
        .unwrap();

        assert!(matches!(
            files.read("plant", "link/secret.txt").await,
            Err(FilesystemError::OutsideRoot(_))
        ));
        assert!(matches!(
            files.read("plant", "secret-link.txt").await,
            Err(FilesystemError::OutsideRoot(_))
        ));
        assert!(matches!(
            files.list("plant", Some("link")).await,
            Err(FilesystemError::OutsideRoot(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_within_project_is_allowed() {
        let (dir, files) = project_fixture();
        std::os::unix::fs::symlink(
            dir.path().join("plant/README.md"),
            dir.path().join("plant/readme-link.md"),
        )
        .unwrap();

        let file = files.read("plant", "readme-link.md").await.unwrap();
        assert_eq!(file.content, "plant project");
    }

    #[test]
    fn test_unknown_project() {
        let (_dir, files) = project_fixture();
        assert!(matches!(
            tokio_test::block_on(files.list("missing", None)),
            Err(FilesystemError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn test_schema_lists_required_action() {
        let schema = project_files_schema();
        assert_eq!(schema["type"], "object");
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required, &vec![serde_json::json!("action")]);
        assert!(schema.get("$schema").is_none());
    }
}
