//! Insight Tools - read-only capabilities the assistant can use
//!
//! Tools are organized by category:
//! - filesystem: sandboxed browsing of project files

pub mod filesystem;

pub use filesystem::{
    project_files_schema, DirEntry, FileAction, FileContent, FilesystemError, ProjectFiles,
    ProjectFilesArgs,
};
