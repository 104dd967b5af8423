//! Error types for stratos-templates.

/// Result type alias using [`TemplatesError`].
pub type TemplatesResult<T> = Result<T, TemplatesError>;

/// Errors that can occur while building a compressed template archive.
#[derive(Debug, thiserror::Error)]
pub enum TemplatesError {
    /// I/O error on the temporary archive file.
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A template entry does not fit in a tar header.
    #[error("template entry too large: {path}")]
    EntryTooLarge {
        /// Path of the entry inside the archive.
        path: String,
    },
}
