//! Path validation for job inputs and outputs.
//!
//! Every path crossing the orchestrator boundary is resolved to its real
//! location (following symlinks) and must land inside one of the allowed
//! roots. Traversal components are rejected before resolution so the error
//! names the attempt rather than a missing file.

use std::fs;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Errors raised when a path fails security validation.
#[derive(Debug, Error)]
pub enum PathSecurityError {
    #[error("empty path")]
    Empty,

    #[error("path traversal detected (..): {0}")]
    Traversal(String),

    #[error("invalid path: {path}: {source}")]
    Invalid {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("path outside allowed directories: {0}")]
    OutsideAllowed(String),

    #[error("path does not exist: {0}")]
    NotFound(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("file not readable: {0}")]
    NotReadable(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("parent directory does not exist: {0}")]
    ParentMissing(String),

    #[error("directory not writable: {0}")]
    NotWritable(String),
}

/// The set of directory roots a job may read from or write under.
#[derive(Debug, Clone)]
pub struct AllowedRoots {
    roots: Vec<PathBuf>,
}

impl AllowedRoots {
    /// Build from explicit roots. Roots that cannot be resolved are skipped.
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let roots = roots
            .into_iter()
            .filter_map(|root| fs::canonicalize(root.as_ref()).ok())
            .collect();
        Self { roots }
    }

    /// The standard root set: the workspace root, the jobs directory, the
    /// user home directory and the system tmp directory.
    pub fn discover(workspace_root: &Path, jobs_path: &Path) -> Self {
        let mut candidates = vec![workspace_root.to_path_buf(), jobs_path.to_path_buf()];
        if let Some(home) = dirs::home_dir() {
            candidates.push(home);
        }
        candidates.push(std::env::temp_dir());
        let roots = Self::new(candidates);
        debug!("allowed path roots: {:?}", roots.roots);
        roots
    }

    /// Whether `path` (already canonical) is one of the roots or below one.
    pub fn contains(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }
}

/// Validate and normalise a raw path.
///
/// Trims surrounding whitespace and quotes, rejects `..` components,
/// resolves symlinks and requires the result to sit under an allowed root.
/// With `must_exist` the path itself must resolve; otherwise the parent
/// directory must, and the final component is appended unresolved.
pub fn validate_path(
    raw: &str,
    roots: &AllowedRoots,
    must_exist: bool,
) -> Result<PathBuf, PathSecurityError> {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'');
    if trimmed.is_empty() {
        return Err(PathSecurityError::Empty);
    }

    let path = Path::new(trimmed);
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(PathSecurityError::Traversal(trimmed.to_string()));
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|source| PathSecurityError::Invalid {
                path: trimmed.to_string(),
                source,
            })?
            .join(path)
    };

    let real = match fs::canonicalize(&absolute) {
        Ok(real) => real,
        Err(source) if must_exist => {
            return if source.kind() == std::io::ErrorKind::NotFound {
                Err(PathSecurityError::NotFound(trimmed.to_string()))
            } else {
                Err(PathSecurityError::Invalid {
                    path: trimmed.to_string(),
                    source,
                })
            };
        }
        Err(_) => {
            // Path may not exist yet: resolve the parent, keep the leaf.
            let parent = absolute
                .parent()
                .ok_or_else(|| PathSecurityError::ParentMissing(trimmed.to_string()))?;
            let file_name = absolute
                .file_name()
                .ok_or_else(|| PathSecurityError::ParentMissing(trimmed.to_string()))?;
            let real_parent = fs::canonicalize(parent)
                .map_err(|_| PathSecurityError::ParentMissing(trimmed.to_string()))?;
            real_parent.join(file_name)
        }
    };

    if !roots.contains(&real) {
        return Err(PathSecurityError::OutsideAllowed(trimmed.to_string()));
    }

    Ok(real)
}

/// Validate an input file path: must exist, be a regular file and be readable.
pub fn validate_input_path(raw: &str, roots: &AllowedRoots) -> Result<PathBuf, PathSecurityError> {
    let real = validate_path(raw, roots, true)?;
    if !real.is_file() {
        return Err(PathSecurityError::NotAFile(raw.trim().to_string()));
    }
    if fs::File::open(&real).is_err() {
        return Err(PathSecurityError::NotReadable(raw.trim().to_string()));
    }
    Ok(real)
}

/// Validate an output file path: the parent directory must exist and be
/// writable; the file itself may or may not exist.
pub fn validate_output_path(raw: &str, roots: &AllowedRoots) -> Result<PathBuf, PathSecurityError> {
    let real = validate_path(raw, roots, false)?;
    let parent = real
        .parent()
        .ok_or_else(|| PathSecurityError::ParentMissing(raw.trim().to_string()))?;
    let metadata = fs::metadata(parent)
        .map_err(|_| PathSecurityError::ParentMissing(raw.trim().to_string()))?;
    if metadata.permissions().readonly() {
        return Err(PathSecurityError::NotWritable(parent.display().to_string()));
    }
    Ok(real)
}

/// Validate a directory path.
pub fn validate_directory_path(
    raw: &str,
    roots: &AllowedRoots,
    must_exist: bool,
) -> Result<PathBuf, PathSecurityError> {
    let real = validate_path(raw, roots, must_exist)?;
    if must_exist && !real.is_dir() {
        return Err(PathSecurityError::NotADirectory(raw.trim().to_string()));
    }
    Ok(real)
}

/// Restrict a filename to `[A-Za-z0-9._-]`, convert hidden-file leaders and
/// never return an empty name.
pub fn sanitize_filename(filename: &str) -> String {
    let basename = Path::new(filename)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut sanitized: String = basename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if let Some(rest) = sanitized.strip_prefix('.') {
        sanitized = format!("_{rest}");
    }
    if sanitized.is_empty() {
        sanitized = "unnamed".to_string();
    }
    sanitized
}
