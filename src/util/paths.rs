//! Resolution of the directory holding the per-job log files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

/// Log directory used if none is configured.
pub const DEFAULT_LOG_DIRECTORY: &str = "/var/log/cnc";

#[derive(Debug, Display, Error)]
pub enum LogDirectoryError {
    /// Configured log directories have to be absolute.
    #[display("log directory must be an absolute path: {}", _0.display())]
    NotAbsolute(#[error(ignore)] PathBuf),
    /// The configured log directory can't be created.
    #[display("creating log directory {} failed: {source}", path.display())]
    Create { path: PathBuf, source: io::Error },
    /// Neither the default nor the current directory is usable.
    #[display("no usable log directory: {_0}")]
    NoFallback(io::Error),
}

/// Resolves the log directory.
///
/// A `configured` directory is created (with all parents) and used. Otherwise
/// [DEFAULT_LOG_DIRECTORY] is used if it can be created, with the current
/// directory as last resort.
pub fn resolve_log_directory(configured: Option<&Path>) -> Result<PathBuf, LogDirectoryError> {
    resolve_log_directory_with(configured, Path::new(DEFAULT_LOG_DIRECTORY))
}

/// [resolve_log_directory] with an explicit default directory.
pub fn resolve_log_directory_with(
    configured: Option<&Path>,
    default: &Path,
) -> Result<PathBuf, LogDirectoryError> {
    if let Some(dir) = configured {
        if !dir.is_absolute() {
            return Err(LogDirectoryError::NotAbsolute(dir.to_path_buf()));
        }
        ensure_writable_dir(dir).map_err(|source| LogDirectoryError::Create {
            path: dir.to_path_buf(),
            source,
        })?;
        return Ok(dir.to_path_buf());
    }

    match ensure_writable_dir(default) {
        Ok(()) => Ok(default.to_path_buf()),
        Err(e) => {
            log::warn!(
                target: "paths",
                "Can't use {} for log files ({e}), the current directory will be used",
                default.display()
            );
            std::env::current_dir().map_err(LogDirectoryError::NoFallback)
        }
    }
}

fn ensure_writable_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    if fs::metadata(dir)?.permissions().readonly() {
        return Err(io::Error::from(io::ErrorKind::PermissionDenied));
    }
    Ok(())
}

/// Replaces characters that don't belong into a file name component.
pub fn sanitize_file_component(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "unnamed".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn configured_directory_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested/logs");

        let resolved = resolve_log_directory_with(Some(&dir), Path::new("/unused")).unwrap();

        assert_eq!(resolved, dir);
        assert!(dir.is_dir());
    }

    #[test]
    fn relative_directory_is_rejected() {
        let err = resolve_log_directory_with(Some(Path::new("logs")), Path::new("/unused"))
            .unwrap_err();

        assert!(matches!(err, LogDirectoryError::NotAbsolute(_)));
    }

    #[test]
    fn default_directory_is_used_without_configuration() {
        let tmp = tempfile::tempdir().unwrap();
        let default = tmp.path().join("cnc");

        let resolved = resolve_log_directory_with(None, &default).unwrap();

        assert_eq!(resolved, default);
    }

    #[test]
    fn unusable_default_falls_back_to_current_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("not-a-dir");
        fs::write(&file, b"").unwrap();

        let resolved = resolve_log_directory_with(None, &file.join("cnc")).unwrap();

        assert_eq!(resolved, std::env::current_dir().unwrap());
    }

    #[rstest]
    #[case("dbA", "dbA")]
    #[case("sales/eu", "sales_eu")]
    #[case("my db", "my_db")]
    #[case("", "unnamed")]
    fn sanitizes_file_components(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_file_component(input), expected);
    }
}
