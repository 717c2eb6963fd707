use std::time::Duration;

use crate::BlockIndex;

#[derive(thiserror::Error, Debug)]
/// Failure classes of a backup or restore run.
pub enum BackupError {
    /// The disk layer cannot be reached. Nothing was done yet.
    #[error("unable to connect to disk '{disk}' - {msg}")]
    Connect { disk: String, msg: String },

    /// Reading or writing a single block failed.
    #[error("I/O error on block {index} - {msg}")]
    Io { index: BlockIndex, msg: String },

    /// An asynchronous upload reported failure.
    #[error("upload of '{key}' failed - {msg}")]
    Upload { key: String, msg: String },

    /// The buffer pool was shut down while the run was active.
    #[error("buffer pool closed")]
    PoolClosed,

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// The incremental baseline does not fit the current disk.
    #[error("baseline backup '{backup_id}' is inconsistent - {msg}")]
    DedupMismatch { backup_id: String, msg: String },

    /// No upload finished within the watchdog timeout.
    #[error("upload pipeline stalled - no upload finished within {0:?}")]
    Stalled(Duration),

    #[error("operation aborted")]
    Aborted,
}

impl BackupError {
    pub fn not_found(kind: &'static str, id: &str) -> Self {
        BackupError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Transient block level failures are retried, everything else ends the run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackupError::Io { .. } | BackupError::Upload { .. })
    }
}

/// Extract the typed error from an `anyhow::Error`, if there is one.
pub fn backup_error(err: &anyhow::Error) -> Option<&BackupError> {
    err.downcast_ref::<BackupError>()
}

/// Whether a failed block operation may be attempted again.
///
/// Untyped errors are treated as transient; the retry count bounds them.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    match backup_error(err) {
        Some(err) => err.is_retryable(),
        None => true,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let io: anyhow::Error = BackupError::Io {
            index: 3,
            msg: "short read".to_string(),
        }
        .into();
        assert!(is_retryable(&io));

        let closed: anyhow::Error = BackupError::PoolClosed.into();
        assert!(!is_retryable(&closed));

        let missing: anyhow::Error = BackupError::not_found("backup", "b1").into();
        assert_eq!(missing.to_string(), "backup 'b1' not found");
        assert!(!is_retryable(&missing));

        assert!(is_retryable(&anyhow::format_err!("connection reset")));
    }
}
