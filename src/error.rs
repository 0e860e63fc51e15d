use crate::storage::StorageError;

#[derive(Debug)]
pub enum EngineError {
    /// A snooze would land in the past, or the request itself is malformed.
    InvalidSchedule(String),
    /// The item map and the wake index disagree.
    StoreCorruption(String),
    Persistence(StorageError),
    /// The host could not reopen an item; it stays snoozed for a retry.
    Restore { item_id: String, reason: String },
    /// Imported data could not be used at all.
    Import(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidSchedule(reason) => write!(f, "invalid schedule: {reason}"),
            EngineError::StoreCorruption(reason) => write!(f, "store corruption: {reason}"),
            EngineError::Persistence(err) => write!(f, "persistence error: {err}"),
            EngineError::Restore { item_id, reason } => {
                write!(f, "restore of {item_id} failed: {reason}")
            }
            EngineError::Import(reason) => write!(f, "import rejected: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Persistence(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(value: StorageError) -> Self {
        EngineError::Persistence(value)
    }
}
