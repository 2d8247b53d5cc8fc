use thiserror::Error;

/// Failures raised by the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Timeouts, dropped connections, resource exhaustion. Safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// `(ukey, version)` already taken by another write.
    #[error("version {version} already exists for {ukey}")]
    Conflict { ukey: String, version: u64 },
    /// Schema mismatch, malformed row, rejected query. Never retried.
    #[error("store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_) => StoreError::Transient(err.to_string()),
            sqlx::Error::Database(db) => {
                let code = db.code().map(|code| code.into_owned()).unwrap_or_default();
                // 08 connection, 53 resources, 57 operator intervention, 40 rollback
                if ["08", "53", "57", "40"]
                    .iter()
                    .any(|class| code.starts_with(class))
                {
                    StoreError::Transient(err.to_string())
                } else {
                    StoreError::Fatal(err.to_string())
                }
            }
            _ => StoreError::Fatal(err.to_string()),
        }
    }
}

/// Failures raised while reading the upstream source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("upstream request failed: {0}")]
    Transient(String),
    #[error("upstream rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_transport_errors_are_transient() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::Conflict {
            ukey: "k".into(),
            version: 2
        }
        .is_transient());
    }
}
