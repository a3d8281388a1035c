//! # Error Types
//!
//! Semantic error kinds for the record pipeline. Per-record failures are
//! logged and skipped by callers; failures that would prevent a `"Last *"`
//! state checkpoint from being accurate abort the surrounding pass instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    /// Missing or malformed configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// No driver registered for a record's format; fatal for that record.
    #[error("no driver registered for format '{0}'")]
    UnsupportedFormat(String),

    /// Malformed metadata payload or envelope; the record is skipped.
    #[error("parse error: {0}")]
    Parse(String),

    /// Record has neither a driver-provided id nor an OAI id.
    #[error("record has neither a driver id nor an OAI id")]
    EmptyId,

    /// Network failure that survived the retry budget.
    #[error("network failure after {attempts} attempt(s): {message}")]
    TransientNetwork { attempts: u32, message: String },

    /// Insert hit an existing key. Ignored for uriCache and queue writes,
    /// surfaced for record writes.
    #[error("duplicate key in {collection}: {id}")]
    DuplicateKey { collection: String, id: String },

    /// Found by the consistency check; logged and repaired, never fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Signal-requested termination; state has been flushed.
    #[error("operation cancelled")]
    Cancelled,

    /// Mapping file line without a ` = ` separator.
    #[error("malformed mapping in {file} line {line}: missing ' = '")]
    MalformedMapping { file: String, line: usize },

    /// Non-2xx response from the Solr update endpoint.
    #[error("Solr request failed with status {status}: {body}")]
    Solr { status: u16, body: String },

    /// Backend storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RecordError {
    /// True for duplicate-key errors, which some writers tolerate.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, RecordError::DuplicateKey { .. })
    }
}

impl From<reqwest::Error> for RecordError {
    fn from(err: reqwest::Error) -> Self {
        RecordError::TransientNetwork {
            attempts: 1,
            message: err.to_string(),
        }
    }
}

impl From<rocksdb::Error> for RecordError {
    fn from(err: rocksdb::Error) -> Self {
        RecordError::Storage(err.to_string())
    }
}
