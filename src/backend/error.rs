use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend configuration error: {0}")]
    Config(String),
    #[error("Failed to read seed file {path}: {source}")]
    SeedFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse seed data: {0}")]
    SeedParse(String),
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Backend responded to {url} with status {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("Invalid {table} row: {reason}")]
    InvalidRow { table: &'static str, reason: String },
    #[error("Insert into {table} was rejected: {reason}")]
    InsertRejected { table: &'static str, reason: String },
}

pub type Result<T, E = BackendError> = std::result::Result<T, E>;
