// [libs/infra/server-client/src/errors.rs]

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("server base url is invalid: {0}")]
    InvalidBaseUrl(String),

    #[error("network failure: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server rejected request: {status} {detail}")]
    Rejected { status: u16, detail: String },

    #[error("digest mismatch for {name}: expected {expected}, computed {computed}")]
    DigestMismatch {
        name: String,
        expected: String,
        computed: String,
    },

    #[error("download io failure: {0}")]
    Io(#[from] std::io::Error),
}
