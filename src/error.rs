// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

use thiserror::Error;

/// Engine-wide error taxonomy. Kinds, not wrapped causes: callers match on
/// variant, never on the inner message text.
#[derive(Debug, Error)]
pub enum CalBridgeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed against {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("precondition failed (etag mismatch) at {0}")]
    Precondition(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("canceled")]
    Canceled,

    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, CalBridgeError>;

impl CalBridgeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CalBridgeError::NotFound(_))
            || matches!(self, CalBridgeError::Store(sqlx::Error::RowNotFound))
    }
}
