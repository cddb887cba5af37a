//! Error type shared across the workspace.

use thiserror::Error;

/// Everything that can go wrong between a transport packet and a broadcast.
///
/// Most variants are recoverable by policy: malformed documents keep the
/// previous tree, unknown joints are ignored or surfaced as 404, transport
/// and persistence failures are logged and the server keeps serving.
#[derive(Error, Debug)]
pub enum WebkinError {
    #[error("malformed tree document: {0}")]
    MalformedTree(String),

    #[error("duplicate node name: {0}")]
    DuplicateName(String),

    #[error("unknown joint: {0}")]
    UnknownJoint(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bundle error: {0}")]
    Bundle(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_joint() {
        let err = WebkinError::UnknownJoint("elbow".to_string());
        assert!(err.to_string().contains("elbow"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: WebkinError = io.into();
        assert!(matches!(err, WebkinError::Io(_)));
    }
}
