//! Wire Error Types

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while encoding or decoding wire payloads
#[derive(Error, Debug)]
pub enum WireError {
    /// A payload could not be turned into JSON
    #[error("Encode error: {message}")]
    Encode {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A frame or payload did not match the expected shape
    #[error("Decode error: {message}")]
    Decode {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A patch could not be applied
    #[error(transparent)]
    Patch(#[from] PatchError),
}

impl WireError {
    /// Create an encode error with source
    pub fn encode_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Encode {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
            source: None,
        }
    }

    /// Create a decode error with source
    pub fn decode_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Decode {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Failures of [`crate::apply_patches`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("Patch path not found: {path}")]
    PathNotFound { path: String },

    #[error("Patch index {index} out of bounds (length {len}) at {path}")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("Patch target at {path} is not an object or array")]
    NotAContainer { path: String },

    #[error("Cannot remove the root value")]
    RemoveRoot,
}

/// An application error in transit
///
/// Handlers that fail on one side of a port are flattened into this shape and
/// rebuilt on the other side, so callers see an ordinary error with the original
/// message and cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializedError {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            cause: None,
            suggestion: None,
            stack: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Flatten any error, folding its source chain into `cause`
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(inner) = source {
            causes.push(inner.to_string());
            source = inner.source();
        }
        Self {
            title: error.to_string(),
            cause: if causes.is_empty() {
                None
            } else {
                Some(causes.join(": "))
            },
            suggestion: None,
            stack: None,
        }
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for SerializedError {}
