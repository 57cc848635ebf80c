use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level error codes surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
  // Environment (stage-2 pre-flight)
  RuntimeMissing,
  DependenciesMissing,
  VersionIncompatible,
  // Subprocess
  SidecarStartFailed,
  SidecarNotHealthy,
  // Client
  NetworkError,
  Timeout,
  HttpError,
  ParseError,
  // Parser
  ParseFailed,
  // Store
  SchemaMismatch,
  WriteFailed,
  OpenFailed,
  // Startup
  StartupTimeout,
  EmbedderInitFailed,
}

impl ErrorCode {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorCode::RuntimeMissing => "RUNTIME_MISSING",
      ErrorCode::DependenciesMissing => "DEPENDENCIES_MISSING",
      ErrorCode::VersionIncompatible => "VERSION_INCOMPATIBLE",
      ErrorCode::SidecarStartFailed => "SIDECAR_START_FAILED",
      ErrorCode::SidecarNotHealthy => "SIDECAR_NOT_HEALTHY",
      ErrorCode::NetworkError => "NETWORK_ERROR",
      ErrorCode::Timeout => "TIMEOUT",
      ErrorCode::HttpError => "HTTP_ERROR",
      ErrorCode::ParseError => "PARSE_ERROR",
      ErrorCode::ParseFailed => "PARSE_FAILED",
      ErrorCode::SchemaMismatch => "SCHEMA_MISMATCH",
      ErrorCode::WriteFailed => "WRITE_FAILED",
      ErrorCode::OpenFailed => "OPEN_FAILED",
      ErrorCode::StartupTimeout => "STARTUP_TIMEOUT",
      ErrorCode::EmbedderInitFailed => "EMBEDDER_INIT_FAILED",
    }
  }
}

impl std::fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Error, Debug)]
pub enum CoreError {
  #[error("{code}: {message}")]
  Typed {
    code: ErrorCode,
    message: String,
    details: Option<String>,
  },

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Config error: {0}")]
  Config(String),
}

impl CoreError {
  pub fn typed(code: ErrorCode, message: impl Into<String>) -> Self {
    CoreError::Typed {
      code,
      message: message.into(),
      details: None,
    }
  }

  pub fn typed_with_details(code: ErrorCode, message: impl Into<String>, details: impl Into<String>) -> Self {
    CoreError::Typed {
      code,
      message: message.into(),
      details: Some(details.into()),
    }
  }

  /// The wire code used in UI error envelopes.
  pub fn code(&self) -> ErrorCode {
    match self {
      CoreError::Typed { code, .. } => *code,
      CoreError::Io(_) => ErrorCode::OpenFailed,
      CoreError::Config(_) => ErrorCode::OpenFailed,
    }
  }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn wire_names_are_screaming_snake() {
    assert_eq!(ErrorCode::RuntimeMissing.as_str(), "RUNTIME_MISSING");
    assert_eq!(ErrorCode::SidecarNotHealthy.as_str(), "SIDECAR_NOT_HEALTHY");
    assert_eq!(ErrorCode::EmbedderInitFailed.as_str(), "EMBEDDER_INIT_FAILED");
  }

  #[test]
  fn serde_matches_as_str() {
    let json = serde_json::to_string(&ErrorCode::SchemaMismatch).unwrap();
    assert_eq!(json, "\"SCHEMA_MISMATCH\"");
    let back: ErrorCode = serde_json::from_str(&json).unwrap();
    assert_eq!(back, ErrorCode::SchemaMismatch);
  }

  #[test]
  fn typed_error_display() {
    let err = CoreError::typed(ErrorCode::RuntimeMissing, "python3 not found on PATH");
    assert_eq!(err.to_string(), "RUNTIME_MISSING: python3 not found on PATH");
    assert_eq!(err.code(), ErrorCode::RuntimeMissing);
  }
}
