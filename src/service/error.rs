use thiserror::Error;

use super::api_types::ApiErrorBody;

/// Every failure surfaced by the gateway and the cache-aware client.
///
/// The display form is always a message fit to show the user.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
  /// The request never produced a response.
  #[error("{0}")]
  Transport(String),

  /// The service answered with a non-success status.
  #[error("{message}")]
  Server { status: u16, message: String },

  /// The response could not be decoded.
  #[error("{0}")]
  Decode(String),

  /// Input rejected locally before any request was made.
  #[error("{0}")]
  Validation(String),
}

impl ServiceError {
  pub fn validation(message: impl Into<String>) -> Self {
    ServiceError::Validation(message.into())
  }

  /// Build a server error from a response body, falling back to `fallback`
  /// when the body carries no usable message.
  pub fn from_response(status: u16, body: &[u8], fallback: &str) -> Self {
    let message = serde_json::from_slice::<ApiErrorBody>(body)
      .ok()
      .and_then(ApiErrorBody::into_message)
      .unwrap_or_else(|| fallback.to_string());

    ServiceError::Server { status, message }
  }
}
