//! Kernel error domain.
//!
//! Every error surfaced by this crate carries exactly one stable numeric
//! code plus a human-readable message, so observers implement a single
//! handling path regardless of which component produced the failure.

use std::fmt;

/// Stable numeric error codes. The values are part of the public contract
/// and must not be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 1000,
    LicenseInvalid = 1001,
    LicenseExpired = 1002,
    NetworkError = 1003,
    CameraPermissionDenied = 1004,
    CameraNotAvailable = 1005,
    EffectLoadFailed = 1006,
    InitializationFailed = 1007,
    ResourceNotFound = 1008,
    InvalidParameter = 1009,
    MemoryError = 1010,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::LicenseInvalid => "license_invalid",
            ErrorCode::LicenseExpired => "license_expired",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::CameraPermissionDenied => "camera_permission_denied",
            ErrorCode::CameraNotAvailable => "camera_not_available",
            ErrorCode::EffectLoadFailed => "effect_load_failed",
            ErrorCode::InitializationFailed => "initialization_failed",
            ErrorCode::ResourceNotFound => "resource_not_found",
            ErrorCode::InvalidParameter => "invalid_parameter",
            ErrorCode::MemoryError => "memory_error",
        };
        write!(f, "{} ({})", name, self.as_i32())
    }
}

/// Kernel error value. One code, one message, optional underlying cause.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        code: ErrorCode,
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParameter, message)
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        // The boxed cause is not Clone; keep the code and message.
        Self {
            code: self.code,
            message: self.message.clone(),
            cause: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorCode::Unknown.as_i32(), 1000);
        assert_eq!(ErrorCode::LicenseInvalid.as_i32(), 1001);
        assert_eq!(ErrorCode::LicenseExpired.as_i32(), 1002);
        assert_eq!(ErrorCode::NetworkError.as_i32(), 1003);
        assert_eq!(ErrorCode::CameraPermissionDenied.as_i32(), 1004);
        assert_eq!(ErrorCode::CameraNotAvailable.as_i32(), 1005);
        assert_eq!(ErrorCode::EffectLoadFailed.as_i32(), 1006);
        assert_eq!(ErrorCode::InitializationFailed.as_i32(), 1007);
        assert_eq!(ErrorCode::ResourceNotFound.as_i32(), 1008);
        assert_eq!(ErrorCode::InvalidParameter.as_i32(), 1009);
        assert_eq!(ErrorCode::MemoryError.as_i32(), 1010);
    }

    #[test]
    fn display_carries_code_and_message() {
        let err = Error::new(ErrorCode::NetworkError, "transfer interrupted");
        let text = format!("{}", err);
        assert!(text.contains("1003"));
        assert!(text.contains("transfer interrupted"));
    }

    #[test]
    fn clone_drops_cause_but_keeps_code() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = Error::with_cause(ErrorCode::MemoryError, "write failed", io);
        let cloned = err.clone();
        assert_eq!(cloned.code, ErrorCode::MemoryError);
        assert!(cloned.cause.is_none());
        assert!(err.cause.is_some());
    }
}
