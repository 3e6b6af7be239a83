//! Response status validation.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::FetchError;

/// Strictness level applied to response status codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCheckMode {
    /// Never reject a response.
    None,
    /// Reject any status `>= 400`.
    CheckError,
    /// Reject anything other than exactly 200.
    #[default]
    #[serde(rename = "require_200")]
    Require200,
}

impl StatusCheckMode {
    /// Checks `status` for the response of `url`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Status`] carrying the code and URL when the status is
    /// rejected by this mode.
    pub fn check(self, status: u16, url: &str) -> Result<(), FetchError> {
        let rejected = match self {
            Self::None => false,
            Self::CheckError => status >= 400,
            Self::Require200 => status != 200,
        };
        if rejected {
            debug!(status, url, mode = ?self, "response status rejected");
            return Err(FetchError::status(url, status));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const URL: &str = "http://test/code";

    #[test]
    fn test_none_accepts_everything() {
        for status in [200, 204, 300, 404, 500] {
            assert!(StatusCheckMode::None.check(status, URL).is_ok());
        }
    }

    #[test]
    fn test_check_error_rejects_4xx_and_5xx() {
        for status in [200, 204, 300] {
            assert!(StatusCheckMode::CheckError.check(status, URL).is_ok());
        }
        for status in [400, 404, 500] {
            let err = StatusCheckMode::CheckError.check(status, URL).unwrap_err();
            assert_eq!(err.status_code(), Some(status));
        }
    }

    #[test]
    fn test_require_200_rejects_everything_else() {
        assert!(StatusCheckMode::Require200.check(200, URL).is_ok());
        for status in [204, 300, 404, 500] {
            let err = StatusCheckMode::Require200.check(status, URL).unwrap_err();
            assert_eq!(err.status_code(), Some(status));
            assert!(err.to_string().contains(URL));
        }
    }

    #[test]
    fn test_default_is_require_200() {
        assert_eq!(StatusCheckMode::default(), StatusCheckMode::Require200);
    }

    #[test]
    fn test_deserializes_snake_case() {
        let mode: StatusCheckMode = serde_json::from_str("\"check_error\"").unwrap();
        assert_eq!(mode, StatusCheckMode::CheckError);
        let mode: StatusCheckMode = serde_json::from_str("\"require_200\"").unwrap();
        assert_eq!(mode, StatusCheckMode::Require200);
    }
}
