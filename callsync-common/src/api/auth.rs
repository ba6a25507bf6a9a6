//! Scheduler identity validation via bearer tokens
//!
//! # Architecture
//!
//! - Trigger endpoints require `Authorization: Bearer <token>`
//! - The token is issued to the hosting platform's scheduler identity
//! - Missing or malformed header → `MissingToken` / `MalformedHeader` (401)
//! - Well-formed but unknown token → `InvalidToken` (403)
//! - No configured token → every request is `NotConfigured` (403)
//!
//! Tokens are compared by SHA-256 digest so the comparison time does not
//! depend on how many leading bytes match.
//!
//! # Pure Functions
//!
//! No HTTP framework dependencies; the axum middleware lives in the service crate.

use sha2::{Digest, Sha256};

// ========================================
// Error Types
// ========================================

/// Authentication error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiAuthError {
    /// No Authorization header present
    MissingToken,

    /// Authorization header present but not `Bearer <token>`
    MalformedHeader(String),

    /// Token does not belong to the scheduler identity
    InvalidToken,

    /// No scheduler token is configured, so no caller can be verified
    NotConfigured,
}

impl ApiAuthError {
    /// True for failures that mean "who are you?" (401) rather than "not allowed" (403)
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, ApiAuthError::MissingToken | ApiAuthError::MalformedHeader(_))
    }
}

impl std::fmt::Display for ApiAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiAuthError::MissingToken => write!(f, "Missing bearer token"),
            ApiAuthError::MalformedHeader(reason) => {
                write!(f, "Malformed Authorization header: {}", reason)
            }
            ApiAuthError::InvalidToken => write!(f, "Token not accepted for this endpoint"),
            ApiAuthError::NotConfigured => write!(f, "No scheduler token configured"),
        }
    }
}

impl std::error::Error for ApiAuthError {}

// ========================================
// Header Parsing
// ========================================

/// Extract the token from an `Authorization` header value
///
/// # Examples
///
/// ```
/// use callsync_common::api::auth::parse_bearer;
///
/// assert_eq!(parse_bearer(Some("Bearer abc.def")).unwrap(), "abc.def");
/// assert!(parse_bearer(Some("Basic dXNlcg==")).is_err());
/// assert!(parse_bearer(None).is_err());
/// ```
pub fn parse_bearer(header: Option<&str>) -> Result<&str, ApiAuthError> {
    let value = header.ok_or(ApiAuthError::MissingToken)?;
    let value = value.trim();

    let (scheme, token) = value
        .split_once(' ')
        .ok_or_else(|| ApiAuthError::MalformedHeader("expected 'Bearer <token>'".to_string()))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(ApiAuthError::MalformedHeader(format!(
            "unsupported scheme '{}'",
            scheme
        )));
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(ApiAuthError::MalformedHeader("empty token".to_string()));
    }

    Ok(token)
}

// ========================================
// Token Verification
// ========================================

/// Verifies bearer tokens against the configured scheduler token
#[derive(Clone)]
pub struct TokenVerifier {
    expected_digest: Option<[u8; 32]>,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl TokenVerifier {
    /// Build a verifier; `None` or a blank token rejects every request
    pub fn new(expected_token: Option<&str>) -> Self {
        let expected_digest = expected_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(digest);
        Self { expected_digest }
    }

    pub fn is_enabled(&self) -> bool {
        self.expected_digest.is_some()
    }

    /// Validate a raw `Authorization` header value
    pub fn verify_header(&self, header: Option<&str>) -> Result<(), ApiAuthError> {
        let token = parse_bearer(header)?;
        let Some(expected) = &self.expected_digest else {
            return Err(ApiAuthError::NotConfigured);
        };

        if digest(token) != *expected {
            return Err(ApiAuthError::InvalidToken);
        }
        Ok(())
    }
}

fn digest(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

// ========================================
// Tests
// ========================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_scheme_is_case_insensitive() {
        assert_eq!(parse_bearer(Some("bearer tok")).unwrap(), "tok");
        assert_eq!(parse_bearer(Some("BEARER   tok ")).unwrap(), "tok");
    }

    #[test]
    fn test_missing_and_malformed_headers() {
        assert_eq!(parse_bearer(None), Err(ApiAuthError::MissingToken));
        assert!(matches!(
            parse_bearer(Some("Bearer")),
            Err(ApiAuthError::MalformedHeader(_))
        ));
        assert!(matches!(
            parse_bearer(Some("Token abc")),
            Err(ApiAuthError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_verifier_accepts_matching_token() {
        let verifier = TokenVerifier::new(Some("scheduler-secret"));
        assert!(verifier.is_enabled());
        assert!(verifier.verify_header(Some("Bearer scheduler-secret")).is_ok());
    }

    #[test]
    fn test_verifier_rejects_wrong_token_as_forbidden() {
        let verifier = TokenVerifier::new(Some("scheduler-secret"));
        let err = verifier.verify_header(Some("Bearer other")).unwrap_err();
        assert_eq!(err, ApiAuthError::InvalidToken);
        assert!(!err.is_unauthenticated());
    }

    #[test]
    fn test_verifier_missing_header_is_unauthenticated() {
        let verifier = TokenVerifier::new(Some("scheduler-secret"));
        let err = verifier.verify_header(None).unwrap_err();
        assert!(err.is_unauthenticated());
    }

    #[test]
    fn test_unconfigured_verifier_rejects_everything() {
        let verifier = TokenVerifier::new(Some("   "));
        assert!(!verifier.is_enabled());
        assert_eq!(
            verifier.verify_header(Some("Bearer anything")),
            Err(ApiAuthError::NotConfigured)
        );
        assert!(verifier.verify_header(None).unwrap_err().is_unauthenticated());

        let err = TokenVerifier::new(None).verify_header(Some("Bearer x")).unwrap_err();
        assert!(!err.is_unauthenticated());
    }

    #[test]
    fn test_debug_does_not_leak_token() {
        let verifier = TokenVerifier::new(Some("scheduler-secret"));
        let rendered = format!("{:?}", verifier);
        assert!(!rendered.contains("scheduler-secret"));
    }
}
