use thiserror::Error;

use crate::gateway::vendor_error::WRONG_VERIFICATION_CODE;
use crate::gateway::GatewayError;

/// Custom error types for iCloud authentication.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid authentication token: {0}")]
    InvalidToken(#[source] GatewayError),

    #[error("Sign-in rejected: {0}")]
    CredentialsRejected(#[source] GatewayError),

    #[error("Service login for {service} failed: {source}")]
    ServiceLogin {
        service: String,
        #[source]
        source: Box<AuthError>,
    },

    #[error("Incorrect two-factor verification code")]
    WrongCode,

    /// The legacy two-step device-selection flow is not supported.
    #[error("Two-step authentication required but not supported (trusted devices: {})", devices.join(", "))]
    TwoStepUnsupported { devices: Vec<String> },

    #[error("Not authenticated: no account data to verify")]
    NotAuthenticated,

    #[error("Service not activated: {0}")]
    ServiceNotActivated(String),

    #[error("Apple insists on using {0} for your request. Please use --domain parameter")]
    DomainRedirect(String),

    #[error("{what} failed: {source}")]
    Request {
        what: &'static str,
        #[source]
        source: GatewayError,
    },

    #[error("Failed to decode {what} response: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Provider(String),

    #[error("login failed: {}", join_errors(.0))]
    LoginFailed(Vec<AuthError>),
}

fn join_errors(errors: &[AuthError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl AuthError {
    /// True when this error or any error joined or wrapped inside it
    /// satisfies `pred`.
    pub fn any(&self, pred: &dyn Fn(&AuthError) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            AuthError::LoginFailed(errors) => errors.iter().any(|e| e.any(pred)),
            AuthError::ServiceLogin { source, .. } => source.any(pred),
            _ => false,
        }
    }

    /// The user typed the wrong code; prompting again may succeed.
    pub fn is_wrong_code(&self) -> bool {
        self.any(&|e| match e {
            AuthError::WrongCode => true,
            AuthError::Request { source, .. } => source
                .vendor()
                .is_some_and(|v| v.code == WRONG_VERIFICATION_CODE),
            _ => false,
        })
    }

    pub fn is_unsupported_two_step(&self) -> bool {
        self.any(&|e| matches!(e, AuthError::TwoStepUnsupported { .. }))
    }

    #[cfg(test)]
    pub fn is_invalid_token(&self) -> bool {
        self.any(&|e| matches!(e, AuthError::InvalidToken(_)))
    }

    pub fn is_credentials_rejected(&self) -> bool {
        self.any(&|e| matches!(e, AuthError::CredentialsRejected(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::VendorError;

    fn vendor(code: &str) -> GatewayError {
        GatewayError::Vendor {
            method: reqwest::Method::POST,
            url: "https://idmsa.example/verify".into(),
            status: 400,
            source: VendorError::new(code, "nope"),
        }
    }

    #[test]
    fn test_joined_errors_render_in_order() {
        let err = AuthError::LoginFailed(vec![
            AuthError::NotAuthenticated,
            AuthError::ServiceNotActivated("ckdatabasews".into()),
        ]);
        assert_eq!(
            err.to_string(),
            "login failed: Not authenticated: no account data to verify; Service not activated: ckdatabasews"
        );
    }

    #[test]
    fn test_kinds_survive_joining() {
        let err = AuthError::LoginFailed(vec![
            AuthError::InvalidToken(vendor("-2")),
            AuthError::WrongCode,
        ]);
        assert!(err.is_wrong_code());
        assert!(err.is_invalid_token());
        assert!(!err.is_unsupported_two_step());

        let err = AuthError::LoginFailed(vec![AuthError::TwoStepUnsupported {
            devices: vec!["SMS to +1".into()],
        }]);
        assert!(err.is_unsupported_two_step());
        assert!(!err.is_wrong_code());
    }

    #[test]
    fn test_wrong_code_detected_from_vendor_payload() {
        let err = AuthError::ServiceLogin {
            service: "photos".into(),
            source: Box::new(AuthError::Request {
                what: "verify code",
                source: vendor(WRONG_VERIFICATION_CODE),
            }),
        };
        assert!(err.is_wrong_code());
    }
}
