use serde_json::json;

use super::error::AuthError;
use super::responses::TrustedDevicesResponse;
use super::{ask, AuthSessionMachine};
use crate::gateway::vendor_error::WRONG_VERIFICATION_CODE;
use crate::gateway::GatewayRequest;

const TWO_FA_CODE_LENGTH: usize = 6;

impl AuthSessionMachine {
    /// Complete whatever second factor the account snapshot demands.
    pub async fn verify_2fa(&mut self) -> Result<(), AuthError> {
        let (requires_2fa, requires_2sa, trusted) = {
            let snapshot = self
                .snapshot
                .as_ref()
                .filter(|s| s.ds_info.is_some())
                .ok_or(AuthError::NotAuthenticated)?;
            (
                snapshot.requires_2fa(),
                snapshot.requires_2sa(),
                snapshot.hsa_trusted_browser,
            )
        };

        if requires_2fa {
            tracing::info!("Two-factor authentication is required");
            let code = ask(&self.credentials.two_fa_code, &self.credentials.account).await?;
            self.validate_2fa_code(code.trim()).await?;
            if !trusted {
                self.trust_session().await?;
            }
            return Ok(());
        }

        if requires_2sa {
            tracing::info!("Two-step authentication required. Your trusted devices are:");
            let devices = self.trusted_devices().await?;
            for (i, device) in devices.iter().enumerate() {
                tracing::info!("  {i}: {device}");
            }
            return Err(AuthError::TwoStepUnsupported { devices });
        }

        Ok(())
    }

    /// POST the code to `{auth}/verify/trusteddevice/securitycode`.
    pub async fn validate_2fa_code(&mut self, code: &str) -> Result<(), AuthError> {
        if code.len() != TWO_FA_CODE_LENGTH || !code.chars().all(|c| c.is_ascii_digit()) {
            tracing::error!("Invalid 2FA code: must be exactly {TWO_FA_CODE_LENGTH} digits");
            return Err(AuthError::WrongCode);
        }

        let request = GatewayRequest::post(format!(
            "{}/verify/trusteddevice/securitycode",
            self.endpoints.auth
        ))
        .headers(self.auth_headers(Some("application/json")).await)
        .json(json!({ "securityCode": { "code": code } }))
        .expect(&[204]);

        match self.client.request(&request).await {
            Ok(_) => {
                tracing::debug!("Code verification successful");
                Ok(())
            }
            Err(e) if e.vendor().is_some_and(|v| v.code == WRONG_VERIFICATION_CODE) => {
                tracing::error!("Code verification failed: wrong code");
                Err(AuthError::WrongCode)
            }
            Err(source) => Err(AuthError::Request {
                what: "verify security code",
                source,
            }),
        }
    }

    /// Ask Apple to remember this browser, then refresh the account snapshot.
    pub async fn trust_session(&mut self) -> Result<(), AuthError> {
        let request = GatewayRequest::get(format!("{}/2sv/trust", self.endpoints.auth))
            .headers(self.auth_headers(None).await)
            .expect(&[204]);
        self.client
            .request(&request)
            .await
            .map_err(|source| AuthError::Request {
                what: "trust session",
                source,
            })?;
        tracing::debug!("Session trusted successfully");
        self.auth_with_token().await
    }

    /// Devices registered for legacy two-step verification.
    pub async fn trusted_devices(&self) -> Result<Vec<String>, AuthError> {
        let request = GatewayRequest::post(format!("{}/listDevices", self.endpoints.setup));
        let text = self
            .client
            .request(&request)
            .await
            .map_err(|source| AuthError::Request {
                what: "listDevices",
                source,
            })?;
        let resp: TrustedDevicesResponse = serde_json::from_str(&text).map_err(|source| {
            AuthError::Json {
                what: "listDevices",
                source,
            }
        })?;
        Ok(resp.devices.iter().map(|d| d.display_name()).collect())
    }
}
