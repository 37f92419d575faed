use std::collections::HashMap;

use serde::Deserialize;

/// Account snapshot returned by `/accountLogin` and `/validate`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountLoginResponse {
    #[serde(default)]
    pub ds_info: Option<DsInfo>,
    #[serde(default)]
    pub webservices: HashMap<String, WebserviceEndpoint>,
    #[serde(default)]
    pub hsa_challenge_required: bool,
    #[serde(default)]
    pub hsa_trusted_browser: bool,
    #[serde(default)]
    pub apps: HashMap<String, AppCapability>,
    #[serde(default)]
    pub domain_to_use: Option<String>,
}

impl AccountLoginResponse {
    pub fn hsa_version(&self) -> i64 {
        self.ds_info.as_ref().map_or(0, |ds| ds.hsa_version)
    }

    /// Modern two-factor: HSA v2 and either challenged or untrusted.
    pub fn requires_2fa(&self) -> bool {
        self.hsa_version() == 2 && (self.hsa_challenge_required || !self.hsa_trusted_browser)
    }

    /// Legacy two-step verification.
    pub fn requires_2sa(&self) -> bool {
        self.hsa_version() >= 1 && (self.hsa_challenge_required || !self.hsa_trusted_browser)
    }

    pub fn can_launch_with_one_factor(&self, app: &str) -> bool {
        self.apps
            .get(app)
            .is_some_and(|a| a.can_launch_with_one_factor)
    }

    pub fn dsid(&self) -> Option<&str> {
        self.ds_info.as_ref().and_then(|ds| ds.dsid.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DsInfo {
    #[serde(default)]
    pub hsa_version: i64,
    #[serde(default)]
    pub dsid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebserviceEndpoint {
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppCapability {
    #[serde(default)]
    pub can_launch_with_one_factor: bool,
}

/// Response from `/listDevices`.
#[derive(Debug, Default, Deserialize)]
pub struct TrustedDevicesResponse {
    #[serde(default)]
    pub devices: Vec<TrustedDevice>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedDevice {
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub phone_number: String,
}

impl TrustedDevice {
    pub fn display_name(&self) -> String {
        if self.device_name.is_empty() {
            format!("SMS to {}", self.phone_number)
        } else {
            self.device_name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_login_response_full() {
        let json = r#"{
            "dsInfo": {"hsaVersion": 2, "dsid": "12345"},
            "webservices": {
                "ckdatabasews": {"url": "https://p123-ckdatabasews.icloud.com", "status": "active"}
            },
            "apps": {"photos": {"canLaunchWithOneFactor": true}, "mail": {}},
            "hsaChallengeRequired": true,
            "hsaTrustedBrowser": false,
            "domainToUse": null
        }"#;
        let resp: AccountLoginResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.hsa_version(), 2);
        assert_eq!(resp.dsid(), Some("12345"));
        assert!(resp.requires_2fa());
        assert!(resp.can_launch_with_one_factor("photos"));
        assert!(!resp.can_launch_with_one_factor("mail"));
        assert!(!resp.can_launch_with_one_factor("drive"));
        assert_eq!(
            resp.webservices["ckdatabasews"].url,
            "https://p123-ckdatabasews.icloud.com"
        );
    }

    #[test]
    fn test_account_login_response_minimal() {
        let resp: AccountLoginResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.ds_info.is_none());
        assert!(resp.webservices.is_empty());
        assert!(!resp.requires_2fa());
        assert!(!resp.requires_2sa());
    }

    #[test]
    fn test_two_factor_flags() {
        let snapshot = |hsa: i64, challenge: bool, trusted: bool| AccountLoginResponse {
            ds_info: Some(DsInfo {
                hsa_version: hsa,
                dsid: None,
            }),
            hsa_challenge_required: challenge,
            hsa_trusted_browser: trusted,
            ..Default::default()
        };
        assert!(snapshot(2, false, false).requires_2fa());
        assert!(!snapshot(2, false, true).requires_2fa());
        assert!(snapshot(2, true, true).requires_2fa());
        assert!(!snapshot(1, true, false).requires_2fa());
        assert!(snapshot(1, true, false).requires_2sa());
        assert!(!snapshot(0, true, false).requires_2sa());
    }

    #[test]
    fn test_device_names() {
        let resp: TrustedDevicesResponse = serde_json::from_str(
            r#"{"devices":[{"deviceName":"iPhone"},{"phoneNumber":"+1 ***-**-12"}]}"#,
        )
        .unwrap();
        let names: Vec<_> = resp.devices.iter().map(|d| d.display_name()).collect();
        assert_eq!(names, vec!["iPhone", "SMS to +1 ***-**-12"]);
    }
}
