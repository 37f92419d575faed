use crate::types::Domain;

/// URL roots for Apple's identity and setup services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub auth: String,
    pub home: String,
    pub setup: String,
}

impl Endpoints {
    pub fn for_domain(domain: Domain) -> Self {
        match domain {
            Domain::Com => Self {
                auth: "https://idmsa.apple.com/appleauth/auth".into(),
                home: "https://www.icloud.com".into(),
                setup: "https://setup.icloud.com/setup/ws/1".into(),
            },
            Domain::Cn => Self {
                auth: "https://idmsa.apple.com.cn/appleauth/auth".into(),
                home: "https://www.icloud.com.cn".into(),
                setup: "https://setup.icloud.com.cn/setup/ws/1".into(),
            },
        }
    }

    /// Point every root at one base URL; used by tests.
    #[cfg(test)]
    pub fn rooted_at(base: &str) -> Self {
        Self {
            auth: format!("{base}/appleauth/auth"),
            home: base.to_string(),
            setup: format!("{base}/setup/ws/1"),
        }
    }
}
