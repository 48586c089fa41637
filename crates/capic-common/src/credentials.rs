//! Cloud API credentials
//!
//! Parsed from the Secret referenced by `IonosCloudCluster.spec.credentialsRef`.
//! Either a token or a username/password pair is required.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;

use crate::Error;

/// Secret key holding an API token
pub const TOKEN_KEY: &str = "IONOS_TOKEN";
/// Secret key holding the account user name
pub const USERNAME_KEY: &str = "IONOS_USERNAME";
/// Secret key holding the account password
pub const PASSWORD_KEY: &str = "IONOS_PASSWORD";
/// Secret key overriding the API base URL
pub const API_URL_KEY: &str = "IONOS_API_URL";

/// How requests authenticate
#[derive(Clone, PartialEq, Eq)]
pub enum CloudAuth {
    /// Bearer token
    Token(String),
    /// HTTP basic authentication
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
}

impl std::fmt::Debug for CloudAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(<redacted>)"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Credentials for the cloud API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudCredentials {
    /// Authentication material
    pub auth: CloudAuth,
    /// Optional API base URL override
    pub api_url: Option<String>,
    /// Optional contract number sent with every request
    pub contract_number: Option<String>,
}

impl CloudCredentials {
    /// Parse credentials from a Secret's string map
    pub fn from_map(resource: &str, data: &BTreeMap<String, String>) -> Result<Self, Error> {
        let non_empty = |key: &str| {
            data.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let auth = match (non_empty(TOKEN_KEY), non_empty(USERNAME_KEY), non_empty(PASSWORD_KEY)) {
            (Some(token), _, _) => CloudAuth::Token(token),
            (None, Some(username), Some(password)) => CloudAuth::Basic { username, password },
            _ => {
                return Err(Error::credentials_invalid(
                    resource,
                    format!(
                        "secret must contain {} or both {} and {}",
                        TOKEN_KEY, USERNAME_KEY, PASSWORD_KEY
                    ),
                ))
            }
        };

        Ok(Self {
            auth,
            api_url: non_empty(API_URL_KEY),
            contract_number: None,
        })
    }

    /// Parse credentials from a Secret, merging `data` and `stringData`
    pub fn from_secret(resource: &str, secret: &Secret) -> Result<Self, Error> {
        let mut map = BTreeMap::new();
        if let Some(data) = &secret.data {
            for (k, v) in data {
                let value = String::from_utf8(v.0.clone()).map_err(|_| {
                    Error::credentials_invalid(resource, format!("secret key {} is not valid UTF-8", k))
                })?;
                map.insert(k.clone(), value);
            }
        }
        if let Some(string_data) = &secret.string_data {
            for (k, v) in string_data {
                map.insert(k.clone(), v.clone());
            }
        }
        Self::from_map(resource, &map)
    }

    /// Attach a contract number
    pub fn with_contract_number(mut self, contract: Option<String>) -> Self {
        self.contract_number = contract;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_token_wins_over_basic() {
        let creds = CloudCredentials::from_map(
            "default/c1",
            &map(&[(TOKEN_KEY, "tok"), (USERNAME_KEY, "u"), (PASSWORD_KEY, "p")]),
        )
        .expect("valid");
        assert_eq!(creds.auth, CloudAuth::Token("tok".to_string()));
    }

    #[test]
    fn test_basic_auth_and_api_url() {
        let creds = CloudCredentials::from_map(
            "default/c1",
            &map(&[
                (USERNAME_KEY, "user"),
                (PASSWORD_KEY, "pw"),
                (API_URL_KEY, "https://api.example.com/cloudapi/v6"),
            ]),
        )
        .expect("valid");
        assert!(matches!(creds.auth, CloudAuth::Basic { .. }));
        assert_eq!(
            creds.api_url.as_deref(),
            Some("https://api.example.com/cloudapi/v6")
        );
    }

    #[test]
    fn test_incomplete_secret_is_permanent() {
        let err = CloudCredentials::from_map("default/c1", &map(&[(USERNAME_KEY, "user")]))
            .expect_err("password missing");
        assert!(err.is_permanent());
    }

    #[test]
    fn test_from_secret_reads_data() {
        let mut data = BTreeMap::new();
        data.insert(TOKEN_KEY.to_string(), ByteString(b"secret-token".to_vec()));
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };
        let creds = CloudCredentials::from_secret("default/c1", &secret).expect("valid");
        assert_eq!(creds.auth, CloudAuth::Token("secret-token".to_string()));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = CloudCredentials::from_map("default/c1", &map(&[(TOKEN_KEY, "supersecret")]))
            .expect("valid");
        assert!(!format!("{:?}", creds).contains("supersecret"));
    }
}
