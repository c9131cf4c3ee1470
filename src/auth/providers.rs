//! OAuth provider abstraction
//!
//! A provider is a capability with two operations: build the authorize
//! redirect, and turn a callback code into user info. Concrete providers
//! differ only in endpoints, scopes, and how the userinfo document maps to
//! (external id, email, name); everything else is the same OAuth 2 exchange.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::types::{FaztError, Result};

/// What a callback resolves to
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub external_id: String,
    pub email: String,
    pub name: String,
}

/// Provider capability
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider tag stored on users (google, github, ...)
    fn name(&self) -> &str;

    /// Full authorize redirect URL for a login attempt
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String;

    /// Exchange the callback code and fetch user info
    async fn callback(&self, code: &str, redirect_uri: &str) -> Result<UserInfo>;
}

/// Endpoint description for a standard OAuth 2 provider
struct Endpoints {
    name: &'static str,
    auth_url: &'static str,
    token_url: &'static str,
    userinfo_url: &'static str,
    scopes: &'static str,
    /// Map the raw userinfo document to the common shape
    map: fn(&Value) -> Result<UserInfo>,
}

/// Generic OAuth 2 provider over HTTPS endpoints
pub struct OAuthProvider {
    endpoints: Endpoints,
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
}

impl OAuthProvider {
    fn new(endpoints: Endpoints, client_id: String, client_secret: String) -> Self {
        Self {
            endpoints,
            client_id,
            client_secret,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OAuthProvider {
    fn name(&self) -> &str {
        self.endpoints.name
    }

    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            self.endpoints.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(self.endpoints.scopes),
            urlencoding::encode(state),
        )
    }

    async fn callback(&self, code: &str, redirect_uri: &str) -> Result<UserInfo> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("redirect_uri", redirect_uri),
        ];
        let token_response: Value = self
            .http
            .post(self.endpoints.token_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| FaztError::Internal(format!("token exchange: {e}")))?
            .json()
            .await
            .map_err(|e| FaztError::Internal(format!("token exchange body: {e}")))?;

        let access_token = token_response
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                FaztError::Validation(format!(
                    "{}: token exchange rejected",
                    self.endpoints.name
                ))
            })?;

        let userinfo: Value = self
            .http
            .get(self.endpoints.userinfo_url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .header("User-Agent", "fazt")
            .send()
            .await
            .map_err(|e| FaztError::Internal(format!("userinfo fetch: {e}")))?
            .json()
            .await
            .map_err(|e| FaztError::Internal(format!("userinfo body: {e}")))?;

        (self.endpoints.map)(&userinfo)
    }
}

fn string_at(doc: &Value, key: &str) -> Option<String> {
    doc.get(key).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn map_google(doc: &Value) -> Result<UserInfo> {
    Ok(UserInfo {
        external_id: string_at(doc, "sub")
            .ok_or_else(|| FaztError::Validation("google userinfo missing sub".into()))?,
        email: string_at(doc, "email").unwrap_or_default(),
        name: string_at(doc, "name").unwrap_or_else(|| "Google user".into()),
    })
}

fn map_github(doc: &Value) -> Result<UserInfo> {
    Ok(UserInfo {
        external_id: string_at(doc, "id")
            .ok_or_else(|| FaztError::Validation("github userinfo missing id".into()))?,
        email: string_at(doc, "email").unwrap_or_default(),
        name: string_at(doc, "name")
            .or_else(|| string_at(doc, "login"))
            .unwrap_or_else(|| "GitHub user".into()),
    })
}

fn map_discord(doc: &Value) -> Result<UserInfo> {
    Ok(UserInfo {
        external_id: string_at(doc, "id")
            .ok_or_else(|| FaztError::Validation("discord userinfo missing id".into()))?,
        email: string_at(doc, "email").unwrap_or_default(),
        name: string_at(doc, "global_name")
            .or_else(|| string_at(doc, "username"))
            .unwrap_or_else(|| "Discord user".into()),
    })
}

fn map_microsoft(doc: &Value) -> Result<UserInfo> {
    Ok(UserInfo {
        external_id: string_at(doc, "id")
            .ok_or_else(|| FaztError::Validation("microsoft userinfo missing id".into()))?,
        email: string_at(doc, "mail")
            .or_else(|| string_at(doc, "userPrincipalName"))
            .unwrap_or_default(),
        name: string_at(doc, "displayName").unwrap_or_else(|| "Microsoft user".into()),
    })
}

/// Provider registry keyed by provider tag. Providers with missing
/// credentials are simply absent; login attempts against them 404.
pub struct ProviderRegistry {
    providers: HashMap<String, Box<dyn Provider>>,
}

impl ProviderRegistry {
    /// Build from `<PROVIDER>_CLIENT_ID` / `<PROVIDER>_CLIENT_SECRET` env
    /// pairs.
    pub fn from_env() -> Self {
        let mut providers: HashMap<String, Box<dyn Provider>> = HashMap::new();

        let catalog: [(&str, Endpoints); 4] = [
            (
                "GOOGLE",
                Endpoints {
                    name: "google",
                    auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
                    token_url: "https://oauth2.googleapis.com/token",
                    userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
                    scopes: "openid email profile",
                    map: map_google,
                },
            ),
            (
                "GITHUB",
                Endpoints {
                    name: "github",
                    auth_url: "https://github.com/login/oauth/authorize",
                    token_url: "https://github.com/login/oauth/access_token",
                    userinfo_url: "https://api.github.com/user",
                    scopes: "read:user user:email",
                    map: map_github,
                },
            ),
            (
                "DISCORD",
                Endpoints {
                    name: "discord",
                    auth_url: "https://discord.com/oauth2/authorize",
                    token_url: "https://discord.com/api/oauth2/token",
                    userinfo_url: "https://discord.com/api/users/@me",
                    scopes: "identify email",
                    map: map_discord,
                },
            ),
            (
                "MICROSOFT",
                Endpoints {
                    name: "microsoft",
                    auth_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
                    token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token",
                    userinfo_url: "https://graph.microsoft.com/v1.0/me",
                    scopes: "openid email profile User.Read",
                    map: map_microsoft,
                },
            ),
        ];

        for (env_prefix, endpoints) in catalog {
            let id = std::env::var(format!("{env_prefix}_CLIENT_ID")).ok();
            let secret = std::env::var(format!("{env_prefix}_CLIENT_SECRET")).ok();
            if let (Some(id), Some(secret)) = (id, secret) {
                let name = endpoints.name.to_string();
                providers.insert(name, Box::new(OAuthProvider::new(endpoints, id, secret)));
            }
        }

        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Provider> {
        self.providers.get(name).map(|b| b.as_ref())
    }

    /// Provider tags available for login, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Default provider for auth-required redirects: the first configured
    /// one, or the dev provider tag when none are.
    pub fn default_provider(&self) -> &str {
        self.names().first().copied().unwrap_or("dev")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn github() -> OAuthProvider {
        OAuthProvider::new(
            Endpoints {
                name: "github",
                auth_url: "https://github.com/login/oauth/authorize",
                token_url: "https://github.com/login/oauth/access_token",
                userinfo_url: "https://api.github.com/user",
                scopes: "read:user",
                map: map_github,
            },
            "cid".into(),
            "secret".into(),
        )
    }

    #[test]
    fn authorize_url_is_escaped() {
        let url = github().authorize_url("https://admin.example.com/auth/callback/github", "st&ate");
        assert!(url.starts_with("https://github.com/login/oauth/authorize?client_id=cid"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fadmin.example.com"));
        assert!(url.contains("state=st%26ate"));
    }

    #[test]
    fn userinfo_maps_handle_numeric_ids() {
        let info = map_github(&json!({"id": 12345, "login": "octo"})).unwrap();
        assert_eq!(info.external_id, "12345");
        assert_eq!(info.name, "octo");
    }

    #[test]
    fn userinfo_maps_fall_back_on_names() {
        let info = map_discord(&json!({"id": "9", "username": "disc"})).unwrap();
        assert_eq!(info.name, "disc");
        let info = map_microsoft(&json!({"id": "7", "userPrincipalName": "u@x"})).unwrap();
        assert_eq!(info.email, "u@x");
    }

    #[test]
    fn missing_external_id_is_rejected() {
        assert!(map_google(&json!({"email": "a@x"})).is_err());
    }
}
