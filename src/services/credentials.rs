//! Account credentials used by the browser login

use crate::config::Config;

/// Username/password pair. `Debug` never prints the password.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Read-only holder for the single configured account
#[derive(Debug, Clone)]
pub struct CredentialStore {
    credentials: Credentials,
}

impl CredentialStore {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials {
                username: username.into(),
                password: password.into(),
            },
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.username.trim(), config.password.clone())
    }

    pub fn get(&self) -> &Credentials {
        &self.credentials
    }

    /// Account identifier used to tag session artifacts
    pub fn account_id(&self) -> String {
        self.credentials.username.to_ascii_lowercase()
    }
}
