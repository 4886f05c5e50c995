use serde::Serialize;

use crate::gateway::constants::LIBRARY_NAME;

/// Client metadata embedded in IDENTIFY.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClientProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: LIBRARY_NAME.to_string(),
            device: LIBRARY_NAME.to_string(),
        }
    }
}

/// Authentication token plus the client metadata sent with it.
#[derive(Clone)]
pub struct Credentials {
    pub token: String,
    pub properties: ClientProperties,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            properties: ClientProperties::default(),
        }
    }

    pub fn with_properties(mut self, properties: ClientProperties) -> Self {
        self.properties = properties;
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("properties", &self.properties)
            .finish()
    }
}
