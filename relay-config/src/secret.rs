use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// A configuration value that must not show up in logs, such as the store's shared key.
///
/// Loads from a plain string. Serializing writes the value back out so a loaded configuration
/// can be persisted again; `Debug` never does.
#[derive(Clone, Deserialize, Serialize)]
#[serde(from = "String")]
pub struct SerializableSecretString(#[serde(serialize_with = "serialize_exposed")] SecretString);

impl SerializableSecretString {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    /// Whether the value is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.expose_secret().trim().is_empty()
    }
}

fn serialize_exposed<S: Serializer>(value: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(value.expose_secret())
}

impl fmt::Debug for SerializableSecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for SerializableSecretString {
    fn from(value: String) -> Self {
        Self(SecretString::from(value))
    }
}

impl From<&str> for SerializableSecretString {
    fn from(value: &str) -> Self {
        Self::from(value.to_owned())
    }
}
