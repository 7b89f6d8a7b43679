//! The registry credential distributed by the controllers
use std::fmt;
use thiserror::Error;

/// Longest name the API server accepts for a secret
const MAX_NAME_LEN: usize = 253;

/// Why a [`Credential`] was rejected
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The secret name is empty
    #[error("AURORA_SECRET_NAME must be set")]
    MissingName,
    /// The secret name is not a valid object name
    #[error("AURORA_SECRET_NAME {name:?} is not a valid DNS subdomain name")]
    InvalidName {
        /// The rejected name
        name: String,
    },
    /// The payload is empty
    #[error("AURORA_SECRET_DOCKERCONFIGJSON must be set")]
    MissingPayload,
    /// The payload does not parse
    #[error("AURORA_SECRET_DOCKERCONFIGJSON is not valid JSON: {0}")]
    InvalidPayload(#[source] serde_json::Error),
}

/// An image pull credential
///
/// `name` is both the name of the secret created in every namespace and the
/// reference added to every service account. `docker_config_json` is stored
/// verbatim under `.dockerconfigjson`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    name: String,
    docker_config_json: Vec<u8>,
}

impl Credential {
    /// Validates a credential
    ///
    /// # Errors
    ///
    /// The name must be a DNS subdomain name and the payload must be a JSON document.
    pub fn new(name: &str, docker_config_json: &str) -> Result<Self, ConfigError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::MissingName);
        }
        if !is_dns_subdomain(name) {
            return Err(ConfigError::InvalidName { name: name.to_string() });
        }
        if docker_config_json.trim().is_empty() {
            return Err(ConfigError::MissingPayload);
        }
        serde_json::from_str::<serde_json::Value>(docker_config_json).map_err(ConfigError::InvalidPayload)?;
        Ok(Self {
            name: name.to_string(),
            docker_config_json: docker_config_json.as_bytes().to_vec(),
        })
    }

    /// Name of the secret, and of the service account reference to it
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw `.dockerconfigjson` document
    #[must_use]
    pub fn docker_config_json(&self) -> &[u8] {
        &self.docker_config_json
    }
}

// The payload holds registry passwords, keep it out of logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("docker_config_json", &format_args!("<{} bytes>", self.docker_config_json.len()))
            .finish()
    }
}

/// RFC 1123 subdomain: dot separated labels of lowercase alphanumerics and `-`,
/// each starting and ending with an alphanumeric
fn is_dns_subdomain(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN
        && name.split('.').all(|label| {
            let bytes = label.as_bytes();
            match (bytes.first(), bytes.last()) {
                (Some(first), Some(last)) => {
                    first.is_ascii_alphanumeric()
                        && last.is_ascii_alphanumeric()
                        && bytes
                            .iter()
                            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
                }
                _ => false,
            }
        })
}
