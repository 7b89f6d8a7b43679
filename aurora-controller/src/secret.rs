//! The registry secret every namespace should carry
use crate::config::Credential;
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

/// Secret type of registry credentials
pub const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
/// Data key holding the credential inside such a secret
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// The secret that should exist in `namespace`
#[must_use]
pub fn desired_secret(namespace: &str, credential: &Credential) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(credential.name().to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            ByteString(credential.docker_config_json().to_vec()),
        )])),
        ..Secret::default()
    }
}

/// Whether `secret` already holds the credential's payload
///
/// Only the payload key is compared, other keys and all metadata are left to whoever owns them.
#[must_use]
pub fn payload_matches(secret: &Secret, credential: &Credential) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(DOCKER_CONFIG_JSON_KEY))
        .is_some_and(|payload| payload.0 == credential.docker_config_json())
}

/// A copy of `secret` with the payload reset to the credential's
#[must_use]
pub fn with_payload(secret: &Secret, credential: &Credential) -> Secret {
    let mut updated = secret.clone();
    updated.data.get_or_insert_with(BTreeMap::new).insert(
        DOCKER_CONFIG_JSON_KEY.to_string(),
        ByteString(credential.docker_config_json().to_vec()),
    );
    updated
}

#[cfg(test)]
mod tests {
    use super::{desired_secret, payload_matches, with_payload, DOCKER_CONFIG_JSON_KEY};
    use crate::config::Credential;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn credential() -> Credential {
        Credential::new("aurora-registry", r#"{"auths":{}}"#).unwrap()
    }

    #[test]
    fn desired_secret_should_carry_the_payload() {
        let secret = desired_secret("team-a", &credential());
        assert_eq!(secret.metadata.name.as_deref(), Some("aurora-registry"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("team-a"));
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));
        assert!(payload_matches(&secret, &credential()));
    }

    #[test]
    fn payload_comparison_should_be_bytewise() {
        let mut secret = desired_secret("team-a", &credential());
        secret.data = Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            ByteString(br#"{"auths": {}}"#.to_vec()),
        )]));
        assert!(!payload_matches(&secret, &credential()));
        secret.data = None;
        assert!(!payload_matches(&secret, &credential()));
    }

    #[test]
    fn with_payload_should_only_touch_the_payload_key() {
        let mut secret = desired_secret("team-a", &credential());
        secret.metadata.resource_version = Some("42".to_string());
        secret.metadata.labels = Some(BTreeMap::from([("owner".to_string(), "ops".to_string())]));
        secret.data = Some(BTreeMap::from([
            (DOCKER_CONFIG_JSON_KEY.to_string(), ByteString(b"{}".to_vec())),
            ("extra".to_string(), ByteString(b"keep".to_vec())),
        ]));

        let updated = with_payload(&secret, &credential());
        assert!(payload_matches(&updated, &credential()));
        assert_eq!(updated.metadata, secret.metadata);
        assert_eq!(updated.type_, secret.type_);
        let data = updated.data.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data["extra"], ByteString(b"keep".to_vec()));
    }
}
