//! Secret fetching and validation

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use super::ResourceClient;
use crate::error::{Error, Result};

/// Fetch a secret, mapping absence to [`Error::SecretNotFound`]
pub async fn get_secret(client: &ResourceClient, name: &str, namespace: &str) -> Result<Secret> {
    client
        .get::<Secret>(namespace, name)
        .await?
        .ok_or_else(|| Error::SecretNotFound(format!("{}/{}", namespace, name)))
}

/// Fetch a secret and check that every one of `required` keys is present
pub async fn get_and_validate_secret(
    client: &ResourceClient,
    name: &str,
    namespace: &str,
    required: &[&str],
) -> Result<Secret> {
    let secret = get_secret(client, name, namespace).await?;
    validate_secret_keys(&secret, required)?;
    Ok(secret)
}

/// Check that a secret carries every one of `required` keys
pub fn validate_secret_keys(secret: &Secret, required: &[&str]) -> Result<()> {
    for key in required {
        if !secret_has_key(secret, key) {
            return Err(Error::validation(format!(
                "secret {} is missing field: {}",
                secret.name_any(),
                key
            )));
        }
    }
    Ok(())
}

/// Whether a key is present in either `data` or `stringData`
pub fn secret_has_key(secret: &Secret, key: &str) -> bool {
    secret.data.as_ref().is_some_and(|d| d.contains_key(key))
        || secret
            .string_data
            .as_ref()
            .is_some_and(|d| d.contains_key(key))
}

/// Get a string value from a secret
pub fn get_secret_string(secret: &Secret, key: &str) -> Result<String> {
    let missing = || Error::SecretKeyNotFound {
        secret: secret.name_any(),
        key: key.to_string(),
    };

    if let Some(value) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
        return Ok(value.clone());
    }
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(missing)?;

    String::from_utf8(bytes.0.clone())
        .map_err(|e| Error::Config(format!("Invalid UTF-8 in secret key '{}': {}", key, e)))
}
