//! The serving record.
//!
//! [`TlsSecret`] has the shape of a Kubernetes `kubernetes.io/tls` Secret so
//! the file storage format can be applied with kubectl and the Kubernetes
//! storage converts it without translation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Data key holding the PEM certificate chain
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Data key holding the PEM private key
pub const TLS_KEY_KEY: &str = "tls.key";
/// Secret type of serving records
pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

/// Annotation prefix recording one SAN per key
pub const CN_PREFIX: &str = "listener.cattle.io/cn-";
/// Annotation holding the leaf certificate fingerprint
pub const FINGERPRINT_ANNOTATION: &str = "listener.cattle.io/fingerprint";
/// Annotation marking a user-provided record
pub const STATIC_ANNOTATION: &str = "listener.cattle.io/static";

/// Identity and annotations of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Certificate, key and SAN bookkeeping for the serving certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSecret {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    #[serde(default)]
    pub metadata: SecretMeta,

    #[serde(rename = "type", default = "default_type")]
    pub type_: String,

    #[serde(default, with = "base64_data")]
    pub data: BTreeMap<String, Vec<u8>>,
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_kind() -> String {
    "Secret".to_string()
}

fn default_type() -> String {
    SECRET_TYPE_TLS.to_string()
}

impl Default for TlsSecret {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: SecretMeta::default(),
            type_: default_type(),
            data: BTreeMap::new(),
        }
    }
}

impl TlsSecret {
    /// A static record wrapping a user-provided certificate chain and key.
    pub fn new_static(cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        let mut secret = Self::default();
        secret.set_cert_and_key(cert_pem.into(), key_pem.into());
        secret
            .metadata
            .annotations
            .insert(STATIC_ANNOTATION.to_string(), "true".to_string());
        secret
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.metadata.annotations
    }

    pub fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.metadata.annotations
    }

    /// PEM certificate chain; empty when absent.
    pub fn cert_pem(&self) -> &[u8] {
        self.data.get(TLS_CERT_KEY).map(Vec::as_slice).unwrap_or_default()
    }

    /// PEM private key; empty when absent.
    pub fn key_pem(&self) -> &[u8] {
        self.data.get(TLS_KEY_KEY).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn set_cert_and_key(&mut self, cert_pem: Vec<u8>, key_pem: Vec<u8>) {
        self.data.insert(TLS_CERT_KEY.to_string(), cert_pem);
        self.data.insert(TLS_KEY_KEY.to_string(), key_pem);
    }

    pub fn is_static(&self) -> bool {
        self.annotations().get(STATIC_ANNOTATION).map(String::as_str) == Some("true")
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.annotations()
            .get(FINGERPRINT_ANNOTATION)
            .map(String::as_str)
    }

    /// Token identifying this version of the record.
    ///
    /// Combines the storage's resource version with the certificate
    /// fingerprint, so a record re-signed without a new resource version
    /// still gets a new token. Empty when the record has neither.
    pub fn version_token(&self) -> String {
        let fingerprint = self.fingerprint().unwrap_or_default();
        match (self.metadata.resource_version.as_str(), fingerprint) {
            ("", fingerprint) => fingerprint.to_string(),
            (version, "") => version.to_string(),
            (version, fingerprint) => format!("{version}/{fingerprint}"),
        }
    }
}

mod base64_data {
    use std::collections::BTreeMap;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        data: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        data.iter()
            .map(|(k, v)| (k.as_str(), STANDARD.encode(v)))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(v.as_bytes())
                    .map(|bytes| (k.clone(), bytes))
                    .map_err(|e| D::Error::custom(format!("data[{k}]: {e}")))
            })
            .collect()
    }
}
