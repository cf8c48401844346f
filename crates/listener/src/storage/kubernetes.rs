use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::Client;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::TlsStorage;
use crate::error::StorageError;
use crate::factory::TlsFactory;
use crate::secret::{SecretMeta, TlsSecret, SECRET_TYPE_TLS};

/// Attempts before a conflicting update gives up
const MAX_UPDATE_ATTEMPTS: usize = 3;

/// HTTP status for AlreadyExists and Conflict
const STATUS_CONFLICT: u16 = 409;

/// Stores the record in a `kubernetes.io/tls` Secret.
///
/// Updates use optimistic concurrency: on a conflict the current Secret is
/// fetched, merged with the update through the factory, and resubmitted.
pub struct KubernetesStorage {
    api: Api<Secret>,
    namespace: String,
    name: String,
    factory: RwLock<Option<Arc<dyn TlsFactory>>>,
}

impl KubernetesStorage {
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            name: name.into(),
            factory: RwLock::new(None),
        }
    }

    async fn fetch(&self) -> Result<Option<TlsSecret>, StorageError> {
        Ok(self.api.get_opt(&self.name).await?.map(from_secret))
    }

    async fn write(&self, secret: &TlsSecret) -> Result<TlsSecret, kube::Error> {
        let object = to_secret(secret, &self.namespace, &self.name);
        let saved = if secret.metadata.resource_version.is_empty() {
            self.api.create(&PostParams::default(), &object).await?
        } else {
            self.api
                .replace(&self.name, &PostParams::default(), &object)
                .await?
        };
        Ok(from_secret(saved))
    }
}

#[async_trait]
impl TlsStorage for KubernetesStorage {
    async fn get(&self) -> Result<Option<TlsSecret>, StorageError> {
        self.fetch().await
    }

    async fn update(&self, secret: &TlsSecret) -> Result<TlsSecret, StorageError> {
        let mut candidate = secret.clone();

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            match self.write(&candidate).await {
                Ok(saved) => {
                    info!(
                        namespace = %self.namespace,
                        name = %self.name,
                        version = %saved.metadata.resource_version,
                        "Saved TLS secret"
                    );
                    return Ok(saved);
                }
                Err(kube::Error::Api(e)) if e.code == STATUS_CONFLICT => {
                    warn!(
                        namespace = %self.namespace,
                        name = %self.name,
                        attempt,
                        "TLS secret update conflicted, merging with current"
                    );
                }
                Err(e) => return Err(e.into()),
            }

            let Some(current) = self.fetch().await? else {
                candidate.metadata.resource_version.clear();
                continue;
            };

            let factory = self.factory.read().clone();
            let (mut merged, updated) = match factory {
                Some(factory) => factory.merge(&current, &candidate)?,
                None => (candidate.clone(), true),
            };
            if !updated {
                debug!(name = %self.name, "Current TLS secret already satisfies update");
                return Ok(current);
            }
            merged.metadata.resource_version = current.metadata.resource_version;
            candidate = merged;
        }

        Err(StorageError::ConflictExhausted {
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    fn set_factory(&self, factory: Arc<dyn TlsFactory>) {
        *self.factory.write() = Some(factory);
    }
}

fn from_secret(secret: Secret) -> TlsSecret {
    let metadata = secret.metadata;
    TlsSecret {
        metadata: SecretMeta {
            name: metadata.name.unwrap_or_default(),
            namespace: metadata.namespace.unwrap_or_default(),
            resource_version: metadata.resource_version.unwrap_or_default(),
            annotations: metadata.annotations.unwrap_or_default(),
        },
        type_: secret.type_.unwrap_or_else(|| SECRET_TYPE_TLS.to_string()),
        data: secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect(),
        ..TlsSecret::default()
    }
}

fn to_secret(secret: &TlsSecret, namespace: &str, name: &str) -> Secret {
    let resource_version = Some(secret.metadata.resource_version.clone()).filter(|v| !v.is_empty());
    let data: BTreeMap<String, ByteString> = secret
        .data
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.clone())))
        .collect();

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version,
            annotations: Some(secret.metadata.annotations.clone()),
            ..Default::default()
        },
        data: Some(data),
        type_: Some(SECRET_TYPE_TLS.to_string()),
        ..Default::default()
    }
}
