//! Cryptographic materials manager backed by redundant key-custody endpoints.
//!
//! Encryption generates a local data key and asks the key-custody layer to wrap it into an opaque
//! token (`ck`). Only the token is persisted, hex-encoded in the material description; every
//! decryption resolves it back through the endpoints.

use crate::client::{KeyFetch, KeyStoreClient};
use crate::coordinator::RedundantFetcher;
use crate::errors::{Error, Result};
use crate::types::Action;
use async_trait::async_trait;
use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{Instrument, debug, info_span};
use zeroize::{Zeroize, Zeroizing};

pub const TOKEN_KEY: &str = "ck";
pub const DEFAULT_ALGORITHM: &str = "AES/GCM/NoPadding";
pub const GCM_TAG_LENGTH_BITS: u32 = 128;
pub const DATA_KEY_LEN: usize = 32;
pub const GCM_NONCE_LEN: usize = 12;

/// String map persisted next to the ciphertext by the encryption framework.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterialDescription(BTreeMap<String, String>);

impl MaterialDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON object encoding used by the encryption framework's object metadata.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(|err| Error::MalformedDescription(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| Error::MalformedDescription(err.to_string()))
    }
}

impl<K, V> FromIterator<(K, V)> for MaterialDescription
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Key material and parameters for one encrypt or decrypt operation. Never reused across objects.
#[derive(Clone, PartialEq, Eq)]
pub struct CryptographicMaterials {
    pub data_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub algorithm_id: String,
    pub tag_length_bits: u32,
    pub key_token: Vec<u8>,
    pub description: MaterialDescription,
}

impl fmt::Debug for CryptographicMaterials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptographicMaterials")
            .field("data_key", &"<redacted>")
            .field("iv", &hex::encode(&self.iv))
            .field("algorithm_id", &self.algorithm_id)
            .field("tag_length_bits", &self.tag_length_bits)
            .field("key_token", &hex::encode(&self.key_token))
            .field("description", &self.description)
            .finish()
    }
}

impl Drop for CryptographicMaterials {
    fn drop(&mut self) {
        self.data_key.zeroize();
    }
}

/// Inputs for producing encryption materials.
#[derive(Debug, Clone, Default)]
pub struct EncryptionMaterialsRequest {
    /// Identifies the object being encrypted (for example `bucket/key`); only used for tracing.
    pub object_ref: Option<String>,
    /// Caller entries carried into the persisted description. A caller `ck` entry is replaced.
    pub description: MaterialDescription,
}

/// Inputs for resolving decryption materials.
#[derive(Debug, Clone, Default)]
pub struct DecryptMaterialsRequest {
    pub iv: Vec<u8>,
    /// Encoded [`MaterialDescription`] as persisted with the object.
    pub material_description: Vec<u8>,
    pub object_ref: Option<String>,
}

/// The capability an envelope-encryption framework plugs in as its key source.
#[async_trait]
pub trait MaterialsManager: Send + Sync {
    async fn get_encryption_materials(
        &self,
        request: &EncryptionMaterialsRequest,
    ) -> Result<CryptographicMaterials>;

    async fn decrypt_materials(
        &self,
        request: &DecryptMaterialsRequest,
    ) -> Result<CryptographicMaterials>;
}

/// [`MaterialsManager`] that wraps and unwraps data keys through redundant key-custody endpoints.
pub struct CustodyMaterialsManager<F = KeyStoreClient>
where
    F: KeyFetch + 'static,
{
    fetcher: RedundantFetcher<F>,
}

impl<F> CustodyMaterialsManager<F>
where
    F: KeyFetch + 'static,
{
    pub fn new(fetcher: RedundantFetcher<F>) -> Self {
        Self { fetcher }
    }

    pub fn fetcher(&self) -> &RedundantFetcher<F> {
        &self.fetcher
    }

    async fn encryption_materials(
        &self,
        request: &EncryptionMaterialsRequest,
    ) -> Result<CryptographicMaterials> {
        // A fresh nonce per call; never derived from the object or cached.
        let iv = random_bytes(GCM_NONCE_LEN)?;
        let mut data_key = fresh_data_key()?;
        let token = self.fetcher.race_fetch(Action::WrapKey, &data_key).await?;

        let mut description = request.description.clone();
        description.insert(TOKEN_KEY, hex::encode(&token));
        debug!(token_len = token.len(), "wrapped fresh data key");

        Ok(CryptographicMaterials {
            data_key: std::mem::take(&mut *data_key),
            iv,
            algorithm_id: DEFAULT_ALGORITHM.to_string(),
            tag_length_bits: GCM_TAG_LENGTH_BITS,
            key_token: token,
            description,
        })
    }

    async fn decryption_materials(
        &self,
        request: &DecryptMaterialsRequest,
    ) -> Result<CryptographicMaterials> {
        let description = MaterialDescription::decode(&request.material_description)?;
        let token_hex = description.get(TOKEN_KEY).ok_or(Error::MissingToken)?;
        let token = hex::decode(token_hex).map_err(|err| {
            Error::MalformedDescription(format!("{TOKEN_KEY} is not valid hex: {err}"))
        })?;

        let data_key = self.fetcher.race_fetch(Action::UnwrapKey, &token).await?;
        debug!(key_len = data_key.len(), "resolved data key from token");

        Ok(CryptographicMaterials {
            data_key,
            iv: request.iv.clone(),
            algorithm_id: DEFAULT_ALGORITHM.to_string(),
            tag_length_bits: GCM_TAG_LENGTH_BITS,
            key_token: token,
            description,
        })
    }
}

#[async_trait]
impl<F> MaterialsManager for CustodyMaterialsManager<F>
where
    F: KeyFetch + 'static,
{
    async fn get_encryption_materials(
        &self,
        request: &EncryptionMaterialsRequest,
    ) -> Result<CryptographicMaterials> {
        let span = info_span!(
            "encryption_materials",
            object = request.object_ref.as_deref().unwrap_or("-")
        );
        self.encryption_materials(request).instrument(span).await
    }

    async fn decrypt_materials(
        &self,
        request: &DecryptMaterialsRequest,
    ) -> Result<CryptographicMaterials> {
        let span = info_span!(
            "decrypt_materials",
            object = request.object_ref.as_deref().unwrap_or("-")
        );
        self.decryption_materials(request).instrument(span).await
    }
}

/// Wiped on drop on every path, including a failed wrap.
fn fresh_data_key() -> Result<Zeroizing<Vec<u8>>> {
    random_bytes(DATA_KEY_LEN).map(Zeroizing::new)
}

pub(crate) fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut buffer)
        .map_err(|err| Error::Random(err.to_string()))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FetchOutcome;
    use crate::coordinator::RedundantSources;
    use crate::types::{KeyLocation, KeySource};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reversible stand-in for a key store: tokens are the key xor 0x5A, padded to 48 bytes.
    #[derive(Default)]
    struct XorStore {
        calls: Arc<AtomicUsize>,
        down: bool,
    }

    #[async_trait]
    impl KeyFetch for XorStore {
        async fn fetch(
            &self,
            address: &str,
            _location: KeyLocation,
            action: Action,
            payload: &[u8],
        ) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down {
                return Err(Error::transport(address, "down"));
            }
            match action {
                Action::WrapKey => {
                    let mut token: Vec<u8> = payload.iter().map(|b| b ^ 0x5A).collect();
                    token.resize(48, 0);
                    Ok(token)
                }
                Action::UnwrapKey => Ok(payload[..32].iter().map(|b| b ^ 0x5A).collect()),
                Action::GetKey => Ok(vec![0; 16]),
            }
        }
    }

    fn manager(store: XorStore) -> CustodyMaterialsManager<XorStore> {
        let sources = RedundantSources::new(
            KeySource::new("a", KeyLocation::new(40, 1)),
            KeySource::new("b", KeyLocation::new(41, 1)),
        );
        CustodyMaterialsManager::new(RedundantFetcher::new(store, sources))
    }

    #[tokio::test]
    async fn encryption_materials_shape() {
        let manager = manager(XorStore::default());
        let materials = manager
            .get_encryption_materials(&EncryptionMaterialsRequest::default())
            .await
            .unwrap();
        assert_eq!(materials.data_key.len(), DATA_KEY_LEN);
        assert_eq!(materials.iv.len(), GCM_NONCE_LEN);
        assert_eq!(materials.algorithm_id, "AES/GCM/NoPadding");
        assert_eq!(materials.tag_length_bits, 128);
        assert_eq!(materials.key_token.len(), 48);
        assert_eq!(
            materials.description.get(TOKEN_KEY),
            Some(hex::encode(&materials.key_token).as_str())
        );
    }

    #[tokio::test]
    async fn ivs_and_keys_are_fresh_per_call() {
        let manager = manager(XorStore::default());
        let request = EncryptionMaterialsRequest::default();
        let first = manager.get_encryption_materials(&request).await.unwrap();
        let second = manager.get_encryption_materials(&request).await.unwrap();
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.data_key, second.data_key);
    }

    #[tokio::test]
    async fn description_round_trip_recovers_data_key() {
        let manager = manager(XorStore::default());
        let encryption = manager
            .get_encryption_materials(&EncryptionMaterialsRequest {
                object_ref: Some("bucket/report.pdf".into()),
                description: [("purpose", "backup")].into_iter().collect(),
            })
            .await
            .unwrap();

        let request = DecryptMaterialsRequest {
            iv: encryption.iv.clone(),
            material_description: encryption.description.encode().unwrap(),
            object_ref: Some("bucket/report.pdf".into()),
        };
        let decryption = manager.decrypt_materials(&request).await.unwrap();
        assert_eq!(decryption.data_key, encryption.data_key);
        assert_eq!(decryption.iv, encryption.iv);
        assert_eq!(decryption.algorithm_id, encryption.algorithm_id);
        assert_eq!(decryption.description.get("purpose"), Some("backup"));
    }

    #[tokio::test]
    async fn both_endpoints_down_fails_encryption() {
        let manager = manager(XorStore {
            down: true,
            ..Default::default()
        });
        let err = manager
            .get_encryption_materials(&EncryptionMaterialsRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyUnavailable { ref failures } if failures.len() == 2));
    }

    #[test]
    fn fresh_data_keys_are_zeroizing() {
        let key: Zeroizing<Vec<u8>> = fresh_data_key().unwrap();
        assert_eq!(key.len(), DATA_KEY_LEN);
        let mut materials = CryptographicMaterials {
            data_key: key.to_vec(),
            iv: vec![1; GCM_NONCE_LEN],
            algorithm_id: DEFAULT_ALGORITHM.into(),
            tag_length_bits: GCM_TAG_LENGTH_BITS,
            key_token: vec![2; 48],
            description: MaterialDescription::new(),
        };
        materials.data_key.zeroize();
        assert!(materials.data_key.is_empty());
    }

    #[tokio::test]
    async fn malformed_descriptions_never_reach_endpoints() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = manager(XorStore {
            calls: Arc::clone(&calls),
            down: false,
        });
        let cases: [(&[u8], fn(&Error) -> bool); 3] = [
            (b"not json", |e| matches!(e, Error::MalformedDescription(_))),
            (br#"{"other":"x"}"#, |e| matches!(e, Error::MissingToken)),
            (br#"{"ck":"zz"}"#, |e| matches!(e, Error::MalformedDescription(_))),
        ];
        for (description, expected) in cases {
            let err = manager
                .decrypt_materials(&DecryptMaterialsRequest {
                    iv: vec![0; 12],
                    material_description: description.to_vec(),
                    object_ref: None,
                })
                .await
                .unwrap_err();
            assert!(expected(&err), "unexpected error {err}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn debug_output_redacts_data_key() {
        let materials = CryptographicMaterials {
            data_key: vec![0xAB; 32],
            iv: vec![1; 12],
            algorithm_id: DEFAULT_ALGORITHM.into(),
            tag_length_bits: GCM_TAG_LENGTH_BITS,
            key_token: vec![2; 48],
            description: MaterialDescription::new(),
        };
        let rendered = format!("{materials:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(&"ab".repeat(32)));
    }
}
