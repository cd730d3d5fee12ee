//! Development key-custody store.
//!
//! Speaks the dualkey wire protocol over TCP, one request per connection. Slot keys are derived
//! deterministically from a seed and the key index, so two stores started from the same seed hold
//! the same key at the same index, the way replicated HSM keystores do.

use anyhow::{Context, Result, bail};
use dualkey_core::types::{Action, KeyLocation};
use dualkey_core::wire::{self, REQUEST_HEADER_LEN, RequestHeader, STATUS_FAILED, STATUS_OK};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const SEED_ENV: &str = "DUALKEY_DEV_SEED";
const STORES_ENV: &str = "DUALKEY_DEV_STORES";
const DEFAULT_STORES: [u8; 2] = [40, 41];
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PAYLOAD_TIMEOUT: Duration = Duration::from_secs(1);
/// How long a complete payload is watched for trailing bytes before it is answered.
const TRAILING_GRACE: Duration = Duration::from_millis(25);
const READ_CHUNK: usize = 256;

/// How the store answers requests. Anything other than `Healthy` is for fault-injection tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Healthy,
    /// Answer every request with this failure status.
    Reject(u8),
    /// Read the request and never answer.
    Hang,
    /// Close the connection without answering.
    Close,
}

#[derive(Clone)]
pub struct DevKeyStore {
    seed: [u8; 32],
    stores: BTreeSet<u8>,
    behavior: Behavior,
}

impl DevKeyStore {
    /// Hosts `stores`, deriving every slot key from `material`.
    pub fn new(material: &[u8], stores: impl IntoIterator<Item = u8>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(material);
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&hasher.finalize());
        Self {
            seed,
            stores: stores.into_iter().collect(),
            behavior: Behavior::Healthy,
        }
    }

    /// `DUALKEY_DEV_SEED` (default empty) and `DUALKEY_DEV_STORES` (comma separated, default `40,41`).
    pub fn from_env() -> Result<Self> {
        let material = std::env::var(SEED_ENV).unwrap_or_default();
        let stores = match std::env::var(STORES_ENV) {
            Ok(value) if !value.trim().is_empty() => parse_store_list(&value)?,
            _ => DEFAULT_STORES.to_vec(),
        };
        Ok(Self::new(material.as_bytes(), stores))
    }

    /// Fails for `Reject(0)`, since status `0` means success on the wire.
    pub fn with_behavior(mut self, behavior: Behavior) -> Result<Self> {
        if behavior == Behavior::Reject(STATUS_OK) {
            bail!("reject status must be nonzero");
        }
        self.behavior = behavior;
        Ok(self)
    }

    pub fn stores(&self) -> impl Iterator<Item = u8> + '_ {
        self.stores.iter().copied()
    }

    /// The key held at `location`, if this store hosts `location.store_id`.
    pub fn slot_key(&self, location: KeyLocation) -> Option<[u8; KEY_LEN]> {
        if !self.stores.contains(&location.store_id) {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update([location.key_index]);
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&hasher.finalize());
        Some(key)
    }

    /// Computes the full response frame for one request.
    pub fn respond(&self, header: RequestHeader, payload: &[u8]) -> Vec<u8> {
        let Some(slot_key) = self.slot_key(header.location) else {
            debug!(location = %header.location, "store not hosted");
            return wire::encode_failure(STATUS_FAILED);
        };
        let body = match header.action() {
            Some(Action::GetKey) if payload.is_empty() => Some(slot_key[..16].to_vec()),
            Some(Action::WrapKey) if payload.len() == KEY_LEN => Some(wrap(&slot_key, payload)),
            Some(Action::UnwrapKey) if payload.len() == Action::WrapKey.body_size() => {
                Some(unwrap(&slot_key, payload))
            }
            _ => None,
        };
        match body {
            Some(body) => wire::encode_success(&body),
            None => {
                debug!(code = header.code, len = payload.len(), "malformed request");
                wire::encode_failure(STATUS_FAILED)
            }
        }
    }

    /// Binds `address` and serves in a background task until the returned handle is dropped.
    pub async fn spawn<A: ToSocketAddrs>(self, address: A) -> Result<RunningStore> {
        let listener = TcpListener::bind(address)
            .await
            .context("failed to bind development key store")?;
        let local = listener
            .local_addr()
            .context("failed to read bound address")?;
        let requests = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(Arc::new(self).accept_loop(listener, Arc::clone(&requests)));
        Ok(RunningStore {
            address: local,
            requests,
            task,
        })
    }

    /// Serves `listener` on the current task, forever.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let requests = Arc::new(AtomicUsize::new(0));
        Arc::new(self).accept_loop(listener, requests).await;
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, requests: Arc<AtomicUsize>) {
        info!(
            address = ?listener.local_addr().ok(),
            stores = ?self.stores,
            "development key store listening"
        );
        // Owned here so that aborting the loop also drops every open connection.
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    requests.fetch_add(1, Ordering::SeqCst);
                    let store = Arc::clone(&self);
                    connections.spawn(async move {
                        if let Err(err) = store.handle_connection(socket).await {
                            debug!(%peer, error = %err, "connection ended with error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream) -> Result<()> {
        let reject = match self.behavior {
            Behavior::Close => return Ok(()),
            Behavior::Reject(status) => Some(status),
            Behavior::Healthy | Behavior::Hang => None,
        };

        let mut header = [0u8; REQUEST_HEADER_LEN];
        socket
            .read_exact(&mut header)
            .await
            .context("failed to read request header")?;
        let header = RequestHeader::from_bytes(header);
        let payload = read_payload(&mut socket, header).await?;

        if self.behavior == Behavior::Hang {
            std::future::pending::<()>().await;
        }
        let response = match reject {
            Some(status) => wire::encode_failure(status),
            None => self.respond(header, &payload),
        };
        socket
            .write_all(&response)
            .await
            .context("failed to write response")?;
        socket.shutdown().await.ok();
        Ok(())
    }
}

async fn read_payload(socket: &mut TcpStream, header: RequestHeader) -> Result<Vec<u8>> {
    let expected = match header.action() {
        Some(Action::GetKey) | None => 0,
        Some(Action::WrapKey) => KEY_LEN,
        Some(Action::UnwrapKey) => Action::WrapKey.body_size(),
    };
    // Clients send the whole frame in one write. Whatever arrives is returned as is, so a short
    // or oversized payload is answered as malformed.
    let mut payload = Vec::with_capacity(expected);
    let mut chunk = [0u8; READ_CHUNK];
    while payload.len() <= expected {
        let wait = if payload.len() < expected {
            PAYLOAD_TIMEOUT
        } else {
            TRAILING_GRACE
        };
        match tokio::time::timeout(wait, socket.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(read)) => payload.extend_from_slice(&chunk[..read]),
            Ok(Err(err)) => return Err(err).context("failed to read request payload"),
        }
    }
    Ok(payload)
}

fn mask(slot_key: &[u8; KEY_LEN], salt: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(slot_key);
    hasher.update(salt);
    let mut mask = [0u8; KEY_LEN];
    mask.copy_from_slice(&hasher.finalize());
    mask
}

fn wrap(slot_key: &[u8; KEY_LEN], key: &[u8]) -> Vec<u8> {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    let mask = mask(slot_key, &salt);
    let mut token = salt.to_vec();
    token.extend(key.iter().zip(mask).map(|(byte, m)| byte ^ m));
    token
}

fn unwrap(slot_key: &[u8; KEY_LEN], token: &[u8]) -> Vec<u8> {
    let (salt, masked) = token.split_at(SALT_LEN);
    let mask = mask(slot_key, salt);
    masked.iter().zip(mask).map(|(byte, m)| byte ^ m).collect()
}

fn parse_store_list(value: &str) -> Result<Vec<u8>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<u8>()
                .with_context(|| format!("invalid store id `{item}`"))
        })
        .collect()
}

/// A store serving in the background. Dropping it stops the accept loop and closes every
/// connection still open.
pub struct RunningStore {
    address: SocketAddr,
    requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl RunningStore {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Connections accepted so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for RunningStore {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dualkey_core::KeyLocation;

    fn header(action: Action, store_id: u8, key_index: u8) -> RequestHeader {
        RequestHeader {
            code: action.code(),
            location: KeyLocation::new(store_id, key_index),
        }
    }

    #[test]
    fn replicas_share_slot_keys_but_not_indexes() {
        let store = DevKeyStore::new(b"seed", [40, 41]);
        let a = store.slot_key(KeyLocation::new(40, 1)).unwrap();
        let b = store.slot_key(KeyLocation::new(41, 1)).unwrap();
        let c = store.slot_key(KeyLocation::new(40, 2)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(store.slot_key(KeyLocation::new(7, 1)).is_none());
    }

    #[test]
    fn get_key_returns_sixteen_bytes() {
        let store = DevKeyStore::new(b"seed", [40]);
        let response = store.respond(header(Action::GetKey, 40, 1), &[]);
        assert_eq!(response.len(), Action::GetKey.response_size());
        assert_eq!(response[0], 0);
    }

    #[test]
    fn wrap_then_unwrap_recovers_key() {
        let store = DevKeyStore::new(b"seed", [40, 41]);
        let key = [0u8; 32];
        let wrapped = store.respond(header(Action::WrapKey, 40, 1), &key);
        assert_eq!(wrapped.len(), Action::WrapKey.response_size());
        let unwrapped = store.respond(header(Action::UnwrapKey, 41, 1), &wrapped[1..]);
        assert_eq!(unwrapped.len(), Action::UnwrapKey.response_size());
        assert_eq!(&unwrapped[1..], &key);
    }

    #[test]
    fn token_from_other_index_does_not_unwrap() {
        let store = DevKeyStore::new(b"seed", [40]);
        let key = [9u8; 32];
        let wrapped = store.respond(header(Action::WrapKey, 40, 1), &key);
        let unwrapped = store.respond(header(Action::UnwrapKey, 40, 2), &wrapped[1..]);
        assert_ne!(&unwrapped[1..], &key);
    }

    #[test]
    fn malformed_requests_get_a_single_failure_byte() {
        let store = DevKeyStore::new(b"seed", [40]);
        assert_eq!(store.respond(header(Action::WrapKey, 40, 1), &[1, 2]), vec![1]);
        assert_eq!(store.respond(header(Action::GetKey, 99, 1), &[]), vec![1]);
        let unknown = RequestHeader {
            code: 7,
            location: KeyLocation::new(40, 1),
        };
        assert_eq!(store.respond(unknown, &[]), vec![1]);
    }

    #[test]
    fn reject_with_success_status_is_refused() {
        let store = DevKeyStore::new(b"seed", [40]);
        assert!(store.clone().with_behavior(Behavior::Reject(0)).is_err());
        let rejecting = store.with_behavior(Behavior::Reject(2)).unwrap();
        assert_eq!(rejecting.behavior, Behavior::Reject(2));
    }

    #[tokio::test]
    async fn dropping_the_store_closes_hung_connections() {
        let store = DevKeyStore::new(b"seed", [40])
            .with_behavior(Behavior::Hang)
            .unwrap()
            .spawn("127.0.0.1:0")
            .await
            .unwrap();
        let mut socket = TcpStream::connect(store.address()).await.unwrap();
        socket
            .write_all(wire::encode(KeyLocation::new(40, 1), Action::GetKey, &[]).as_bytes())
            .await
            .unwrap();
        // Let the handler read the request and park.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.requests(), 1);

        drop(store);
        let mut buffer = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buffer))
            .await
            .expect("connection left open after the store was dropped");
        assert!(matches!(read, Ok(0) | Err(_)), "{read:?}");
    }

    #[test]
    fn store_list_parsing() {
        assert_eq!(parse_store_list("40, 41,").unwrap(), vec![40, 41]);
        assert!(parse_store_list("40,300").is_err());
    }
}
