use crate::client::{KeyFetch, KeyStoreClient};
use crate::coordinator::RedundantFetcher;
use crate::errors::Result;
use crate::rt;
use crate::types::Action;
use std::sync::Arc;

/// Blocking wrap/unwrap of data keys, for callers that are not async.
pub trait KeyWrapper: Send + Sync {
    /// Wrap a plaintext data key into an opaque token.
    fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Resolve a token produced by [`KeyWrapper::wrap_key`] back into the data key.
    fn unwrap_key(&self, token: &[u8]) -> Result<Vec<u8>>;
}

impl<T> KeyWrapper for Arc<T>
where
    T: KeyWrapper + ?Sized,
{
    fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        (**self).wrap_key(key)
    }

    fn unwrap_key(&self, token: &[u8]) -> Result<Vec<u8>> {
        (**self).unwrap_key(token)
    }
}

impl<T> KeyWrapper for Box<T>
where
    T: KeyWrapper + ?Sized,
{
    fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        (**self).wrap_key(key)
    }

    fn unwrap_key(&self, token: &[u8]) -> Result<Vec<u8>> {
        (**self).unwrap_key(token)
    }
}

/// [`KeyWrapper`] backed by the redundant key-custody endpoints.
pub struct CustodyKeyWrapper<F = KeyStoreClient>
where
    F: KeyFetch + 'static,
{
    fetcher: RedundantFetcher<F>,
}

impl<F> CustodyKeyWrapper<F>
where
    F: KeyFetch + 'static,
{
    pub fn new(fetcher: RedundantFetcher<F>) -> Self {
        Self { fetcher }
    }
}

impl<F> KeyWrapper for CustodyKeyWrapper<F>
where
    F: KeyFetch + 'static,
{
    fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        rt::block_on(self.fetcher.race_fetch(Action::WrapKey, key))?
    }

    fn unwrap_key(&self, token: &[u8]) -> Result<Vec<u8>> {
        rt::block_on(self.fetcher.race_fetch(Action::UnwrapKey, token))?
    }
}
