use crate::error::{ErrorKind, Result};
use crate::handle::AssetBlob;
use crate::resolver::{AssetKey, AssetResolver};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Clone, Debug)]
enum MockAsset {
    Present(AssetBlob),
    Failing(String),
}

/// In-memory resolver that answers immediately and records every call.
#[derive(Debug, Default)]
pub struct MockResolver {
    assets: Mutex<HashMap<AssetKey, MockAsset>>,
    calls: Mutex<Vec<AssetKey>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assets<K>(assets: impl IntoIterator<Item = (K, AssetBlob)>) -> Self
    where
        K: Into<AssetKey>,
    {
        let resolver = Self::default();
        for (key, blob) in assets {
            resolver.insert(key, blob);
        }
        resolver
    }

    pub fn insert(&self, key: impl Into<AssetKey>, blob: AssetBlob) {
        self.lock_assets().insert(key.into(), MockAsset::Present(blob));
    }

    /// Make every future resolution of `key` fail.
    pub fn fail(&self, key: impl Into<AssetKey>, reason: impl Into<String>) {
        self.lock_assets().insert(key.into(), MockAsset::Failing(reason.into()));
    }

    pub fn calls(&self) -> Vec<AssetKey> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|called| called.as_str() == key)
            .count()
    }

    fn lock_assets(&self) -> std::sync::MutexGuard<'_, HashMap<AssetKey, MockAsset>> {
        self.assets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AssetResolver for MockResolver {
    async fn resolve(&self, key: &AssetKey) -> Result<Option<AssetBlob>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(key.clone());
        match self.lock_assets().get(key).cloned() {
            Some(MockAsset::Present(blob)) => Ok(Some(blob)),
            Some(MockAsset::Failing(reason)) => Err(exn::Exn::from(ErrorKind::Unavailable(reason))),
            None => Ok(None),
        }
    }
}
