use crate::error::Result;
use crate::handle::AssetBlob;
use async_trait::async_trait;
use derive_more::{Display, From};
use std::borrow::Borrow;
use std::sync::Arc;

pub type ResolverHandle = Arc<dyn AssetResolver>;

/// Opaque identifier of a fetchable asset (in practice, a catalog item id).
#[derive(Clone, Debug, Display, From, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey(String);

impl AssetKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AssetKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&String> for AssetKey {
    fn from(value: &String) -> Self {
        Self(value.clone())
    }
}

impl AsRef<str> for AssetKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for AssetKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Loads the bytes for an asset key.
///
/// `Ok(None)` means the asset genuinely does not exist; `Err` means it could
/// not be read. The cache treats both as "absent" and never retries on its own.
#[async_trait]
pub trait AssetResolver: Send + Sync {
    async fn resolve(&self, key: &AssetKey) -> Result<Option<AssetBlob>>;
}
