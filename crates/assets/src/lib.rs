//! On-demand cover fetching under bounded concurrency.
//!
//! Catalog views only need the covers of whatever is currently visible. The
//! [`AssetCache`] takes those keys in visibility order, resolves them through an
//! [`AssetResolver`] with at most `K` fetches in flight, and hands out
//! [`AssetHandle`]s whose lifetime the cache owns: a handle is released exactly
//! once, when its key is evicted, when it is replaced by a forced refresh, or
//! when the cache is torn down.
//!
//! Failures are cosmetic (a missing cover) and are never retried on their own.

mod cache;
pub mod error;
mod handle;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod resolver;

pub use crate::cache::{AssetCache, DEFAULT_MAX_CONCURRENT, EntryState};
pub use crate::handle::{AssetBlob, AssetHandle, HandleRegistry};
#[cfg(any(test, feature = "mock"))]
pub use crate::mock::MockResolver;
pub use crate::resolver::{AssetKey, AssetResolver, ResolverHandle};
