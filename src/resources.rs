//! In-memory track resources and their lifecycle.
//!
//! A completed prefetch is materialized as one contiguous byte buffer and
//! published into the [`ResourceArena`] under the track index it belongs
//! to. Consumers only ever see an opaque [`Locator`], which the playback
//! engine resolves back into bytes when it loads the track.
//!
//! Resources live until they are revoked: explicitly, when replaced by a
//! newer resource for the same index, or in bulk at teardown. Revoking a
//! resource that an engine has already resolved does not pull the bytes
//! out from under it; the engine keeps its own reference until it loads
//! something else.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use uuid::Uuid;

/// Opaque, process-local address of a materialized resource.
///
/// Only usable as a playback source. Never persisted or transmitted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Locator(String);

impl Locator {
    const SCHEME: &'static str = "blob:tapedeck/";

    fn generate() -> Self {
        Self(format!("{}{}", Self::SCHEME, Uuid::new_v4()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct Resource {
    locator: Locator,
    data: Bytes,
}

/// Arena of materialized resources keyed by track index.
///
/// Cloning is cheap and yields a handle to the same arena.
#[derive(Clone, Debug, Default)]
pub struct ResourceArena {
    inner: Arc<Mutex<HashMap<usize, Resource>>>,
}

impl ResourceArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Resource>> {
        // Nothing in the arena can be left half-updated by a panic.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes `data` as the resource for `index` and returns its
    /// locator. A previous resource for the same index is revoked.
    pub fn publish(&self, index: usize, data: Bytes) -> Locator {
        let locator = Locator::generate();
        let size = data.len();
        let previous = self.lock().insert(
            index,
            Resource {
                locator: locator.clone(),
                data,
            },
        );

        if let Some(previous) = previous {
            debug!("replaced resource {} for track {index}", previous.locator);
        }
        trace!("published {size} bytes for track {index} as {locator}");

        locator
    }

    /// Resolves a locator into the bytes it refers to.
    #[must_use]
    pub fn resolve(&self, locator: &Locator) -> Option<Bytes> {
        self.lock()
            .values()
            .find(|resource| resource.locator == *locator)
            .map(|resource| resource.data.clone())
    }

    /// Revokes every resource and returns the affected track indices in
    /// ascending order.
    pub fn revoke_all(&self) -> Vec<usize> {
        let mut revoked: Vec<usize> = self.lock().drain().map(|(index, _)| index).collect();
        revoked.sort_unstable();
        if !revoked.is_empty() {
            debug!("revoked resources for tracks {revoked:?}");
        }
        revoked
    }

    #[must_use]
    pub fn contains(&self, locator: &Locator) -> bool {
        self.resolve(locator).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_resolve() {
        let arena = ResourceArena::new();
        let locator = arena.publish(3, Bytes::from_static(b"ID3"));

        assert!(locator.as_str().starts_with("blob:tapedeck/"));
        assert_eq!(arena.resolve(&locator).unwrap(), Bytes::from_static(b"ID3"));
        assert!(arena.contains(&locator));
    }

    #[test]
    fn replacing_releases_previous_resource() {
        let arena = ResourceArena::new();
        let first = arena.publish(0, Bytes::from_static(b"one"));
        let second = arena.publish(0, Bytes::from_static(b"two"));

        assert_ne!(first, second);
        assert!(!arena.contains(&first));
        assert!(arena.contains(&second));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn revoked_bytes_survive_in_existing_handles() {
        let arena = ResourceArena::new();
        let locator = arena.publish(1, Bytes::from_static(b"data"));
        let held = arena.resolve(&locator).unwrap();

        assert_eq!(arena.revoke_all(), vec![1]);
        assert!(arena.resolve(&locator).is_none());
        assert_eq!(held, Bytes::from_static(b"data"));
        assert!(arena.revoke_all().is_empty());
    }

    #[test]
    fn revoke_all_reports_indices() {
        let arena = ResourceArena::new();
        arena.publish(2, Bytes::new());
        arena.publish(0, Bytes::new());

        assert_eq!(arena.revoke_all(), vec![0, 2]);
        assert!(arena.is_empty());
    }
}
