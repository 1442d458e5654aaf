//! Registry of uniquely-named entries
//!
//! Entries carry their own mutable string id (see [`Identity`]); the
//! registry keeps those ids unique and looks entries up by them. Removal is
//! by pointer identity so a rename racing with an unregister can never
//! remove some other entry that happens to hold the old name.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::error::EndpointError;

/// Mutable string id shared by registry entries
#[derive(Debug, Default)]
pub struct Identity {
    id: RwLock<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: RwLock::new(id.into()),
        }
    }

    pub fn get(&self) -> String {
        self.id.read().clone()
    }

    pub fn matches(&self, id: &str) -> bool {
        *self.id.read() == id
    }

    fn set(&self, id: String) {
        *self.id.write() = id;
    }
}

/// Anything that can live in an [`EndpointRegistry`].
pub trait Identified: Send + Sync {
    fn identity(&self) -> &Identity;

    fn id(&self) -> String {
        self.identity().get()
    }
}

/// Uniquely-named set of shared entries
pub struct EndpointRegistry<T: Identified> {
    entries: Mutex<Vec<Arc<T>>>,
}

impl<T: Identified> Default for EndpointRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Identified> EndpointRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Insert `entry`, rewriting its id to `id`, `id-0`, `id-1`, ... until
    /// unique. Returns the id it was registered under.
    pub fn register(&self, entry: Arc<T>) -> String {
        let mut entries = self.entries.lock();
        let requested = entry.id();
        let id = unique_id(&entries, &requested, None);
        if id != requested {
            tracing::debug!("Endpoint id {} taken, registering as {}", requested, id);
            entry.identity().set(id.clone());
        }
        entries.push(entry);
        id
    }

    /// Remove `entry` by pointer identity.
    pub fn unregister(&self, entry: &Arc<T>) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Give the entry currently named `old_id` the id `new_id`.
    ///
    /// Fails with `IdInUse` when another entry already holds `new_id`.
    pub fn rename(&self, old_id: &str, new_id: &str) -> Result<Arc<T>, EndpointError> {
        if new_id.is_empty() {
            return Err(EndpointError::InvalidConfig("empty endpoint id".to_string()));
        }

        let entries = self.entries.lock();
        let entry = entries
            .iter()
            .find(|e| e.identity().matches(old_id))
            .cloned()
            .ok_or_else(|| EndpointError::NotFound(old_id.to_string()))?;

        let taken = entries
            .iter()
            .any(|e| !Arc::ptr_eq(e, &entry) && e.identity().matches(new_id));
        if taken {
            return Err(EndpointError::IdInUse(new_id.to_string()));
        }

        entry.identity().set(new_id.to_string());
        Ok(entry)
    }

    /// Rename a registered entry to `requested`, resolving collisions the
    /// way [`register`](Self::register) does. Returns the id it now holds.
    pub fn rename_resolving(&self, entry: &Arc<T>, requested: &str) -> String {
        let entries = self.entries.lock();
        let id = unique_id(&entries, requested, Some(entry));
        entry.identity().set(id.clone());
        id
    }

    pub fn find(&self, id: &str) -> Option<Arc<T>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.identity().matches(id))
            .cloned()
    }

    /// Entries in registration order
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.lock().clone()
    }

    /// Remove and return every entry matching `predicate`.
    pub fn drain_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<Arc<T>> {
        let mut entries = self.entries.lock();
        let mut removed = Vec::new();
        entries.retain(|e| {
            if predicate(e) {
                removed.push(e.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn unique_id<T: Identified>(entries: &[Arc<T>], base: &str, except: Option<&Arc<T>>) -> String {
    let taken = |candidate: &str| {
        entries
            .iter()
            .filter(|e| except.map_or(true, |x| !Arc::ptr_eq(e, x)))
            .any(|e| e.identity().matches(candidate))
    };

    if !taken(base) {
        return base.to_string();
    }
    (0u64..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(Identity);

    impl Named {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self(Identity::new(id)))
        }
    }

    impl Identified for Named {
        fn identity(&self) -> &Identity {
            &self.0
        }
    }

    #[test]
    fn test_collision_suffixes() {
        let registry = EndpointRegistry::new();
        assert_eq!(registry.register(Named::new("player")), "player");
        assert_eq!(registry.register(Named::new("player")), "player-0");
        assert_eq!(registry.register(Named::new("player")), "player-1");
        assert_eq!(registry.len(), 3);
        assert!(registry.find("player-1").is_some());
    }

    #[test]
    fn test_freed_id_is_reused() {
        let registry = EndpointRegistry::new();
        let first = Named::new("den");
        registry.register(first.clone());
        registry.register(Named::new("den"));

        assert!(registry.unregister(&first));
        assert_eq!(registry.register(Named::new("den")), "den");
    }

    #[test]
    fn test_unregister_by_pointer_after_rename() {
        let registry = EndpointRegistry::new();
        let kitchen = Named::new("kitchen");
        let other = Named::new("other");
        registry.register(kitchen.clone());
        registry.register(other.clone());

        registry.rename("kitchen", "patio").unwrap();
        registry.rename("other", "kitchen").unwrap();

        assert!(registry.unregister(&kitchen));
        assert!(!registry.unregister(&kitchen));
        assert_eq!(registry.find("kitchen").unwrap().id(), "kitchen");
        assert!(Arc::ptr_eq(&registry.find("kitchen").unwrap(), &other));
        assert!(registry.find("patio").is_none());
    }

    #[test]
    fn test_rename_rejects_taken_id() {
        let registry = EndpointRegistry::new();
        registry.register(Named::new("a"));
        registry.register(Named::new("b"));

        assert_eq!(
            registry.rename("a", "b").err(),
            Some(EndpointError::IdInUse("b".to_string()))
        );
        assert_eq!(
            registry.rename("missing", "c").err(),
            Some(EndpointError::NotFound("missing".to_string()))
        );
        assert!(registry.rename("a", "a").is_ok());
        assert!(registry.rename("a", "").is_err());
    }

    #[test]
    fn test_rename_resolving_skips_self() {
        let registry = EndpointRegistry::new();
        let session = Named::new("session-1");
        registry.register(Named::new("alice"));
        registry.register(session.clone());

        assert_eq!(registry.rename_resolving(&session, "alice"), "alice-0");
        assert_eq!(registry.rename_resolving(&session, "alice-0"), "alice-0");
        assert_eq!(session.id(), "alice-0");
    }

    #[test]
    fn test_drain_where() {
        let registry = EndpointRegistry::new();
        registry.register(Named::new("keep"));
        registry.register(Named::new("drop-a"));
        registry.register(Named::new("drop-b"));

        let removed = registry.drain_where(|e| e.id().starts_with("drop"));
        assert_eq!(removed.len(), 2);
        let remaining: Vec<String> = registry.snapshot().iter().map(|e| e.id()).collect();
        assert_eq!(remaining, vec!["keep".to_string()]);
    }
}
