//! Optional process-wide store accessor.
//!
//! Components receive their store explicitly; this accessor exists for hosts
//! that want one shared instance. Tests call [`reset_shared_store`] to start
//! from a clean slate.

use super::StateStore;
use parking_lot::RwLock;
use std::sync::Arc;

static SHARED_STORE: RwLock<Option<Arc<StateStore>>> = RwLock::new(None);

/// Installs `store` as the shared instance, returning the previous one.
pub fn install_shared_store(store: Arc<StateStore>) -> Option<Arc<StateStore>> {
    SHARED_STORE.write().replace(store)
}

/// Returns the shared store, if one is installed.
#[must_use]
pub fn shared_store() -> Option<Arc<StateStore>> {
    SHARED_STORE.read().clone()
}

/// Removes the shared store, returning it so the caller can close it.
pub fn reset_shared_store() -> Option<Arc<StateStore>> {
    SHARED_STORE.write().take()
}
