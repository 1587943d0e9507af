//! Bookkeeping registry: engine identity → owning environment holder.
//!
//! Engine-level callbacks only carry the engine instance; the registry
//! recovers the owning [`EnvironmentHandle`](crate::EnvironmentHandle) from
//! it. Entries are inserted at environment construction and removed during
//! teardown. The registry holds weak references so it never extends an
//! environment's lifetime.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use crate::engine::EngineId;
use crate::environment::EnvironmentHandle;

#[derive(Default)]
pub struct Registry {
    map: Mutex<HashMap<EngineId, Weak<EnvironmentHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub(crate) fn insert(&self, id: EngineId, holder: &std::sync::Arc<EnvironmentHandle>) {
        let mut map = self.map.lock().unwrap();
        let previous = map.insert(id, std::sync::Arc::downgrade(holder));
        debug_assert!(previous.is_none(), "engine id registered twice");
    }

    pub(crate) fn remove(&self, id: EngineId) {
        self.map.lock().unwrap().remove(&id);
    }

    /// Recover the owning holder for an engine instance, if the environment
    /// is still alive.
    pub fn lookup(&self, id: EngineId) -> Option<std::sync::Arc<EnvironmentHandle>> {
        self.map.lock().unwrap().get(&id).and_then(Weak::upgrade)
    }
}
