//! Per-group state
//!
//! One `GroupContext` exists per worker process and lives exactly as long as
//! it. Tests of the same group see each other's state only because they run
//! in the same process; nothing here ever crosses a process boundary.

use fxhash::FxHashMap;
use std::any::{Any, TypeId};

/// State shared by the tests of one execution group
pub struct GroupContext {
    group_key: String,
    current_item: String,
    state: FxHashMap<TypeId, Box<dyn Any>>,
}

impl GroupContext {
    /// Create the context for a group
    pub fn new(group_key: impl Into<String>) -> Self {
        Self {
            group_key: group_key.into(),
            current_item: String::new(),
            state: FxHashMap::default(),
        }
    }

    /// Key of the group being executed
    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    /// Identifier of the test currently running
    pub fn current_item(&self) -> &str {
        &self.current_item
    }

    pub(crate) fn set_current_item(&mut self, id: &str) {
        self.current_item.clear();
        self.current_item.push_str(id);
    }

    /// Get the group's value of type `T`, creating it on first use
    pub fn state<T: Default + 'static>(&mut self) -> &mut T {
        self.state
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(T::default()))
            .downcast_mut::<T>()
            .unwrap_or_else(|| unreachable!("state map is keyed by TypeId"))
    }

    /// Get the group's value of type `T` if some test created it
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.state
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for GroupContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupContext")
            .field("group_key", &self.group_key)
            .field("current_item", &self.current_item)
            .field("entries", &self.state.len())
            .finish()
    }
}
