//! Registry of native type procedures.
//!
//! Each registered native type is stored under its type id. Dispatching
//! a message temporarily takes the procedure out of its slot so the
//! machine stays borrowable for argument access; [`NativeRegistry::put_back`]
//! returns it.

use beryl_sdk::NativeType;
use rustc_hash::FxHashMap;

/// Native type procedures of one VM state.
#[derive(Default)]
pub struct NativeRegistry {
    procs: FxHashMap<u32, Option<Box<dyn NativeType>>>,
    by_name: FxHashMap<String, u32>,
}

impl NativeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a procedure to a type id.
    pub fn insert(&mut self, type_id: u32, proc_: Box<dyn NativeType>) {
        self.by_name.insert(proc_.class_name().to_string(), type_id);
        self.procs.insert(type_id, Some(proc_));
    }

    /// Type id registered under a class name.
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// True when a procedure is bound to the type id.
    pub fn contains(&self, type_id: u32) -> bool {
        self.procs.contains_key(&type_id)
    }

    /// Take a procedure out for dispatch. Returns `None` when no type
    /// is bound or a dispatch is already in flight.
    pub fn take(&mut self, type_id: u32) -> Option<Box<dyn NativeType>> {
        self.procs.get_mut(&type_id).and_then(|slot| slot.take())
    }

    /// Return a procedure after dispatch.
    pub fn put_back(&mut self, type_id: u32, proc_: Box<dyn NativeType>) {
        self.procs.insert(type_id, Some(proc_));
    }

    /// All registered type ids.
    pub fn type_ids(&self) -> Vec<u32> {
        self.procs.keys().copied().collect()
    }

    /// Drop every registration. Used at terminate, after the
    /// `Terminate`/`Unregister` messages went out.
    pub fn clear(&mut self) {
        self.procs.clear();
        self.by_name.clear();
    }
}
