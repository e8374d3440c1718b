//! Matrix handle registry
//!
//! [`MemoryAllocator`] mints fresh handles from an engine's arena and keeps a
//! name for each one. Names only serve diagnostics: the engine never looks a
//! matrix up by name. The allocator is one context object per pipeline and is
//! threaded through every call by `&mut`; it is not `Clone`.

use std::collections::HashMap;

use crate::engine::Engine;
use crate::error::{Result, SimError};
use crate::matrix::MatrixId;

/// Name registry for matrix handles
#[derive(Debug, Default)]
pub struct MemoryAllocator {
    by_name: HashMap<String, MatrixId>,
    names: HashMap<MatrixId, String>,
}

impl MemoryAllocator {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh, unproduced handle in `engine` and register it under `name`
    ///
    /// No storage is reserved; the shape is only known once the producing
    /// operation runs.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if `name` is already registered.
    pub fn allocate(&mut self, engine: &mut Engine, name: impl Into<String>) -> Result<MatrixId> {
        let name = name.into();
        self.ensure_free(&name)?;
        let id = engine.reserve();
        self.register(id, name);
        Ok(id)
    }

    /// Register an existing handle under `name`
    ///
    /// A handle may carry several names; diagnostics use the first one.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if `name` is already registered.
    pub fn bind(&mut self, id: MatrixId, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.ensure_free(&name)?;
        self.register(id, name);
        Ok(())
    }

    /// Handle registered under `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<MatrixId> {
        self.by_name.get(name).copied()
    }

    /// Diagnostic name of a handle
    #[must_use]
    pub fn name_of(&self, id: MatrixId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Name of a handle, or its arena index when unnamed
    #[must_use]
    pub fn label(&self, id: MatrixId) -> String {
        self.name_of(id)
            .map_or_else(|| id.to_string(), ToString::to_string)
    }

    /// Number of registered names
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether no name is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Registered (name, handle) pairs in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = (&str, MatrixId)> {
        self.by_name.iter().map(|(name, &id)| (name.as_str(), id))
    }

    fn ensure_free(&self, name: &str) -> Result<()> {
        match self.by_name.get(name) {
            Some(&existing) => Err(SimError::DuplicateName {
                name: name.to_string(),
                existing,
            }),
            None => Ok(()),
        }
    }

    fn register(&mut self, id: MatrixId, name: String) {
        self.names.entry(id).or_insert_with(|| name.clone());
        self.by_name.insert(name, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SlotState;

    #[test]
    fn test_allocate_mints_unproduced_handles() {
        let mut engine = Engine::new();
        let mut alloc = MemoryAllocator::new();
        let a = alloc.allocate(&mut engine, "a").unwrap();
        let b = alloc.allocate(&mut engine, "b").unwrap();

        assert_ne!(a, b);
        assert_eq!(engine.state(a).unwrap(), SlotState::Unproduced);
        assert_eq!(alloc.get("a"), Some(a));
        assert_eq!(alloc.name_of(b), Some("b"));
        assert_eq!(alloc.len(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut engine = Engine::new();
        let mut alloc = MemoryAllocator::new();
        let first = alloc.allocate(&mut engine, "K_all").unwrap();
        let err = alloc.allocate(&mut engine, "K_all").unwrap_err();

        assert_eq!(
            err,
            SimError::DuplicateName {
                name: "K_all".to_string(),
                existing: first,
            }
        );
        // The failed allocation must not mint a slot
        assert_eq!(engine.slot_count(), 1);
    }

    #[test]
    fn test_bind_existing_matrix() {
        let mut engine = Engine::new();
        let mut alloc = MemoryAllocator::new();
        let q = engine.create_matrix(1, 2, vec![1.0, 2.0]).unwrap();
        alloc.bind(q, "Q").unwrap();
        alloc.bind(q, "query").unwrap();

        assert_eq!(alloc.get("Q"), Some(q));
        assert_eq!(alloc.get("query"), Some(q));
        assert_eq!(alloc.name_of(q), Some("Q"));
    }

    #[test]
    fn test_label_falls_back_to_index() {
        let mut engine = Engine::new();
        let alloc = MemoryAllocator::new();
        let q = engine.create_matrix(1, 1, vec![1.0]).unwrap();
        assert_eq!(alloc.label(q), "#0");
    }

    #[test]
    fn test_iter_and_empty() {
        let mut engine = Engine::new();
        let mut alloc = MemoryAllocator::new();
        assert!(alloc.is_empty());
        alloc.allocate(&mut engine, "x").unwrap();
        let pairs: Vec<_> = alloc.iter().collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "x");
    }
}
