//! Pluggable byte-level persistence.
//!
//! The engine never touches files itself. Anything that can load and save a
//! blob can back a [`ChangeLog`](crate::ChangeLog) or a checkpoint.

use crate::error::Result;
use std::sync::{Arc, Mutex};

/// Load/save primitives for one persisted slot.
pub trait Persistence: Send + Sync {
    /// Last saved bytes, `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the slot contents. Must be atomic: after a crash either the
    /// old or the new bytes are visible, never a mix.
    fn save(&self, bytes: &[u8]) -> Result<()>;
}

impl<P: Persistence + ?Sized> Persistence for Arc<P> {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        (**self).load()
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        (**self).save(bytes)
    }
}

impl<P: Persistence + ?Sized> Persistence for Box<P> {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        (**self).load()
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        (**self).save(bytes)
    }
}

/// In-memory slot. Clones share the same buffer, which lets tests simulate a
/// restart by handing a clone to a fresh instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.contents())
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(bytes.to_vec());
        Ok(())
    }
}
