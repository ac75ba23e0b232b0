//! LoRA adapter set management.

use cactus_engine::{AdapterHandle, InferenceBackend};
use cactus_runtime::Logger;

use crate::config::LoraAdapter;
use crate::error::Result;

/// The adapter set committed to a backend.
#[derive(Debug, Clone, Default)]
pub struct AdapterManager {
    loaded: Vec<LoraAdapter>,
}

impl AdapterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active set with `adapters`.
    ///
    /// Every adapter is loaded before the set is swapped, so a failure leaves
    /// the previous set active. Entries with an empty path are skipped; an
    /// empty list removes all adapters.
    ///
    /// # Errors
    /// - `Engine`: an adapter failed to load or the swap was rejected
    pub fn apply(
        &mut self,
        backend: &mut dyn InferenceBackend,
        adapters: &[LoraAdapter],
        logger: &dyn Logger,
    ) -> Result<()> {
        let mut handles: Vec<(AdapterHandle, f32)> = Vec::with_capacity(adapters.len());
        let mut committed = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            if adapter.path.is_empty() {
                logger.warn(format_args!("Skipping LoRA adapter with empty path"));
                continue;
            }
            logger.info(format_args!(
                "Loading LoRA adapter: {} (scale {})",
                adapter.path, adapter.scale
            ));
            let handle = backend.load_adapter(&adapter.path).inspect_err(|e| {
                logger.error(format_args!(
                    "Failed to load LoRA adapter {}: {e}",
                    adapter.path
                ));
            })?;
            handles.push((handle, adapter.scale));
            committed.push(adapter.clone());
        }

        backend.set_adapters(&handles)?;
        self.loaded = committed;
        logger.info(format_args!("{} LoRA adapters applied", self.loaded.len()));
        Ok(())
    }

    /// Clear all adapters.
    pub fn remove(
        &mut self,
        backend: &mut dyn InferenceBackend,
        logger: &dyn Logger,
    ) -> Result<()> {
        self.apply(backend, &[], logger)
    }

    /// The committed set, in application order.
    pub fn loaded(&self) -> &[LoraAdapter] {
        &self.loaded
    }

    pub(crate) fn forget(&mut self) {
        self.loaded.clear();
    }
}
