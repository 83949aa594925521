//! Node-local shared byte windows with fence synchronization.

use std::sync::{Arc, RwLock};

use tokio::sync::Barrier;

use crate::{CommError, CommResult};

/// A byte region jointly allocated by the ranks of one communicator.
///
/// Each member owns a region whose size it chose at allocation. Discipline:
/// a member writes only its own region between allocation and the fence;
/// reads of any region happen only after the fence. The fence is the sole
/// synchronization point, chosen over lock-based windows for determinism.
/// The window is released when the last handle drops.
pub struct SharedWindow {
    index: usize,
    state: Arc<WindowState>,
}

pub(crate) struct WindowState {
    lens: Vec<usize>,
    regions: Vec<RwLock<Vec<u8>>>,
    fence: Barrier,
}

impl WindowState {
    pub(crate) fn allocate(lens: Vec<usize>) -> Arc<Self> {
        let regions = lens.iter().map(|&len| RwLock::new(vec![0u8; len])).collect();
        let fence = Barrier::new(lens.len());
        Arc::new(WindowState { lens, regions, fence })
    }
}

impl SharedWindow {
    pub(crate) fn new(index: usize, state: Arc<WindowState>) -> Self {
        SharedWindow { index, state }
    }

    /// This rank's index within the window group.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of ranks sharing the window.
    pub fn members(&self) -> usize {
        self.state.lens.len()
    }

    /// Size of the region owned by group member `index` (the indexed size
    /// query of the substrate contract).
    pub fn region_len(&self, index: usize) -> usize {
        self.state.lens[index]
    }

    /// Writes `data` into this rank's own region at `offset`. Only valid
    /// before the publishing fence.
    pub fn write(&self, offset: usize, data: &[u8]) -> CommResult<()> {
        let region_len = self.state.lens[self.index];
        if offset + data.len() > region_len {
            return Err(CommError::WindowBounds {
                offset,
                len: data.len(),
                region: region_len,
            });
        }
        let mut region = self.state.regions[self.index].write().expect("window lock poisoned");
        region[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Publishes writes: blocks until every group member has arrived.
    pub async fn fence(&self) {
        self.state.fence.wait().await;
    }

    /// Reads group member `index`'s region. Only valid after the fence.
    pub fn with_region<R>(&self, index: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let region = self.state.regions[index].read().expect("window lock poisoned");
        f(&region)
    }
}
