//! Client sessions.
//!
//! A [`Session`] is one client connection: the set of memory objects it
//! created, plus the entry points a device file would expose. Every
//! operation holds a power reference for its duration. Closing the session
//! (dropping it) releases every object the client left behind.

use crate::action::Action;
use crate::device::Device;
use crate::error::{NpuError, Result};
use crate::job::{SubmitOutcome, SubmitRequest};
use crate::memory::{MemInfo, MemoryObject, ObjectId, SyncFlags};
use crate::sync::lock;
use std::ops::Range;
use std::sync::{Arc, Mutex};

/// One client connection to a [`Device`].
#[derive(Debug)]
pub struct Session {
    device: Arc<Device>,
    objects: Mutex<Vec<Arc<MemoryObject>>>,
}

impl Session {
    pub(crate) fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            objects: Mutex::new(Vec::new()),
        }
    }

    /// Device this session talks to.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Allocate (`external == None`) or import a buffer and add it to the session.
    ///
    /// # Errors
    ///
    /// See [`MemoryManager::create`](crate::memory::MemoryManager::create).
    pub fn create(&self, size: u64, external: Option<u32>) -> Result<MemInfo> {
        let _power = self.device.power().guard()?;
        let object = self.device.memory().create(size, external)?;
        let info = object.info();
        lock(&self.objects).push(Arc::new(object));
        Ok(info)
    }

    /// Remove a buffer from the session and release it.
    ///
    /// A buffer still referenced by an in-flight job is released when the
    /// job lets go of it.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] if the session holds no such object.
    pub fn destroy(&self, id: ObjectId) -> Result<()> {
        let _power = self.device.power().guard()?;
        let removed = {
            let mut objects = lock(&self.objects);
            let index = objects
                .iter()
                .position(|obj| obj.id() == id)
                .ok_or_else(|| NpuError::not_found(id.to_string()))?;
            objects.swap_remove(index)
        };
        if Arc::strong_count(&removed) > 1 {
            tracing::warn!("mem_destroy: {id} still referenced by a job");
        }
        drop(removed);
        Ok(())
    }

    /// Cache maintenance on one buffer.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] if the session holds no such object.
    pub fn sync(&self, id: ObjectId, flags: SyncFlags) -> Result<()> {
        let _power = self.device.power().guard()?;
        self.object(id)?.sync(flags);
        Ok(())
    }

    /// Opaque offset an mmap of the buffer is requested at.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] if the session holds no such object.
    pub fn map_offset(&self, id: ObjectId) -> Result<u64> {
        Ok(self.object(id)?.dma_addr())
    }

    /// Resolve an mmap request of `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] if no buffer starts at `offset`, or
    /// [`NpuError::InvalidArgument`] if `len` exceeds the buffer.
    pub fn lookup_mmap(&self, offset: u64, len: u64) -> Result<Arc<MemoryObject>> {
        let object = lock(&self.objects)
            .iter()
            .find(|obj| obj.dma_addr() == offset)
            .cloned()
            .ok_or_else(|| NpuError::not_found(format!("mapping at {offset:#x}")))?;
        if len > object.size() {
            return Err(NpuError::invalid_argument(format!(
                "mmap of {len:#x} bytes exceeds {} ({:#x} bytes)",
                object.id(),
                object.size()
            )));
        }
        Ok(object)
    }

    /// Shared handle on one of the session's buffers.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] if the session holds no such object.
    pub fn object(&self, id: ObjectId) -> Result<Arc<MemoryObject>> {
        lock(&self.objects)
            .iter()
            .find(|obj| obj.id() == id)
            .cloned()
            .ok_or_else(|| NpuError::not_found(id.to_string()))
    }

    /// Submit a job whose task buffer belongs to this session.
    ///
    /// Blocks until the job completes unless the request is nonblocking.
    ///
    /// # Errors
    ///
    /// - [`NpuError::InvalidArgument`] for a malformed request
    /// - [`NpuError::NotFound`] if the task buffer is not in the session
    /// - [`NpuError::Timeout`] with the partial task counter
    /// - [`NpuError::DeviceFault`] if a reset interrupted the job
    pub fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome> {
        let _power = self.device.power().guard()?;
        let objects = lock(&self.objects).clone();
        self.device.submit(&objects, request)
    }

    /// Run an auxiliary action.
    ///
    /// # Errors
    ///
    /// Propagates [`Device::action`] errors.
    pub fn action(&self, action: Action) -> Result<u32> {
        let _power = self.device.power().guard()?;
        self.device.action(action)
    }

    /// Device address range of every live buffer.
    pub fn ranges(&self) -> Vec<Range<u64>> {
        lock(&self.objects).iter().map(|obj| obj.range()).collect()
    }

    /// Live buffers.
    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    /// Whether the session holds no buffers.
    pub fn is_empty(&self) -> bool {
        lock(&self.objects).is_empty()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let leaked = std::mem::take(&mut *lock(&self.objects));
        if !leaked.is_empty() {
            tracing::info!("session close: releasing {} buffers", leaked.len());
        }
        drop(leaked);
        self.device.session_closed();
    }
}
