//! The execution context: one queue, one fence and the deferred deletion queue.
//!
//! Every GPU object is destroyed through [`Context::defer_retire`]. An entry is stamped
//! with the most recently signaled fence value and only handed back to the device once
//! that value has completed, so nothing is freed while queued work may still touch it.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{
    BackendKind, BackendLimits, BufferDesc, HeapType, RaytracingBackend, ResourceState,
};
use crate::command_list::{ClosedCommandList, CommandList, RetiredCommandAllocator};
use crate::deferred::DeferredBuffer;
use crate::error::{DeviceError, DeviceResultExt, RenderError, Result};
use crate::utility::aligned_size_u64;

/// Something the device still owns until a fence value completes.
pub(crate) trait Retire: Send {
    fn retire(self: Box<Self>, backend: &mut dyn RaytracingBackend);
}

struct PendingDeletion {
    fence: u64,
    item: Box<dyn Retire>,
}

struct ContextInner {
    backend: Box<dyn RaytracingBackend>,
    /// Last value the queue was asked to signal.
    fence_value: u64,
    submissions: u64,
    deletion_queue: VecDeque<PendingDeletion>,
}

impl ContextInner {
    fn retire_completed(&mut self, completed: u64) -> usize {
        let mut freed = 0;
        while let Some(front) = self.deletion_queue.front() {
            if front.fence > completed {
                break;
            }
            if let Some(entry) = self.deletion_queue.pop_front() {
                entry.item.retire(self.backend.as_mut());
                freed += 1;
            }
        }
        freed
    }
}

pub struct Context {
    kind: BackendKind,
    limits: BackendLimits,
    inner: Mutex<ContextInner>,
}

impl Context {
    pub fn new(backend: Box<dyn RaytracingBackend>) -> Arc<Self> {
        log::info!("Execution context on the {:?} backend", backend.kind());
        Arc::new(Self {
            kind: backend.kind(),
            limits: backend.limits(),
            inner: Mutex::new(ContextInner {
                backend,
                fence_value: 0,
                submissions: 0,
                deletion_queue: VecDeque::new(),
            }),
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn limits(&self) -> BackendLimits {
        self.limits
    }

    /// Runs `f` with exclusive access to the device.
    ///
    /// `f` must not drop any RAII handle, those re-enter the context.
    pub(crate) fn with_backend<R>(&self, f: impl FnOnce(&mut dyn RaytracingBackend) -> R) -> R {
        let mut inner = self.inner.lock();
        f(inner.backend.as_mut())
    }

    pub fn create_buffer(self: &Arc<Self>, desc: &BufferDesc) -> Result<DeferredBuffer> {
        let (resource, address) = self
            .with_backend(|backend| {
                let resource = backend.create_buffer(desc)?;
                match backend.gpu_virtual_address(resource) {
                    Ok(address) => Ok((resource, address)),
                    Err(err) => {
                        backend.destroy_buffer(resource);
                        Err(err)
                    }
                }
            })
            .during("CreateCommittedResource")?;
        Ok(DeferredBuffer::new(
            self.clone(),
            resource,
            desc.clone(),
            address,
        ))
    }

    /// Creates an upload heap buffer holding `data`. Constant buffers are padded to the
    /// constant buffer alignment.
    pub fn upload_data(self: &Arc<Self>, data: &[u8], is_constant: bool) -> Result<DeferredBuffer> {
        self.upload_labeled("upload", data, is_constant)
    }

    pub fn upload_labeled(
        self: &Arc<Self>,
        label: &str,
        data: &[u8],
        is_constant: bool,
    ) -> Result<DeferredBuffer> {
        let len = (data.len() as u64).max(1);
        let size = if is_constant {
            aligned_size_u64(len, self.limits.constant_buffer_alignment as u64)
        } else {
            len
        };
        let buffer = self.create_buffer(&BufferDesc {
            label: label.to_owned(),
            size,
            heap: HeapType::Upload,
            initial_state: ResourceState::GenericRead,
        })?;
        self.with_backend(|backend| backend.write_buffer(buffer.resource(), 0, data))
            .during("Map")?;
        Ok(buffer)
    }

    /// Reads buffer contents back. The caller waits for any GPU writes first.
    pub fn read_buffer(&self, buffer: &DeferredBuffer, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.with_backend(|backend| backend.read_buffer(buffer.resource(), offset, len))
            .during("ReadBuffer")
    }

    pub fn create_command_list_allocator_pair(self: &Arc<Self>) -> Result<CommandList> {
        let allocator = self
            .with_backend(|backend| backend.create_command_allocator())
            .during("CreateCommandAllocator")?;
        Ok(CommandList::new(self.clone(), allocator))
    }

    /// Submits `list`, signals the next fence value and returns it. The list's allocator
    /// is retired once that value completes.
    pub fn execute_command_list(&self, mut list: ClosedCommandList) -> Result<u64> {
        if !std::ptr::eq(Arc::as_ptr(list.context()), self) {
            return Err(RenderError::Device {
                operation: "ExecuteCommandLists",
                source: DeviceError::Validation(
                    "command list was recorded for another context".into(),
                ),
            });
        }
        let (allocator, commands) = list.take();
        let Some(allocator) = allocator else {
            return Ok(self.last_signaled_fence());
        };

        let mut inner = self.inner.lock();
        let signal = inner.fence_value + 1;
        let submitted = inner.backend.submit(allocator, &commands, signal);
        if submitted.is_ok() {
            inner.fence_value = signal;
            inner.submissions += 1;
        }
        let fence = inner.fence_value;
        inner.deletion_queue.push_back(PendingDeletion {
            fence,
            item: Box::new(RetiredCommandAllocator(allocator)),
        });
        drop(inner);

        submitted.during("ExecuteCommandLists")?;
        log::trace!("Executed {} commands, fence {}", commands.len(), signal);
        Ok(signal)
    }

    /// Queues `item` for retirement after everything submitted so far.
    pub(crate) fn defer_retire(&self, item: Box<dyn Retire>) {
        let mut inner = self.inner.lock();
        let fence = inner.fence_value;
        inner.deletion_queue.push_back(PendingDeletion { fence, item });
    }

    /// Hands `buffer` to the deletion queue. Same as dropping it.
    pub fn defer_delete(&self, buffer: DeferredBuffer) {
        debug_assert!(std::ptr::eq(Arc::as_ptr(buffer.context()), self));
        drop(buffer);
    }

    /// Frees every queued entry whose fence has completed and returns how many were freed.
    pub fn clear_deferred_deletion_queue(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let completed = inner
            .backend
            .completed_fence_value()
            .during("GetCompletedValue")?;
        let freed = inner.retire_completed(completed);
        if freed > 0 {
            log::trace!("Retired {} deferred deletions at fence {}", freed, completed);
        }
        Ok(freed)
    }

    pub fn wait_for_fence(&self, value: u64) -> Result<()> {
        self.with_backend(|backend| backend.wait_for_fence(value))
            .during("SetEventOnCompletion")
    }

    pub fn wait_for_idle(&self) -> Result<()> {
        let value = self.last_signaled_fence();
        if value == 0 {
            return Ok(());
        }
        self.wait_for_fence(value)
    }

    pub fn completed_fence_value(&self) -> Result<u64> {
        self.with_backend(|backend| backend.completed_fence_value())
            .during("GetCompletedValue")
    }

    pub fn last_signaled_fence(&self) -> u64 {
        self.inner.lock().fence_value
    }

    pub fn submission_count(&self) -> u64 {
        self.inner.lock().submissions
    }

    pub fn pending_deletions(&self) -> usize {
        self.inner.lock().deletion_queue.len()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.fence_value > 0 {
            if let Err(err) = inner.backend.wait_for_fence(inner.fence_value) {
                log::error!("Could not wait for the queue to go idle: {}", err);
            }
        }
        let freed = inner.retire_completed(u64::MAX);
        log::debug!("Context dropped, retired {} remaining objects", freed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FallbackBackend, FallbackOptions};

    fn context(latency: u32) -> Arc<Context> {
        Context::new(Box::new(FallbackBackend::new(FallbackOptions { latency })))
    }

    fn empty_submission(context: &Arc<Context>) -> u64 {
        let list = context.create_command_list_allocator_pair().unwrap();
        context.execute_command_list(list.close()).unwrap()
    }

    #[test]
    fn fence_values_increase_per_submission() {
        let context = context(0);
        assert_eq!(empty_submission(&context), 1);
        assert_eq!(empty_submission(&context), 2);
        assert_eq!(context.last_signaled_fence(), 2);
        assert_eq!(context.submission_count(), 2);
    }

    #[test]
    fn constant_uploads_are_padded() {
        let context = context(0);
        let buffer = context.upload_data(&[1, 2, 3], true).unwrap();
        assert_eq!(buffer.size(), 256);
        let plain = context.upload_data(&[1, 2, 3], false).unwrap();
        assert_eq!(plain.size(), 3);
        assert_eq!(context.read_buffer(&buffer, 0, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn deferred_buffer_waits_for_its_fence() {
        let context = context(1);
        let buffer = context.upload_data(&[0; 16], false).unwrap();
        let fence = empty_submission(&context);
        // The submission's allocator is already queued at `fence`.
        assert_eq!(context.pending_deletions(), 1);

        context.defer_delete(buffer);
        assert_eq!(context.pending_deletions(), 2);
        assert_eq!(context.clear_deferred_deletion_queue().unwrap(), 0);

        context.wait_for_fence(fence).unwrap();
        assert_eq!(context.clear_deferred_deletion_queue().unwrap(), 2);
        assert_eq!(context.pending_deletions(), 0);
    }

    #[test]
    fn clearing_stops_at_the_first_unretired_entry() {
        let context = context(1);
        let first = context.upload_data(&[0; 4], false).unwrap();
        drop(first);
        let fence = empty_submission(&context);
        let second = context.upload_data(&[0; 4], false).unwrap();
        drop(second);

        // first: fence 0, allocator: fence 1, second: fence 1. Fence 1 is still queued.
        assert_eq!(context.clear_deferred_deletion_queue().unwrap(), 1);
        assert_eq!(context.pending_deletions(), 2);
        context.wait_for_fence(fence).unwrap();
        assert_eq!(context.clear_deferred_deletion_queue().unwrap(), 2);
    }

    #[test]
    fn unexecuted_command_lists_release_their_allocator() {
        let context = context(1);
        let list = context.create_command_list_allocator_pair().unwrap();
        drop(list);
        assert_eq!(context.pending_deletions(), 1);
        assert_eq!(context.clear_deferred_deletion_queue().unwrap(), 1);
    }

    #[test]
    fn wait_for_idle_without_submissions_is_a_no_op() {
        let context = context(1);
        context.wait_for_idle().unwrap();
        assert_eq!(context.completed_fence_value().unwrap(), 0);
    }
}
