/*! Fences and sync points.
 *
 * A [`Fence`] is a monotonically increasing counter. Queues signal it after
 * the work submitted before the signal, and the CPU learns about GPU
 * progress only by reading it back. The value read back is cached so that
 * repeated completion checks against old values never reach the driver.
 *
 * A [`SyncPoint`] pairs a fence with a value and is what the rest of the
 * crate stores to know when memory may be reused. A [`PendingSyncPoint`] is
 * a sync point that is not known yet because the command list it belongs to
 * has not been submitted.
!*/

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use hal::{Fence as _, Queue as _};
use once_cell::sync::OnceCell;

use crate::{device::DeviceError, fatal, hal_api::HalApi, resource_log, FenceValue};

#[derive(Clone, Copy, Debug)]
pub(crate) struct WaitSettings {
    pub slice_ms: u32,
    pub timeout_ms: u32,
}

impl From<&crate::Settings> for WaitSettings {
    fn from(settings: &crate::Settings) -> Self {
        Self {
            slice_ms: settings.fence_wait_slice_ms,
            timeout_ms: settings.fence_wait_timeout_ms,
        }
    }
}

pub struct Fence<A: HalApi> {
    raw: A::Fence,
    label: String,
    /// The value the next [`Fence::signal`] will use. Starts at 1 so that
    /// the initial completed value of 0 never satisfies a real signal.
    next_value: AtomicU64,
    last_completed: AtomicU64,
    wait: WaitSettings,
}

impl<A: HalApi> Fence<A> {
    pub(crate) fn new(
        device: &A::Device,
        label: &str,
        wait: WaitSettings,
    ) -> Result<Self, DeviceError> {
        use hal::Device as _;

        let raw = device.create_fence()?;
        resource_log!("Created fence {label}");
        Ok(Self {
            raw,
            label: label.to_string(),
            next_value: AtomicU64::new(1),
            last_completed: AtomicU64::new(0),
            wait,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn raw(&self) -> &A::Fence {
        &self.raw
    }

    /// The value of the most recent signal, or 0 if never signalled.
    pub fn last_signaled(&self) -> FenceValue {
        self.next_value.load(Ordering::Acquire) - 1
    }

    /// The last completed value observed, without asking the driver.
    pub fn cached_completed(&self) -> FenceValue {
        self.last_completed.load(Ordering::Acquire)
    }

    /// Enqueues a signal of the next value on `queue` and returns that value.
    pub fn signal(&self, queue: &A::Queue) -> Result<FenceValue, DeviceError> {
        let value = self.next_value.fetch_add(1, Ordering::AcqRel);
        if let Err(error) = queue.signal(&self.raw, value) {
            // Give the value back unless another signal already took the next one.
            let _ = self.next_value.compare_exchange(
                value + 1,
                value,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return Err(error.into());
        }
        Ok(value)
    }

    /// Makes `queue` wait on the GPU until this fence reaches `value`.
    pub fn gpu_wait(&self, queue: &A::Queue, value: FenceValue) -> Result<(), DeviceError> {
        if value > self.last_signaled() {
            fatal!(
                "GPU wait on fence {} for value {value}, which was never signalled",
                self.label
            );
        }
        if value <= self.cached_completed() {
            return Ok(());
        }
        queue.wait(&self.raw, value)?;
        Ok(())
    }

    /// Reads the completed value from the driver and caches it.
    pub fn update_completed(&self) -> Result<FenceValue, DeviceError> {
        let value = self.raw.completed_value()?;
        let previous = self.last_completed.fetch_max(value, Ordering::AcqRel);
        Ok(value.max(previous))
    }

    /// True once the GPU has passed `value`. Never blocks.
    ///
    /// A lost device reports nothing as complete.
    pub fn is_complete(&self, value: FenceValue) -> bool {
        if value <= self.cached_completed() {
            return true;
        }
        match self.update_completed() {
            Ok(completed) => value <= completed,
            Err(err) => {
                log::warn!("Fence {} could not be read: {err}", self.label);
                false
            }
        }
    }

    /// Blocks until the GPU has passed `value`.
    ///
    /// Waits in slices, logging a warning for every slice that expires.
    /// Fails if the device is lost or the total timeout expires.
    pub fn wait_for_completion(&self, value: FenceValue) -> Result<(), DeviceError> {
        if self.is_complete(value) {
            return Ok(());
        }
        if value > self.last_signaled() {
            fatal!(
                "CPU wait on fence {} for value {value}, which was never signalled",
                self.label
            );
        }

        profiling::scope!("Fence::wait_for_completion");
        let start = Instant::now();
        loop {
            if self.raw.wait(value, self.wait.slice_ms)? {
                self.update_completed()?;
                return Ok(());
            }
            let waited_ms = start.elapsed().as_millis() as u64;
            log::warn!(
                "Waited {waited_ms} ms on fence {} for value {value} (completed: {})",
                self.label,
                self.update_completed()?
            );
            if waited_ms >= u64::from(self.wait.timeout_ms) {
                return Err(DeviceError::WaitTimeout {
                    fence: self.label.clone(),
                    value,
                    waited_ms,
                });
            }
        }
    }
}

impl<A: HalApi> fmt::Debug for Fence<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("label", &self.label)
            .field("last_signaled", &self.last_signaled())
            .field("cached_completed", &self.cached_completed())
            .finish()
    }
}

/// A point on a fence's timeline.
pub struct SyncPoint<A: HalApi> {
    fence: Arc<Fence<A>>,
    value: FenceValue,
}

impl<A: HalApi> SyncPoint<A> {
    pub fn new(fence: Arc<Fence<A>>, value: FenceValue) -> Self {
        Self { fence, value }
    }

    pub fn fence(&self) -> &Arc<Fence<A>> {
        &self.fence
    }

    pub fn value(&self) -> FenceValue {
        self.value
    }

    pub fn is_complete(&self) -> bool {
        self.fence.is_complete(self.value)
    }

    pub fn wait_for_completion(&self) -> Result<(), DeviceError> {
        self.fence.wait_for_completion(self.value)
    }

    /// Makes `queue` wait on the GPU for this sync point.
    pub fn gpu_wait(&self, queue: &A::Queue) -> Result<(), DeviceError> {
        self.fence.gpu_wait(queue, self.value)
    }
}

impl<A: HalApi> Clone for SyncPoint<A> {
    fn clone(&self) -> Self {
        Self {
            fence: Arc::clone(&self.fence),
            value: self.value,
        }
    }
}

impl<A: HalApi> fmt::Debug for SyncPoint<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncPoint({}: {})", self.fence.label, self.value)
    }
}

/// The sync point of a command list that has not been submitted yet.
///
/// Every clone observes the same resolution. Until resolved, it is never
/// complete.
pub struct PendingSyncPoint<A: HalApi> {
    inner: Arc<OnceCell<SyncPoint<A>>>,
}

impl<A: HalApi> PendingSyncPoint<A> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(OnceCell::new()),
        }
    }

    pub fn resolved(sync_point: SyncPoint<A>) -> Self {
        Self {
            inner: Arc::new(OnceCell::with_value(sync_point)),
        }
    }

    pub fn get(&self) -> Option<&SyncPoint<A>> {
        self.inner.get()
    }

    pub fn is_complete(&self) -> bool {
        self.get().map_or(false, SyncPoint::is_complete)
    }

    /// Resolves every clone of this pending sync point.
    pub(crate) fn resolve(&self, sync_point: SyncPoint<A>) {
        if let Err(sync_point) = self.inner.set(sync_point) {
            fatal!("Sync point resolved twice, second time to {sync_point:?}");
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<A: HalApi> Default for PendingSyncPoint<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: HalApi> Clone for PendingSyncPoint<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: HalApi> fmt::Debug for PendingSyncPoint<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(sync_point) => sync_point.fmt(f),
            None => f.write_str("SyncPoint(pending)"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hal::{
        api::Soft,
        soft::{self, ExecutionMode},
        Device as _,
    };

    fn setup(mode: ExecutionMode) -> (soft::Device, soft::Queue, Arc<Fence<Soft>>) {
        let device = soft::Device::new(mode);
        let queue = device.create_queue(hal::QueueType::Direct).unwrap();
        let fence = Fence::new(
            &device,
            "test",
            WaitSettings {
                slice_ms: 1,
                timeout_ms: 5,
            },
        )
        .unwrap();
        (device, queue, Arc::new(fence))
    }

    #[test]
    fn signal_returns_increasing_values() {
        let (_device, queue, fence) = setup(ExecutionMode::Immediate);
        assert_eq!(fence.last_signaled(), 0);
        assert_eq!(fence.signal(&queue).unwrap(), 1);
        assert_eq!(fence.signal(&queue).unwrap(), 2);
        assert_eq!(fence.last_signaled(), 2);
        assert!(fence.is_complete(2));
        assert_eq!(fence.cached_completed(), 2);
    }

    #[test]
    fn failed_signal_keeps_the_value() {
        let (device, queue, fence) = setup(ExecutionMode::Immediate);
        assert_eq!(fence.signal(&queue).unwrap(), 1);
        device.lose();
        assert_eq!(fence.signal(&queue), Err(DeviceError::Lost));
        assert_eq!(fence.last_signaled(), 1);
        assert!(fence.is_complete(1));
    }

    #[test]
    fn completion_is_cached() {
        let (device, queue, fence) = setup(ExecutionMode::Manual);
        let value = fence.signal(&queue).unwrap();
        assert!(!fence.is_complete(value));
        device.run_gpu();
        assert!(fence.is_complete(value));

        // Values at or below the cache never reach the driver, so a lost
        // device still reports them complete.
        device.lose();
        assert!(fence.is_complete(value));
        assert!(!fence.is_complete(value + 1));
    }

    #[test]
    fn wait_drives_pending_work() {
        let (_device, queue, fence) = setup(ExecutionMode::Manual);
        let sync_point = SyncPoint::new(Arc::clone(&fence), fence.signal(&queue).unwrap());
        assert!(!sync_point.is_complete());
        sync_point.wait_for_completion().unwrap();
        assert!(sync_point.is_complete());
    }

    #[test]
    fn wait_reports_lost_device() {
        let (device, queue, fence) = setup(ExecutionMode::Manual);
        let value = fence.signal(&queue).unwrap();
        device.lose();
        assert_eq!(fence.wait_for_completion(value), Err(DeviceError::Lost));
    }

    #[test]
    fn wait_times_out_behind_a_gpu_wait() {
        let (device, queue, fence) = setup(ExecutionMode::Immediate);
        let other = Fence::<Soft>::new(
            &device,
            "other",
            WaitSettings {
                slice_ms: 1,
                timeout_ms: 5,
            },
        )
        .unwrap();
        let other_queue = device.create_queue(hal::QueueType::Compute).unwrap();
        let blocker = other.signal(&other_queue).unwrap() + 1;
        other.next_value.store(blocker + 1, Ordering::Release);
        other.gpu_wait(&queue, blocker).unwrap();

        let value = fence.signal(&queue).unwrap();
        match fence.wait_for_completion(value) {
            Err(DeviceError::WaitTimeout { value: v, .. }) => assert_eq!(v, value),
            other => panic!("unexpected wait result {other:?}"),
        }
    }

    #[test]
    fn pending_sync_point_resolves_all_clones() {
        let (_device, queue, fence) = setup(ExecutionMode::Immediate);
        let pending = PendingSyncPoint::<Soft>::new();
        let clone = pending.clone();
        assert!(!clone.is_complete());
        pending.resolve(SyncPoint::new(Arc::clone(&fence), fence.signal(&queue).unwrap()));
        assert!(clone.is_complete());
        assert!(clone.ptr_eq(&pending));
        assert_eq!(clone.get().map(SyncPoint::value), Some(1));
    }

    #[test]
    #[should_panic]
    fn waiting_for_unsignalled_value_is_fatal() {
        let (_device, _queue, fence) = setup(ExecutionMode::Immediate);
        let _ = fence.wait_for_completion(3);
    }
}
