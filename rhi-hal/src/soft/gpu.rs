//! The simulated GPU timeline shared by every queue of a soft device.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{DeviceError, FenceValue};

/// When queued work runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Work completes as soon as nothing it depends on is outstanding.
    #[default]
    Immediate,
    /// Work only runs on [`Device::run_gpu`], [`Device::step_gpu`] or while
    /// the CPU blocks on a fence.
    ///
    /// [`Device::run_gpu`]: super::Device::run_gpu
    /// [`Device::step_gpu`]: super::Device::step_gpu
    Manual,
}

#[derive(Debug, Default)]
pub(super) struct FenceShared {
    pub(super) value: AtomicU64,
}

/// Operations a queue executes in order.
pub(super) enum QueueOp {
    /// Execution of a command list; holds the in-flight counter of the
    /// allocator it was recorded into.
    Execute(Arc<AtomicU32>),
    Signal(Arc<FenceShared>, FenceValue),
    Wait(Arc<FenceShared>, FenceValue),
}

impl QueueOp {
    fn is_runnable(&self) -> bool {
        match *self {
            Self::Wait(ref fence, value) => fence.value.load(Ordering::Acquire) >= value,
            Self::Execute(_) | Self::Signal(..) => true,
        }
    }

    fn run(self) {
        match self {
            Self::Execute(in_flight) => {
                in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            Self::Signal(fence, value) => {
                fence.value.fetch_max(value, Ordering::AcqRel);
            }
            Self::Wait(..) => {}
        }
    }
}

struct GpuState {
    queues: Vec<VecDeque<QueueOp>>,
    mode: ExecutionMode,
}

impl GpuState {
    /// Runs the first runnable operation found, in queue order.
    fn step(&mut self) -> bool {
        for queue in self.queues.iter_mut() {
            if queue.front().map_or(false, QueueOp::is_runnable) {
                if let Some(op) = queue.pop_front() {
                    op.run();
                    return true;
                }
            }
        }
        false
    }

    fn run(&mut self) -> usize {
        let mut executed = 0;
        while self.step() {
            executed += 1;
        }
        executed
    }
}

pub(super) struct Gpu {
    state: Mutex<GpuState>,
    progress: Condvar,
    lost: AtomicBool,
}

impl Gpu {
    pub(super) fn new(mode: ExecutionMode) -> Self {
        Self {
            state: Mutex::new(GpuState {
                queues: Vec::new(),
                mode,
            }),
            progress: Condvar::new(),
            lost: AtomicBool::new(false),
        }
    }

    pub(super) fn add_queue(&self) -> usize {
        let mut state = self.state.lock();
        state.queues.push(VecDeque::new());
        state.queues.len() - 1
    }

    pub(super) fn set_mode(&self, mode: ExecutionMode) {
        let mut state = self.state.lock();
        state.mode = mode;
        if mode == ExecutionMode::Immediate && state.run() != 0 {
            self.progress.notify_all();
        }
    }

    pub(super) fn check_lost(&self) -> Result<(), DeviceError> {
        if self.lost.load(Ordering::Acquire) {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }

    pub(super) fn lose(&self) {
        self.lost.store(true, Ordering::Release);
        let mut state = self.state.lock();
        state.queues.iter_mut().for_each(VecDeque::clear);
        self.progress.notify_all();
    }

    pub(super) fn enqueue(&self, queue: usize, ops: impl IntoIterator<Item = QueueOp>) {
        let mut state = self.state.lock();
        state.queues[queue].extend(ops);
        if state.mode == ExecutionMode::Immediate && state.run() != 0 {
            self.progress.notify_all();
        }
    }

    pub(super) fn run(&self) -> usize {
        let executed = self.state.lock().run();
        if executed != 0 {
            self.progress.notify_all();
        }
        executed
    }

    pub(super) fn step(&self) -> bool {
        let stepped = self.state.lock().step();
        if stepped {
            self.progress.notify_all();
        }
        stepped
    }

    pub(super) fn pending(&self) -> usize {
        self.state.lock().queues.iter().map(VecDeque::len).sum()
    }

    /// Blocks until `fence` reaches `value`, running queued work meanwhile.
    pub(super) fn wait(
        &self,
        fence: &FenceShared,
        value: FenceValue,
        timeout_ms: u32,
    ) -> Result<bool, DeviceError> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        let mut state = self.state.lock();
        loop {
            self.check_lost()?;
            if fence.value.load(Ordering::Acquire) >= value {
                return Ok(true);
            }
            if state.run() != 0 {
                self.progress.notify_all();
                continue;
            }
            if self.progress.wait_until(&mut state, deadline).timed_out() {
                self.check_lost()?;
                return Ok(fence.value.load(Ordering::Acquire) >= value);
            }
        }
    }
}

impl std::fmt::Debug for Gpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpu")
            .field(
                "pending",
                &self
                    .state
                    .try_lock()
                    .map(|state| state.queues.iter().map(VecDeque::len).sum::<usize>()),
            )
            .field("lost", &self.lost.load(Ordering::Relaxed))
            .finish()
    }
}
