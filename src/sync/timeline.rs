//! GPU timeline fence
//!
//! A monotonic u64 fence shared between the submission thread and wgpu's
//! completion callbacks. `signal` stamps the value for a submitted frame;
//! `Queue::on_submitted_work_done` drives `mark_completed`; the upload path
//! blocks in `wait_for` when the ring or the in-flight cap forces it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{EngineError, EngineResult};

#[derive(Default)]
struct TimelineState {
    /// Last value handed out at submit.
    signaled: u64,
    /// Highest value the GPU has retired.
    completed: u64,
}

/// Shared fence timeline. Clone-cheap; completion callbacks hold a clone.
#[derive(Clone, Default)]
pub struct GpuTimeline {
    inner: Arc<TimelineInner>,
}

#[derive(Default)]
struct TimelineInner {
    state: Mutex<TimelineState>,
    retired: Condvar,
}

impl GpuTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next fence value for a submission. Values start at 1 so
    /// `completed() == 0` means "nothing retired yet".
    pub fn signal(&self) -> u64 {
        let mut state = self.inner.state.lock();
        state.signaled += 1;
        state.signaled
    }

    /// Record GPU completion up to `value`. Out-of-order or duplicate
    /// callbacks only ever move the completed mark forward.
    pub fn mark_completed(&self, value: u64) {
        let mut state = self.inner.state.lock();
        if value > state.completed {
            state.completed = value;
            drop(state);
            self.inner.retired.notify_all();
        }
    }

    pub fn completed(&self) -> u64 {
        self.inner.state.lock().completed
    }

    pub fn signaled(&self) -> u64 {
        self.inner.state.lock().signaled
    }

    /// Block until the GPU has retired `value`. `None` waits forever, like a
    /// plain fence event; `Some(timeout)` bounds the wait and reports a hung
    /// GPU as `FenceTimeout` instead of deadlocking the submission thread.
    pub fn wait_for(&self, value: u64, timeout: Option<Duration>) -> EngineResult<()> {
        let start = Instant::now();
        let mut state = self.inner.state.lock();
        while state.completed < value {
            match timeout {
                None => self.inner.retired.wait(&mut state),
                Some(limit) => {
                    let waited = start.elapsed();
                    let remaining = match limit.checked_sub(waited) {
                        Some(r) if !r.is_zero() => r,
                        _ => {
                            return Err(EngineError::FenceTimeout { value, waited });
                        }
                    };
                    if self
                        .inner
                        .retired
                        .wait_for(&mut state, remaining)
                        .timed_out()
                        && state.completed < value
                    {
                        return Err(EngineError::FenceTimeout {
                            value,
                            waited: start.elapsed(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
