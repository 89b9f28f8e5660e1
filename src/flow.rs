//! Flow control shared by the parser, the upload workers, and failure recovery:
//! a counting pause plus an in-flight tally that can be waited down to zero.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct GateState {
    paused: usize,
    in_flight: usize,
}

/// Nested pauses are counted; intake resumes only once every `PauseGuard` is dropped.
#[derive(Default)]
pub struct FlowGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl FlowGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block while paused.
    pub fn wait_open(&self) {
        let mut st = self.state.lock();
        while st.paused > 0 {
            self.changed.wait(&mut st);
        }
    }

    /// Block while paused, then register one in-flight chunk upload.
    /// Waiting and registering happen under one lock so a concurrent `drain` cannot miss it.
    pub fn acquire(&self) -> InFlightGuard<'_> {
        let mut st = self.state.lock();
        while st.paused > 0 {
            self.changed.wait(&mut st);
        }
        st.in_flight += 1;
        InFlightGuard { gate: self }
    }

    pub fn pause(&self) -> PauseGuard<'_> {
        self.state.lock().paused += 1;
        PauseGuard { gate: self }
    }

    /// Block until no chunk upload is in flight.
    pub fn drain(&self) {
        let mut st = self.state.lock();
        while st.in_flight > 0 {
            self.changed.wait(&mut st);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused > 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    fn release(&self) {
        let mut st = self.state.lock();
        st.in_flight -= 1;
        if st.in_flight == 0 {
            self.changed.notify_all();
        }
    }

    fn resume(&self) {
        let mut st = self.state.lock();
        st.paused -= 1;
        if st.paused == 0 {
            self.changed.notify_all();
        }
    }
}

/// Held for the duration of one chunk upload.
pub struct InFlightGuard<'a> {
    gate: &'a FlowGate,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// One outstanding pause request.
pub struct PauseGuard<'a> {
    gate: &'a FlowGate,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.gate.resume();
    }
}
