//! Scripted probes and counting actions for engine tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{ActionError, ProbeError};
use crate::resource::ResourceState;

use super::step::{Action, Probe};

/// Swap state shorthand.
pub fn swap(active: bool) -> ResourceState {
    ResourceState::SwapActive { active }
}

/// Returns scripted states in order, repeating the last one.
pub struct ScriptedProbe {
    failures: usize,
    delay: Option<Duration>,
    states: Mutex<Vec<ResourceState>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(states: Vec<ResourceState>) -> Arc<Self> {
        Self::failing_then(0, states)
    }

    /// Fails every observation.
    pub fn failing() -> Arc<Self> {
        Self::failing_then(usize::MAX, Vec::new())
    }

    /// Fails the first `failures` observations, then follows the script.
    pub fn failing_then(failures: usize, states: Vec<ResourceState>) -> Arc<Self> {
        Self::build(failures, None, states)
    }

    /// Sleeps before every observation.
    pub fn slow(delay: Duration, states: Vec<ResourceState>) -> Arc<Self> {
        Self::build(0, Some(delay), states)
    }

    fn build(failures: usize, delay: Option<Duration>, states: Vec<ResourceState>) -> Arc<Self> {
        let mut states = states;
        states.reverse();
        Arc::new(Self {
            failures,
            delay,
            states: Mutex::new(states),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn observe(&self) -> Result<ResourceState, ProbeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if call < self.failures {
            return Err(ProbeError::invalid_output("scripted", "scripted failure"));
        }
        let mut states = self.states.lock().unwrap();
        if states.len() > 1 {
            Ok(states.pop().unwrap())
        } else {
            states
                .last()
                .cloned()
                .ok_or_else(|| ProbeError::invalid_output("scripted", "empty script"))
        }
    }

    fn describe(&self) -> String {
        String::from("scripted probe")
    }
}

/// Counts invocations; succeeds, fails or stalls.
pub struct CountingAction {
    fail: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl CountingAction {
    pub fn ok() -> Arc<Self> {
        Self::build(false, None)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(true, None)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::build(false, Some(delay))
    }

    fn build(fail: bool, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            fail,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for CountingAction {
    async fn apply(&self, _desired: &ResourceState) -> Result<(), ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ActionError::generator("scripted failure"));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        String::from("counting action")
    }
}
