//! The single-run gate.

use std::sync::{Arc, Mutex};

use crate::lock;

/// Records whether a test is executing. Owned by one orchestrator and shared
/// with its tasks; nothing else mutates it.
#[derive(Debug, Default)]
pub struct RunState {
    running: Mutex<bool>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare-and-set `false -> true`. Returns `false`, changing nothing, if
    /// a test is already running.
    pub fn try_set_running(&self) -> bool {
        let mut running = lock(&self.running);
        if *running {
            return false;
        }
        *running = true;
        true
    }

    pub fn clear_running(&self) {
        *lock(&self.running) = false;
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.running)
    }

    /// Take the gate, returning a guard that clears it when dropped.
    pub fn try_acquire(state: &Arc<Self>) -> Option<RunningGuard> {
        state.try_set_running().then(|| RunningGuard {
            state: Arc::clone(state),
        })
    }
}

/// Clears the run flag on drop, including when the owning task unwinds.
#[derive(Debug)]
pub struct RunningGuard {
    state: Arc<RunState>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.state.clear_running();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_and_set() {
        let state = RunState::new();
        assert!(!state.is_running());
        assert!(state.try_set_running());
        assert!(state.is_running());
        assert!(!state.try_set_running());
        state.clear_running();
        assert!(!state.is_running());
        assert!(state.try_set_running());
    }

    #[test]
    fn test_guard_clears_on_drop() {
        let state = Arc::new(RunState::new());
        let guard = RunState::try_acquire(&state).unwrap();
        assert!(state.is_running());
        assert!(RunState::try_acquire(&state).is_none());
        drop(guard);
        assert!(!state.is_running());
    }

    #[test]
    fn test_guard_clears_on_panic() {
        let state = Arc::new(RunState::new());
        let guard = RunState::try_acquire(&state).unwrap();
        let result = std::thread::spawn(move || {
            let _guard = guard;
            panic!("engine blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(!state.is_running());
    }

    #[test]
    fn test_only_one_thread_wins() {
        let state = Arc::new(RunState::new());
        let winners: usize = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || state.try_set_running())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
    }
}
