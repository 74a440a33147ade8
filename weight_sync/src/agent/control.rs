use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LoopState {
    pause_requested: bool,
    paused: bool,
    running: bool,
    shutdown: bool,
}

/// The pause and shutdown handshake between callers and the background loop.
///
/// A pause is a request flag set by the caller plus an acknowledgement flag
/// set by the loop once it parked between passes.
#[derive(Debug, Default)]
pub(super) struct LoopControl {
    state: Mutex<LoopState>,
    cond: Condvar,
}

impl LoopControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the loop as running, must happen before it's spawned.
    pub fn begin(&self) {
        self.state.lock().running = true;
    }

    /// Waits out the pause between two passes, parking while a pause is requested.
    ///
    /// # Arguments
    /// * `interval` - How long to sleep when nothing is requested.
    ///
    /// # Returns
    /// Whether the loop should run another pass.
    pub fn checkpoint(&self, interval: Duration) -> bool {
        let mut state = self.state.lock();

        if !state.shutdown && !state.pause_requested {
            self.cond.wait_for(&mut state, interval);
        }

        if state.pause_requested && !state.shutdown {
            state.paused = true;
            self.cond.notify_all();

            while state.pause_requested && !state.shutdown {
                self.cond.wait(&mut state);
            }

            state.paused = false;
        }

        !state.shutdown
    }

    /// Requests a pause and blocks until the loop parked or isn't running.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        state.pause_requested = true;
        self.cond.notify_all();

        while !state.paused && state.running {
            self.cond.wait(&mut state);
        }
    }

    pub fn resume(&self) {
        self.state.lock().pause_requested = false;
        self.cond.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Asks the loop to exit at its next checkpoint.
    pub fn stop(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Marks the loop as gone, releasing anyone waiting on a pause.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.paused = false;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use super::*;

    const TICK: Duration = Duration::from_millis(1);

    fn spawn_loop(control: &Arc<LoopControl>, passes: &Arc<AtomicUsize>) -> thread::JoinHandle<()> {
        control.begin();
        let control = Arc::clone(control);
        let passes = Arc::clone(passes);

        thread::spawn(move || {
            while control.checkpoint(TICK) {
                passes.fetch_add(1, Ordering::SeqCst);
            }
            control.finish();
        })
    }

    #[test]
    fn pause_parks_the_loop_until_resumed() {
        let control = Arc::new(LoopControl::new());
        let passes = Arc::new(AtomicUsize::new(0));
        let handle = spawn_loop(&control, &passes);

        control.pause();
        assert!(control.is_paused());

        let frozen = passes.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(passes.load(Ordering::SeqCst), frozen);

        control.resume();
        while passes.load(Ordering::SeqCst) == frozen {
            thread::sleep(TICK);
        }

        control.stop();
        handle.join().unwrap();
    }

    #[test]
    fn stop_releases_a_paused_loop() {
        let control = Arc::new(LoopControl::new());
        let passes = Arc::new(AtomicUsize::new(0));
        let handle = spawn_loop(&control, &passes);

        control.pause();
        control.stop();
        handle.join().unwrap();

        assert!(!control.is_paused());
    }

    #[test]
    fn pause_without_a_loop_returns() {
        let control = LoopControl::new();
        control.pause();
        assert!(!control.is_paused());
        control.resume();
    }
}
