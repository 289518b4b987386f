// src/led.rs
//
// =============================================================================
// BBSYNCER: LED CONTROLLER
// =============================================================================
//
// The only feedback a pilot gets in the field is one blinking LED, so the
// patterns double as the UX. A dedicated worker thread plays the pattern
// for the current state; state changes preempt whatever is mid-blink
// within 50 ms.
//
// Backends:
//   sysfs: /sys/class/leds/led0 (Pi built-in ACT LED, no extra hardware)
//   gpio:  a pin driven through /sys/class/gpio (optional external LED)
//
// LED writes are best-effort: a missing sysfs node must never take down
// a sync.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const WAKE_SLICE: Duration = Duration::from_millis(50);

// ============================================================================
// 1. STATES & PATTERNS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    Off,
    Syncing,           // 100ms on / 100ms off (5 Hz)
    Verifying,         // 250ms on / 250ms off (2 Hz)
    Erasing,           // 800ms on / 200ms off
    Success,           // 3x rapid blink, 2s solid, off
    AlreadyEmpty,      // 2x slow blink, off
    ErrorGeneral,      // SOS repeating
    ErrorDisconnected, // triple rapid flash, repeating
}

/// (on_ms, off_ms) steps plus a repeat flag. Non-repeating patterns play
/// once and park until the next state change.
fn pattern(state: LedState) -> (&'static [(u64, u64)], bool) {
    match state {
        LedState::Off => (&[], false),
        LedState::Syncing => (&[(100, 100)], true),
        LedState::Verifying => (&[(250, 250)], true),
        LedState::Erasing => (&[(800, 200)], true),
        LedState::Success => (&[(50, 50), (50, 50), (50, 50), (2000, 1)], false),
        LedState::AlreadyEmpty => (&[(500, 500), (500, 500)], false),
        LedState::ErrorGeneral => (
            // SOS: 3x short, 3x long, 3x short, pause
            &[
                (150, 150),
                (150, 150),
                (150, 150),
                (400, 150),
                (400, 150),
                (400, 150),
                (150, 150),
                (150, 150),
                (150, 150),
                (700, 700),
            ],
            true,
        ),
        LedState::ErrorDisconnected => (&[(50, 50), (50, 50), (50, 50)], true),
    }
}

// ============================================================================
// 2. BACKENDS
// ============================================================================

pub trait LedBackend: Send {
    fn set(&mut self, on: bool);
    fn on_start(&mut self) {}
    fn on_stop(&mut self) {}
}

/// Pi built-in ACT LED via /sys/class/leds. The kernel trigger is parked
/// on start and handed back to mmc0 on stop.
pub struct SysfsLed {
    brightness: PathBuf,
    trigger: PathBuf,
}

impl SysfsLed {
    pub fn new() -> Self {
        let base = PathBuf::from("/sys/class/leds/led0");
        SysfsLed {
            brightness: base.join("brightness"),
            trigger: base.join("trigger"),
        }
    }
}

impl Default for SysfsLed {
    fn default() -> Self {
        Self::new()
    }
}

impl LedBackend for SysfsLed {
    fn set(&mut self, on: bool) {
        let _ = fs::write(&self.brightness, if on { "1" } else { "0" });
    }

    fn on_start(&mut self) {
        let _ = fs::write(&self.trigger, "none");
    }

    fn on_stop(&mut self) {
        let _ = fs::write(&self.trigger, "mmc0");
    }
}

/// External LED on a GPIO pin through the sysfs GPIO interface.
pub struct GpioLed {
    value: PathBuf,
}

impl GpioLed {
    pub fn new(pin: u32) -> Self {
        let base = PathBuf::from("/sys/class/gpio");
        let _ = fs::write(base.join("export"), pin.to_string());
        let pin_dir = base.join(format!("gpio{}", pin));
        let _ = fs::write(pin_dir.join("direction"), "out");
        log::debug!("GPIO LED initialized on pin {}", pin);
        GpioLed {
            value: pin_dir.join("value"),
        }
    }
}

impl LedBackend for GpioLed {
    fn set(&mut self, on: bool) {
        let _ = fs::write(&self.value, if on { "1" } else { "0" });
    }
}

/// Construct-time backend selection from config.
pub fn backend_from_config(backend: &str, gpio_pin: u32) -> Box<dyn LedBackend> {
    match backend {
        "gpio" => Box::new(GpioLed::new(gpio_pin)),
        "sysfs" => Box::new(SysfsLed::new()),
        other => {
            log::warn!("Unknown led_backend '{}', falling back to sysfs", other);
            Box::new(SysfsLed::new())
        }
    }
}

// ============================================================================
// 3. THE CONTROLLER
// ============================================================================

struct Shared {
    state: LedState,
    // Bumped on every state change; the worker compares generations to
    // notice preemption mid-sleep.
    generation: u64,
    running: bool,
    idle: bool,
}

pub struct LedController {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl LedController {
    /// Spawn the background worker on the given backend. The LED starts
    /// in `Off`.
    pub fn start(mut backend: Box<dyn LedBackend>) -> Self {
        let shared = Arc::new((
            Mutex::new(Shared {
                state: LedState::Off,
                generation: 0,
                running: true,
                idle: false,
            }),
            Condvar::new(),
        ));

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("led".to_string())
            .spawn(move || {
                backend.on_start();
                run_worker(&worker_shared, backend.as_mut());
                backend.set(false);
                backend.on_stop();
            })
            .expect("failed to spawn LED thread");

        log::debug!("LED controller started");
        LedController {
            shared,
            handle: Some(handle),
        }
    }

    pub fn set_state(&self, state: LedState) {
        let (lock, cvar) = &*self.shared;
        let mut shared = lock.lock().unwrap();
        if shared.state != state {
            log::info!("LED state -> {:?}", state);
            shared.state = state;
            shared.generation += 1;
            shared.idle = false;
            cvar.notify_all();
        }
    }

    /// Block until the current pattern completes (non-repeating patterns
    /// park as idle) or the timeout passes. Lets a final SUCCESS/ERROR
    /// pattern play out before process exit.
    pub fn wait_until_idle(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.shared;
        let mut shared = lock.lock().unwrap();
        while !shared.idle {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return;
            };
            let (guard, _) = cvar
                .wait_timeout(shared, remaining.min(WAKE_SLICE))
                .unwrap();
            shared = guard;
        }
    }

    /// Stop the worker and turn the LED off. The worker observes the flag
    /// within one wake slice.
    pub fn stop(&mut self) {
        {
            let (lock, cvar) = &*self.shared;
            let mut shared = lock.lock().unwrap();
            shared.running = false;
            cvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LedController {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// 4. THE WORKER LOOP
// ============================================================================

enum Step {
    Continue,
    Preempted,
    Shutdown,
}

fn run_worker(shared: &Arc<(Mutex<Shared>, Condvar)>, backend: &mut dyn LedBackend) {
    loop {
        let (state, generation) = {
            let (lock, _) = &**shared;
            let guard = lock.lock().unwrap();
            if !guard.running {
                return;
            }
            (guard.state, guard.generation)
        };
        match play_pattern(shared, backend, state, generation) {
            Step::Continue | Step::Preempted => {}
            Step::Shutdown => return,
        }
    }
}

fn play_pattern(
    shared: &Arc<(Mutex<Shared>, Condvar)>,
    backend: &mut dyn LedBackend,
    state: LedState,
    generation: u64,
) -> Step {
    let (steps, repeat) = pattern(state);

    if steps.is_empty() {
        backend.set(false);
        return park(shared, generation);
    }

    loop {
        for &(on_ms, off_ms) in steps {
            backend.set(true);
            match sleep_interruptible(shared, Duration::from_millis(on_ms), generation) {
                Step::Continue => {}
                other => {
                    backend.set(false);
                    return other;
                }
            }
            backend.set(false);
            if off_ms > 0 {
                match sleep_interruptible(shared, Duration::from_millis(off_ms), generation) {
                    Step::Continue => {}
                    other => return other,
                }
            }
        }
        if !repeat {
            return park(shared, generation);
        }
    }
}

/// Sleep in <=50 ms slices, aborting early when the state generation moves
/// or shutdown is requested.
fn sleep_interruptible(
    shared: &Arc<(Mutex<Shared>, Condvar)>,
    duration: Duration,
    generation: u64,
) -> Step {
    let deadline = Instant::now() + duration;
    let (lock, cvar) = &**shared;
    let mut guard = lock.lock().unwrap();
    loop {
        if !guard.running {
            return Step::Shutdown;
        }
        if guard.generation != generation {
            return Step::Preempted;
        }
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Step::Continue;
        };
        let (next, _) = cvar.wait_timeout(guard, remaining.min(WAKE_SLICE)).unwrap();
        guard = next;
    }
}

/// A non-repeating pattern finished: mark idle and wait for the next state
/// change. Completed patterns do not auto-revert to Off.
fn park(shared: &Arc<(Mutex<Shared>, Condvar)>, generation: u64) -> Step {
    let (lock, cvar) = &**shared;
    let mut guard = lock.lock().unwrap();
    guard.idle = true;
    cvar.notify_all();
    loop {
        if !guard.running {
            return Step::Shutdown;
        }
        if guard.generation != generation {
            return Step::Preempted;
        }
        let (next, _) = cvar.wait_timeout(guard, WAKE_SLICE).unwrap();
        guard = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct RecordingLed {
        tx: mpsc::Sender<bool>,
    }

    impl LedBackend for RecordingLed {
        fn set(&mut self, on: bool) {
            let _ = self.tx.send(on);
        }
    }

    #[test]
    fn success_pattern_parks_idle() {
        let (tx, rx) = mpsc::channel();
        let mut led = LedController::start(Box::new(RecordingLed { tx }));
        led.set_state(LedState::AlreadyEmpty);
        led.wait_until_idle(Duration::from_secs(10));
        led.stop();
        let writes: Vec<bool> = rx.try_iter().collect();
        // 2 blinks = at least 2 on-writes, and the LED ends dark.
        assert!(writes.iter().filter(|&&on| on).count() >= 2);
        assert_eq!(writes.last(), Some(&false));
    }

    #[test]
    fn state_change_preempts_pattern() {
        let (tx, rx) = mpsc::channel();
        let mut led = LedController::start(Box::new(RecordingLed { tx }));
        led.set_state(LedState::Erasing); // 800ms on-step
        std::thread::sleep(Duration::from_millis(120));
        let before = Instant::now();
        led.set_state(LedState::Off);
        led.wait_until_idle(Duration::from_secs(2));
        // Preemption must not wait out the 800ms step.
        assert!(before.elapsed() < Duration::from_millis(500));
        led.stop();
        drop(rx);
    }

    #[test]
    fn stop_terminates_quickly() {
        let (tx, _rx) = mpsc::channel();
        let mut led = LedController::start(Box::new(RecordingLed { tx }));
        led.set_state(LedState::ErrorGeneral); // repeating SOS
        std::thread::sleep(Duration::from_millis(60));
        let before = Instant::now();
        led.stop();
        assert!(before.elapsed() < Duration::from_secs(2));
    }
}
