//! Coordinate refreshes of one domain registry.
//!
//! A [`ScanCoordinator`] owns the `Idle -> Scanning -> Idle` state machine of
//! a domain:
//!
//! * [`ScanCoordinator::request_scan`] starts a scan on a worker thread, or is
//!   coalesced with the scan already in flight.
//! * [`ScanCoordinator::trigger`] debounces bursts of notifications: only the
//!   last trigger of a burst starts a scan, once the quiet period elapsed.
//! * [`ScanCoordinator::restart_scan`] supersedes the scan in flight, whose
//!   result will be discarded.
//!
//! Workers never touch the registry. They send a [`ScanOutcome`] tagged with
//! the generation they were started for, and the control thread applies it with
//! [`ScanCoordinator::process_outcomes`] (or [`ScanCoordinator::wait_outcome`]).
//! An outcome whose generation is not the current one is stale and dropped.
//! A scanner that panics yields a failed outcome, so the coordinator always
//! goes back to `Idle`.
use crate::command::{CommandError, CommandResult, CommandRunner, ExternalCommand};
use crate::model::Domain;
use crate::registry::{DeviceRegistry, Keyed};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default quiet period of [`ScanCoordinator::trigger`].
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
/// Failure of a scan. The registry keeps its previous snapshot.
pub enum ScanError {
    #[allow(missing_docs)]
    #[error(transparent)]
    Command(#[from] CommandError),
    /// The tool ran but reported a failure.
    #[error("`{command}` failed: {detail}")]
    Failed {
        #[allow(missing_docs)]
        command: String,
        #[allow(missing_docs)]
        detail: String,
    },
}

/// Run `command` and turn a non-zero exit into a [`ScanError`].
pub fn run_checked(
    runner: &dyn CommandRunner,
    command: &ExternalCommand,
) -> Result<CommandResult, ScanError> {
    let res = runner.run(command)?;
    if res.success() {
        Ok(res)
    } else {
        Err(ScanError::Failed {
            command: command.to_string(),
            detail: res.failure_detail(),
        })
    }
}

/// Something able to list the current records of a domain.
///
/// Implementations block on external commands and are only ever called from
/// worker threads.
pub trait Scanner: Send + Sync + 'static {
    /// Record type stored in the registry.
    type Record: Keyed + Clone + Send + Sync + 'static;

    /// Domain scanned, used in logs and events.
    fn domain(&self) -> Domain;

    /// Perform a full scan.
    fn scan(&self) -> Result<Vec<Self::Record>, ScanError>;
}

/// Phase of the coordinator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    #[allow(missing_docs)]
    Idle,
    #[allow(missing_docs)]
    Scanning,
}

/// Answer to [`ScanCoordinator::request_scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRequest {
    /// A new scan was started with this generation.
    Started(u64),
    /// A scan of this generation is already in flight, nothing was started.
    Coalesced(u64),
}

/// Result of a worker, waiting to be applied on the control thread.
#[derive(Debug)]
pub struct ScanOutcome<R> {
    generation: u64,
    result: Result<Vec<R>, ScanError>,
}

/// What happened to an outcome once processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Registry replaced with `count` records.
    Updated {
        #[allow(missing_docs)]
        domain: Domain,
        #[allow(missing_docs)]
        generation: u64,
        #[allow(missing_docs)]
        count: usize,
    },
    /// Scan failed, registry untouched.
    Failed {
        #[allow(missing_docs)]
        domain: Domain,
        #[allow(missing_docs)]
        generation: u64,
        #[allow(missing_docs)]
        reason: String,
    },
    /// Result of a superseded scan, dropped.
    Discarded {
        #[allow(missing_docs)]
        domain: Domain,
        #[allow(missing_docs)]
        generation: u64,
    },
}

#[derive(Debug)]
struct State {
    phase: ScanPhase,
    generation: u64,
    /// When the pending trigger fires, pushed back by every new trigger.
    deadline: Option<Instant>,
    /// The debounce timer thread is alive.
    timer_running: bool,
}

struct Shared<S: Scanner> {
    scanner: Arc<S>,
    registry: Arc<DeviceRegistry<S::Record>>,
    debounce: Duration,
    state: Mutex<State>,
    timer: Condvar,
    outcomes_tx: Mutex<Sender<ScanOutcome<S::Record>>>,
    outcomes_rx: Mutex<Receiver<ScanOutcome<S::Record>>>,
    subscribers: Mutex<Vec<Sender<ScanEvent>>>,
}

/// Single-flight, debounced scanning of one domain. Cheap to clone.
pub struct ScanCoordinator<S: Scanner> {
    shared: Arc<Shared<S>>,
}

impl<S: Scanner> Clone for ScanCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking worker must not take the whole domain down with it.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

impl<S: Scanner> ScanCoordinator<S> {
    /// Create a coordinator feeding `registry` with the results of `scanner`.
    pub fn new(scanner: S, registry: Arc<DeviceRegistry<S::Record>>, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            shared: Arc::new(Shared {
                scanner: Arc::new(scanner),
                registry,
                debounce,
                state: Mutex::new(State {
                    phase: ScanPhase::Idle,
                    generation: 0,
                    deadline: None,
                    timer_running: false,
                }),
                timer: Condvar::new(),
                outcomes_tx: Mutex::new(tx),
                outcomes_rx: Mutex::new(rx),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registry fed by this coordinator.
    pub fn registry(&self) -> &Arc<DeviceRegistry<S::Record>> {
        &self.shared.registry
    }

    /// Scanned domain.
    pub fn domain(&self) -> Domain {
        self.shared.scanner.domain()
    }

    /// Current phase.
    pub fn phase(&self) -> ScanPhase {
        lock(&self.shared.state).phase
    }

    /// Generation of the latest started scan (0 before the first one).
    pub fn generation(&self) -> u64 {
        lock(&self.shared.state).generation
    }

    /// Receive a [`ScanEvent`] for every processed outcome.
    pub fn subscribe(&self) -> Receiver<ScanEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    /// Start a scan unless one is already running.
    pub fn request_scan(&self) -> ScanRequest {
        let mut state = lock(&self.shared.state);
        if state.phase == ScanPhase::Scanning {
            debug!("{} scan already running, request coalesced", self.domain());
            return ScanRequest::Coalesced(state.generation);
        }
        ScanRequest::Started(self.start(&mut state))
    }

    /// Start a new scan even if one is running; the running one becomes stale.
    ///
    /// Used when the domain state is known to have changed (after an action).
    pub fn restart_scan(&self) -> u64 {
        let mut state = lock(&self.shared.state);
        self.start(&mut state)
    }

    fn start(&self, state: &mut State) -> u64 {
        state.generation += 1;
        state.phase = ScanPhase::Scanning;
        let generation = state.generation;
        let scanner = Arc::clone(&self.shared.scanner);
        let tx = lock(&self.shared.outcomes_tx).clone();
        debug!("Starting {} scan #{}", scanner.domain(), generation);
        thread::spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| scanner.scan()))
                .unwrap_or_else(|payload| {
                    Err(ScanError::Failed {
                        command: format!("{} scan", scanner.domain()),
                        detail: format!("scanner panicked: {}", panic_message(&*payload)),
                    })
                });
            // The receiver lives as long as the coordinator.
            let _ = tx.send(ScanOutcome { generation, result });
        });
        generation
    }

    /// Ask for a scan once triggers stop arriving for the debounce period.
    ///
    /// A newer trigger cancels the pending one. The eventual scan goes
    /// through [`ScanCoordinator::request_scan`] and is coalesced if a scan
    /// is in flight.
    pub fn trigger(&self) {
        let mut state = lock(&self.shared.state);
        state.deadline = Some(Instant::now() + self.shared.debounce);
        if state.timer_running {
            debug!("{} trigger postponed", self.domain());
            return;
        }
        state.timer_running = true;
        drop(state);
        let this = self.clone();
        thread::spawn(move || this.run_timer());
    }

    /// Body of the single debounce timer thread, which exits once it fired.
    fn run_timer(&self) {
        let mut state = lock(&self.shared.state);
        loop {
            let now = Instant::now();
            let deadline = state.deadline;
            match deadline {
                Some(deadline) if deadline > now => {
                    state = self
                        .shared
                        .timer
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
                _ => break,
            }
        }
        state.deadline = None;
        state.timer_running = false;
        drop(state);
        self.request_scan();
    }

    /// Apply every outcome received so far. Call from the control thread.
    pub fn process_outcomes(&self) -> Vec<ScanEvent> {
        let mut outcomes = Vec::new();
        {
            let rx = lock(&self.shared.outcomes_rx);
            while let Ok(outcome) = rx.try_recv() {
                outcomes.push(outcome);
            }
        }
        outcomes.into_iter().map(|o| self.apply(o)).collect()
    }

    /// Block up to `timeout` for the next outcome and apply it.
    pub fn wait_outcome(&self, timeout: Duration) -> Option<ScanEvent> {
        let outcome = {
            let rx = lock(&self.shared.outcomes_rx);
            match rx.recv_timeout(timeout) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        };
        Some(self.apply(outcome))
    }

    /// Wait until the latest started scan is applied (or `timeout` elapses).
    ///
    /// Returns the event of the latest generation, if it arrived in time.
    pub fn wait_current(&self, timeout: Duration) -> Option<ScanEvent> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.wait_outcome(remaining)? {
                ScanEvent::Discarded { .. } => continue,
                event => return Some(event),
            }
        }
    }

    fn apply(&self, outcome: ScanOutcome<S::Record>) -> ScanEvent {
        let domain = self.domain();
        let ScanOutcome { generation, result } = outcome;
        let event = {
            let mut state = lock(&self.shared.state);
            if generation != state.generation {
                warn!(
                    "Discarding stale {} scan #{} (current is #{})",
                    domain, generation, state.generation
                );
                ScanEvent::Discarded { domain, generation }
            } else {
                state.phase = ScanPhase::Idle;
                match result {
                    Ok(records) => {
                        let count = records.len();
                        let registry = &self.shared.registry;
                        let selected = registry.get().selected_key().cloned();
                        registry.merge(records, selected.as_ref());
                        info!("{} scan #{} found {} entries", domain, generation, count);
                        ScanEvent::Updated {
                            domain,
                            generation,
                            count,
                        }
                    }
                    Err(e) => {
                        warn!("{} scan #{} failed: {}", domain, generation, e);
                        ScanEvent::Failed {
                            domain,
                            generation,
                            reason: e.to_string(),
                        }
                    }
                }
            }
        };
        lock(&self.shared.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Item(&'static str);

    impl Keyed for Item {
        type Key = &'static str;
        fn key(&self) -> &'static str {
            self.0
        }
    }

    /// Scanner answering each call from a script of (delay, result).
    struct FakeScanner {
        calls: Arc<AtomicUsize>,
        script: Vec<(Duration, Option<Vec<Item>>)>,
    }

    impl FakeScanner {
        fn new(script: Vec<(Duration, Option<Vec<Item>>)>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    calls: Arc::clone(&calls),
                    script,
                },
                calls,
            )
        }
    }

    impl Scanner for FakeScanner {
        type Record = Item;
        fn domain(&self) -> Domain {
            Domain::Wifi
        }
        fn scan(&self) -> Result<Vec<Item>, ScanError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, result) = self.script[n.min(self.script.len() - 1)].clone();
            thread::sleep(delay);
            result.ok_or(ScanError::Failed {
                command: "nmcli".into(),
                detail: "boom".into(),
            })
        }
    }

    /// Panics on its first call, then lists `Item("a")`.
    struct FlakyScanner {
        calls: AtomicUsize,
    }

    impl Scanner for FlakyScanner {
        type Record = Item;
        fn domain(&self) -> Domain {
            Domain::Bluetooth
        }
        fn scan(&self) -> Result<Vec<Item>, ScanError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("bluetoothctl vanished");
            }
            Ok(vec![Item("a")])
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    mod should {
        use super::*;
        use test_log::test;

        #[test]
        fn go_back_to_idle_and_fill_registry_after_scan() {
            let (scanner, _) = FakeScanner::new(vec![(Duration::ZERO, Some(vec![Item("a")]))]);
            let coord = ScanCoordinator::new(scanner, Arc::default(), DEFAULT_DEBOUNCE);
            assert_eq!(coord.request_scan(), ScanRequest::Started(1));
            assert_eq!(coord.phase(), ScanPhase::Scanning);
            let event = coord.wait_outcome(WAIT);
            assert_eq!(
                event,
                Some(ScanEvent::Updated {
                    domain: Domain::Wifi,
                    generation: 1,
                    count: 1
                })
            );
            assert_eq!(coord.phase(), ScanPhase::Idle);
            assert!(coord.registry().get().contains(&"a"));
        }

        #[test]
        fn coalesce_requests_while_scanning() {
            let (scanner, calls) =
                FakeScanner::new(vec![(Duration::from_millis(200), Some(vec![Item("a")]))]);
            let coord = ScanCoordinator::new(scanner, Arc::default(), DEFAULT_DEBOUNCE);
            assert_eq!(coord.request_scan(), ScanRequest::Started(1));
            assert_eq!(coord.request_scan(), ScanRequest::Coalesced(1));
            assert_eq!(coord.request_scan(), ScanRequest::Coalesced(1));
            coord.wait_outcome(WAIT);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn keep_previous_snapshot_when_scan_fails() {
            let (scanner, _) = FakeScanner::new(vec![
                (Duration::ZERO, Some(vec![Item("a"), Item("b")])),
                (Duration::ZERO, None),
            ]);
            let coord = ScanCoordinator::new(scanner, Arc::default(), DEFAULT_DEBOUNCE);
            coord.request_scan();
            coord.wait_outcome(WAIT);
            coord.registry().select(Some("b"));
            coord.request_scan();
            match coord.wait_outcome(WAIT) {
                Some(ScanEvent::Failed { generation, .. }) => assert_eq!(generation, 2),
                other => panic!("Expected failure, got {:?}", other),
            }
            let snap = coord.registry().get();
            assert_eq!(snap.len(), 2);
            assert_eq!(snap.selected_key(), Some(&"b"));
            assert_eq!(coord.phase(), ScanPhase::Idle);
        }

        #[test]
        fn issue_a_single_scan_for_a_burst_of_triggers() {
            let (scanner, calls) = FakeScanner::new(vec![(Duration::ZERO, Some(vec![Item("a")]))]);
            let coord =
                ScanCoordinator::new(scanner, Arc::default(), Duration::from_millis(100));
            coord.trigger();
            thread::sleep(Duration::from_millis(10));
            coord.trigger();
            coord.trigger();
            assert!(coord.wait_outcome(WAIT).is_some());
            // Leave time for a wrongly scheduled second scan to show up.
            thread::sleep(Duration::from_millis(300));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert!(coord.process_outcomes().is_empty());
        }

        #[test]
        fn keep_postponing_while_triggers_keep_coming() {
            let (scanner, calls) = FakeScanner::new(vec![(Duration::ZERO, Some(vec![Item("a")]))]);
            let coord =
                ScanCoordinator::new(scanner, Arc::default(), Duration::from_millis(150));
            for _ in 0..5 {
                coord.trigger();
                assert!(lock(&coord.shared.state).timer_running);
                thread::sleep(Duration::from_millis(50));
            }
            assert_eq!(calls.load(Ordering::SeqCst), 0);
            assert!(coord.wait_outcome(WAIT).is_some());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            let state = lock(&coord.shared.state);
            assert!(!state.timer_running);
            assert_eq!(state.deadline, None);
        }

        #[test]
        fn trigger_again_after_the_timer_fired() {
            let (scanner, calls) = FakeScanner::new(vec![(Duration::ZERO, Some(vec![Item("a")]))]);
            let coord =
                ScanCoordinator::new(scanner, Arc::default(), Duration::from_millis(20));
            coord.trigger();
            assert!(coord.wait_outcome(WAIT).is_some());
            coord.trigger();
            assert!(coord.wait_outcome(WAIT).is_some());
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }

        #[test]
        fn go_back_to_idle_when_the_scanner_panics() {
            let coord = ScanCoordinator::new(
                FlakyScanner {
                    calls: AtomicUsize::new(0),
                },
                Arc::default(),
                DEFAULT_DEBOUNCE,
            );
            assert_eq!(coord.request_scan(), ScanRequest::Started(1));
            match coord.wait_outcome(WAIT) {
                Some(ScanEvent::Failed { generation, reason, .. }) => {
                    assert_eq!(generation, 1);
                    assert!(reason.contains("bluetoothctl vanished"), "{}", reason);
                }
                other => panic!("Expected failure, got {:?}", other),
            }
            assert_eq!(coord.phase(), ScanPhase::Idle);
            assert_eq!(coord.request_scan(), ScanRequest::Started(2));
            assert!(matches!(
                coord.wait_outcome(WAIT),
                Some(ScanEvent::Updated { generation: 2, count: 1, .. })
            ));
        }

        #[test]
        fn discard_result_of_superseded_scan() {
            let (scanner, _) = FakeScanner::new(vec![
                (Duration::from_millis(300), Some(vec![Item("old")])),
                (Duration::ZERO, Some(vec![Item("new")])),
            ]);
            let coord = ScanCoordinator::new(scanner, Arc::default(), DEFAULT_DEBOUNCE);
            let events = coord.subscribe();
            assert_eq!(coord.request_scan(), ScanRequest::Started(1));
            thread::sleep(Duration::from_millis(20));
            assert_eq!(coord.restart_scan(), 2);

            let seen = [coord.wait_outcome(WAIT), coord.wait_outcome(WAIT)];
            assert!(seen.contains(&Some(ScanEvent::Discarded {
                domain: Domain::Wifi,
                generation: 1
            })));
            let snap = coord.registry().get();
            assert!(snap.contains(&"new"));
            assert!(!snap.contains(&"old"));
            assert_eq!(events.try_iter().count(), 2);
        }

        #[test]
        fn wait_current_skips_stale_outcomes() {
            let (scanner, _) = FakeScanner::new(vec![
                (Duration::ZERO, Some(vec![Item("old")])),
                (Duration::from_millis(100), Some(vec![Item("new")])),
            ]);
            let coord = ScanCoordinator::new(scanner, Arc::default(), DEFAULT_DEBOUNCE);
            coord.request_scan();
            thread::sleep(Duration::from_millis(50));
            coord.restart_scan();
            match coord.wait_current(WAIT) {
                Some(ScanEvent::Updated { generation, .. }) => assert_eq!(generation, 2),
                other => panic!("Unexpected {:?}", other),
            }
            assert!(coord.registry().get().contains(&"new"));
        }
    }
}
