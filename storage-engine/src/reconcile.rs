// SPDX-License-Identifier: GPL-3.0-only

//! External event reconciliation
//!
//! Kernel add/remove/change notifications arrive on a queue consumed
//! by a single thread. Events the scheduler inflicted on itself are
//! absorbed through a suppression list keyed on device name and
//! action; anything else waits a short bounded interval for
//! self-correlation before being delivered as unsolicited. Delivery is
//! deferred while a commit is in flight: the consumer never runs
//! concurrently with `process()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Kind of kernel event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Add,
    Remove,
    Change,
}

/// One externally observed device event.
///
/// Correlation uses the name/sysfs-path heuristic, never engine ids:
/// externally-reported devices may not have one yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEvent {
    pub action: EventAction,
    pub name: String,
    pub sysfs_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    /// How long an unmatched event may wait for self-correlation
    pub correlation_wait: Duration,

    /// Poll step while waiting
    pub poll_step: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            correlation_wait: Duration::from_secs(1),
            poll_step: Duration::from_millis(50),
        }
    }
}

type Suppression = HashMap<(String, EventAction), u32>;

/// Handle for registering self-inflicted-event expectations.
///
/// The scheduler holds one of these and records, before each
/// execution, the kernel events its own action is about to generate.
#[derive(Debug, Clone, Default)]
pub struct ExpectationSink {
    suppression: Arc<Mutex<Suppression>>,
}

impl ExpectationSink {
    /// The next matching kernel event will be absorbed.
    pub fn expect(&self, name: &str, action: EventAction) {
        let mut suppression = self.suppression.lock().expect("suppression lock");
        *suppression
            .entry((name.to_string(), action))
            .or_insert(0) += 1;
    }
}

/// The single-consumer event queue.
pub struct EventQueue {
    tx: mpsc::Sender<ExternalEvent>,
    expectations: ExpectationSink,
    handle: Option<JoinHandle<()>>,
}

impl EventQueue {
    /// Spawn the consumer thread.
    ///
    /// `processing` is the engine's re-entrancy guard; while it is
    /// set, unsolicited delivery is deferred to a later cycle.
    /// `handler` receives only unsolicited events.
    pub fn spawn(
        processing: Arc<AtomicBool>,
        options: ReconcileOptions,
        handler: impl Fn(ExternalEvent) + Send + 'static,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<ExternalEvent>();
        let expectations = ExpectationSink::default();
        let consumer_suppression = Arc::clone(&expectations.suppression);

        let handle = std::thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                consume(
                    event,
                    &consumer_suppression,
                    &processing,
                    &options,
                    &handler,
                );
            }
        });

        Self {
            tx,
            expectations,
            handle: Some(handle),
        }
    }

    /// A sender for event producers (the sysfs watcher, tests).
    pub fn sender(&self) -> mpsc::Sender<ExternalEvent> {
        self.tx.clone()
    }

    /// The expectation handle the scheduler registers through.
    pub fn expectations(&self) -> ExpectationSink {
        self.expectations.clone()
    }

    /// Record that the scheduler is about to inflict an event on
    /// itself; the next matching kernel event is absorbed.
    pub fn expect(&self, name: &str, action: EventAction) {
        self.expectations.expect(name, action);
    }

    /// Drop the queue's own sender and wait for the consumer to drain.
    /// Cloned senders keep the consumer alive until they are dropped
    /// too.
    pub fn close(mut self) {
        drop(self.tx);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue").finish_non_exhaustive()
    }
}

fn consume(
    event: ExternalEvent,
    suppression: &Mutex<Suppression>,
    processing: &AtomicBool,
    options: &ReconcileOptions,
    handler: &impl Fn(ExternalEvent),
) {
    let deadline = Instant::now() + options.correlation_wait;
    loop {
        {
            let mut suppression = suppression.lock().expect("suppression lock");
            let key = (event.name.clone(), event.action);
            if let Some(count) = suppression.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    suppression.remove(&key);
                }
                tracing::debug!("absorbed self-inflicted event for {}", event.name);
                return;
            }
        }

        // Unsolicited once the correlation window closes, but never
        // delivered while a commit is in flight.
        if Instant::now() >= deadline && !processing.load(Ordering::SeqCst) {
            tracing::debug!("unsolicited {:?} event for {}", event.action, event.name);
            handler(event);
            return;
        }

        std::thread::sleep(options.poll_step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    fn fast_options() -> ReconcileOptions {
        ReconcileOptions {
            correlation_wait: Duration::from_millis(20),
            poll_step: Duration::from_millis(2),
        }
    }

    fn event(name: &str, action: EventAction) -> ExternalEvent {
        ExternalEvent {
            action,
            name: name.to_string(),
            sysfs_path: None,
        }
    }

    #[test]
    fn expected_events_are_absorbed() {
        let processing = Arc::new(AtomicBool::new(false));
        let (seen_tx, seen_rx) = channel();
        let queue = EventQueue::spawn(processing, fast_options(), move |e| {
            seen_tx.send(e).unwrap();
        });

        queue.expect("sda1", EventAction::Add);
        queue.sender().send(event("sda1", EventAction::Add)).unwrap();
        queue.close();

        assert!(seen_rx.try_recv().is_err());
    }

    #[test]
    fn unmatched_events_are_delivered_after_the_wait() {
        let processing = Arc::new(AtomicBool::new(false));
        let (seen_tx, seen_rx) = channel();
        let queue = EventQueue::spawn(processing, fast_options(), move |e| {
            seen_tx.send(e).unwrap();
        });

        queue.sender().send(event("sdb", EventAction::Remove)).unwrap();
        queue.close();

        let delivered = seen_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(delivered.name, "sdb");
        assert_eq!(delivered.action, EventAction::Remove);
    }

    #[test]
    fn delivery_defers_while_a_commit_is_in_flight() {
        let processing = Arc::new(AtomicBool::new(true));
        let (seen_tx, seen_rx) = channel();
        let queue = EventQueue::spawn(Arc::clone(&processing), fast_options(), move |e| {
            seen_tx.send(e).unwrap();
        });

        queue.sender().send(event("sdc", EventAction::Change)).unwrap();

        // Guard held: nothing may be delivered.
        std::thread::sleep(Duration::from_millis(60));
        assert!(seen_rx.try_recv().is_err());

        // Guard released: the deferred event arrives.
        processing.store(false, Ordering::SeqCst);
        let delivered = seen_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(delivered.name, "sdc");
        queue.close();
    }

    #[test]
    fn suppression_counts_absorb_exactly_that_many() {
        let processing = Arc::new(AtomicBool::new(false));
        let (seen_tx, seen_rx) = channel();
        let queue = EventQueue::spawn(processing, fast_options(), move |e| {
            seen_tx.send(e).unwrap();
        });

        queue.expect("sda1", EventAction::Change);
        queue.sender().send(event("sda1", EventAction::Change)).unwrap();
        queue.sender().send(event("sda1", EventAction::Change)).unwrap();
        queue.close();

        // First absorbed, second delivered.
        let delivered = seen_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(delivered.name, "sda1");
        assert!(seen_rx.try_recv().is_err());
    }
}
