//! Single-slot rendezvous gates bridging driver events to waiting callers.
//!
//! Each gate kind holds at most one armed oneshot sender. The operation that
//! will wait arms its gate strictly before issuing the driver request, so a
//! signal can never race ahead of the wait. Signaling an unarmed gate is a
//! no-op, and a wait that times out disarms its own slot so a late signal
//! from the driver is discarded.

use std::sync::Mutex;
use std::time::Duration;

use log::trace;
use tokio::sync::oneshot;

/// The asynchronous driver events a caller can block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Connecting,
    ScanAndConnect,
    ServiceDiscovery,
    CharacteristicDiscovery,
    SubscribeToggle,
}

const GATE_COUNT: usize = 5;

impl GateKind {
    fn index(self) -> usize {
        match self {
            GateKind::Connecting => 0,
            GateKind::ScanAndConnect => 1,
            GateKind::ServiceDiscovery => 2,
            GateKind::CharacteristicDiscovery => 3,
            GateKind::SubscribeToggle => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    sender: Option<oneshot::Sender<()>>,
}

/// One slot per gate kind.
///
/// The coordinator's phase machine guarantees at most one in-flight operation
/// per kind; the generation counter makes a stale waiter's disarm harmless if
/// that guarantee is ever violated.
#[derive(Default)]
pub struct Gates {
    slots: [Mutex<Slot>; GATE_COUNT],
}

impl Gates {
    /// Resets the gate for `kind` to the unsignaled state and hands the
    /// receiving side to the caller. A new arm replaces any previous one.
    pub fn arm(&self, kind: GateKind) -> Gate<'_> {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.slots[kind.index()].lock().unwrap();
        slot.generation += 1;
        slot.sender = Some(tx);
        trace!("gate {kind:?} armed (generation {})", slot.generation);
        Gate {
            gates: self,
            kind,
            generation: slot.generation,
            rx,
        }
    }

    /// Wakes the waiter on `kind`, if any. The signal is not retained.
    pub fn signal(&self, kind: GateKind) {
        let sender = self.slots[kind.index()].lock().unwrap().sender.take();
        match sender {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => trace!("signal on unarmed gate {kind:?} ignored"),
        }
    }

    fn disarm(&self, kind: GateKind, generation: u64) {
        let mut slot = self.slots[kind.index()].lock().unwrap();
        if slot.generation == generation {
            slot.sender = None;
        }
    }
}

/// An armed gate, consumed by waiting.
pub struct Gate<'a> {
    gates: &'a Gates,
    kind: GateKind,
    generation: u64,
    rx: oneshot::Receiver<()>,
}

impl Gate<'_> {
    /// Suspends the calling task until the gate is signaled or the deadline
    /// passes. On timeout the slot is disarmed, so a late signal is a no-op.
    pub async fn wait(self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(())) => WaitOutcome::Signaled,
            // The sender was replaced by a newer arm of the same kind.
            Ok(Err(_)) => WaitOutcome::TimedOut,
            Err(_) => {
                self.gates.disarm(self.kind, self.generation);
                WaitOutcome::TimedOut
            }
        }
    }

    /// Suspends without a deadline. Used only for the subscribe toggle,
    /// whose acknowledgement has no bound.
    pub async fn wait_unbounded(self) -> WaitOutcome {
        match self.rx.await {
            Ok(()) => WaitOutcome::Signaled,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}
