//! Cooperative cancellation.
//!
//! Every step's `run` receives a signal receiver; composites forward
//! signals to their children through channels of their own. Signals only
//! ever request cancellation, they never force it: steps are expected to
//! notice an interrupt at their next suspension point.

use tokio::sync::{oneshot, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Kill,
}

pub type Signals = watch::Receiver<Option<Signal>>;

#[derive(Debug, Clone)]
pub struct SignalHandle {
    tx: watch::Sender<Option<Signal>>,
}

impl SignalHandle {
    pub fn send(&self, signal: Signal) {
        let _ = self.tx.send(Some(signal));
    }
}

pub fn signal_channel() -> (SignalHandle, Signals) {
    let (tx, rx) = watch::channel(None);
    (SignalHandle { tx }, rx)
}

/// Resolves once a signal has been delivered. If the sender is gone
/// without ever signalling, this never resolves.
pub async fn signalled(signals: &mut Signals) -> Signal {
    loop {
        if let Some(signal) = *signals.borrow_and_update() {
            return signal;
        }
        if signals.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Readiness notification, consumed at most once. Composite steps hand the
/// real notifier to their entry child and inert ones to the rest.
#[derive(Debug)]
pub struct Ready(Option<oneshot::Sender<()>>);

impl Ready {
    pub fn new() -> (Ready, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Ready(Some(tx)), rx)
    }

    pub fn inert() -> Ready {
        Ready(None)
    }

    pub fn notify(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signalled_resolves_on_send() {
        let (handle, mut signals) = signal_channel();

        let waiter = tokio::spawn(async move { signalled(&mut signals).await });
        handle.send(Signal::Interrupt);

        assert_eq!(waiter.await.unwrap(), Signal::Interrupt);
    }

    #[tokio::test]
    async fn ready_notifies_once() {
        let (mut ready, rx) = Ready::new();
        ready.notify();
        ready.notify();
        rx.await.unwrap();

        // inert notifiers are a no-op
        Ready::inert().notify();
    }
}
