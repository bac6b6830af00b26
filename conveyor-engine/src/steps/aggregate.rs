//! Concurrent fan-out.

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::signals::{signalled, Ready, Signals};
use crate::step::{BoxStep, Step, Success};

/// Runs every child concurrently. Success is the conjunction of child
/// successes; a signal is forwarded to all children; all children settle
/// before the first error propagates, so none is left unreleased.
pub struct AggregateStep {
    children: Vec<BoxStep>,
}

impl AggregateStep {
    pub fn new(children: Vec<BoxStep>) -> Self {
        AggregateStep { children }
    }
}

#[async_trait]
impl Step for AggregateStep {
    async fn run(&mut self, signals: &mut Signals, mut ready: Ready) -> anyhow::Result<()> {
        ready.notify();

        let (forward_tx, forward_rx) = watch::channel(None);

        let mut handles = Vec::with_capacity(self.children.len());
        for mut child in self.children.drain(..) {
            let mut child_signals = forward_rx.clone();
            handles.push(tokio::spawn(async move {
                let result = child.run(&mut child_signals, Ready::inert()).await;
                (child, result)
            }));
        }

        let mut outer = signals.clone();
        let forwarder = tokio::spawn(async move {
            let signal = signalled(&mut outer).await;
            let _ = forward_tx.send(Some(signal));
        });

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok((child, result)) => {
                    self.children.push(child);
                    if let Err(err) = result {
                        first_error.get_or_insert(err);
                    }
                }
                Err(join_err) => {
                    first_error.get_or_insert(anyhow!("aggregate child panicked: {join_err}"));
                }
            }
        }

        forwarder.abort();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn succeeded(&self) -> Option<Success> {
        let all = self
            .children
            .iter()
            .all(|child| child.succeeded() == Some(Success(true)));
        Some(Success(all))
    }

    async fn release(&mut self) {
        for child in &mut self.children {
            child.release().await;
        }
    }
}
