//! Failure hook.

use async_trait::async_trait;

use crate::signals::{Ready, Signals};
use crate::step::{BoxStep, Step, Success};

/// Runs `step`, then `next` only when `step` failed. Overall success stays
/// `step`'s: the hook observes the failure, it does not repair it.
pub struct OnFailureStep {
    step: BoxStep,
    next: BoxStep,
}

impl OnFailureStep {
    pub fn new(step: BoxStep, next: BoxStep) -> Self {
        OnFailureStep { step, next }
    }
}

#[async_trait]
impl Step for OnFailureStep {
    async fn run(&mut self, signals: &mut Signals, ready: Ready) -> anyhow::Result<()> {
        self.step.run(signals, ready).await?;

        if self.step.succeeded() == Some(Success(false)) {
            self.next.run(signals, Ready::inert()).await?;
        }
        Ok(())
    }

    fn succeeded(&self) -> Option<Success> {
        self.step.succeeded()
    }

    async fn release(&mut self) {
        self.step.release().await;
        self.next.release().await;
    }
}
