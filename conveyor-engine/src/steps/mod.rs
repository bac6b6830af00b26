//! Step implementations.
//!
//! Composites own boxed children and delegate the lifecycle to them; leaf
//! steps drive worker containers.

pub mod aggregate;
pub mod dependent_get;
pub mod ensure;
pub mod get;
pub mod on_failure;
pub mod on_success;
pub mod put;
pub mod task;
pub mod timeout;
pub mod try_step;

pub use aggregate::AggregateStep;
pub use dependent_get::DependentGetStep;
pub use ensure::EnsureStep;
pub use get::GetStep;
pub use on_failure::OnFailureStep;
pub use on_success::OnSuccessStep;
pub use put::PutStep;
pub use task::TaskStep;
pub use timeout::TimeoutStep;
pub use try_step::TryStep;

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    use crate::signals::{signalled, Ready, Signal, Signals};
    use crate::step::{Step, Success};

    #[derive(Default)]
    pub struct FakeStepState {
        pub run_count: usize,
        pub release_count: usize,
        pub received_signals: Vec<Signal>,
    }

    /// A scriptable step for exercising composites.
    pub struct FakeStep {
        state: Arc<Mutex<FakeStepState>>,
        succeeded: Option<bool>,
        error: Option<String>,
        wait_for_signal: bool,
        on_run: Option<Arc<dyn Fn() + Send + Sync>>,
    }

    impl FakeStep {
        pub fn succeeding() -> Self {
            Self::with_success(true)
        }

        pub fn failing() -> Self {
            Self::with_success(false)
        }

        pub fn with_success(succeeded: bool) -> Self {
            FakeStep {
                state: Arc::new(Mutex::new(FakeStepState::default())),
                succeeded: Some(succeeded),
                error: None,
                wait_for_signal: false,
                on_run: None,
            }
        }

        pub fn erroring(message: &str) -> Self {
            FakeStep {
                state: Arc::new(Mutex::new(FakeStepState::default())),
                succeeded: None,
                error: Some(message.to_string()),
                wait_for_signal: false,
                on_run: None,
            }
        }

        pub fn waits_for_signal(mut self) -> Self {
            self.wait_for_signal = true;
            self
        }

        pub fn on_run(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
            self.on_run = Some(Arc::new(hook));
            self
        }

        pub fn state(&self) -> Arc<Mutex<FakeStepState>> {
            self.state.clone()
        }
    }

    #[async_trait]
    impl Step for FakeStep {
        async fn run(&mut self, signals: &mut Signals, mut ready: Ready) -> anyhow::Result<()> {
            self.state.lock().unwrap().run_count += 1;
            ready.notify();

            if let Some(hook) = &self.on_run {
                hook();
            }

            if self.wait_for_signal {
                let signal = signalled(signals).await;
                self.state.lock().unwrap().received_signals.push(signal);
            }

            if let Some(message) = &self.error {
                anyhow::bail!("{message}");
            }
            Ok(())
        }

        fn succeeded(&self) -> Option<Success> {
            if self.state.lock().unwrap().run_count == 0 {
                return None;
            }
            self.succeeded.map(Success)
        }

        async fn release(&mut self) {
            self.state.lock().unwrap().release_count += 1;
        }
    }
}
