use std::future::Future;

use async_trait::async_trait;

/// Work invoked by the scheduler on each poll.
///
/// Errors are logged and counted; they never stop the timer.
#[async_trait]
pub trait PollJob: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

/// Adapts an async closure into a poll job
pub struct FnJob<F> {
    f: F,
}

impl<F, Fut> FnJob<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> PollJob for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self) -> anyhow::Result<()> {
        (self.f)().await
    }
}
