//! Single-task consumer of a bounded channel.
//!
//! A `BackgroundWorker<R>` owns a [`BackgroundRunnable`] on its own tokio
//! task and feeds it the items sent through its channel, with a periodic
//! `on_tick` callback. Producers hold cloned senders; once every sender is
//! dropped the worker drains what is left, calls `shutdown` and hands the
//! runnable back from [`BackgroundWorker::finish`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// BackgroundRunnable
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once after the channel has closed and drained.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: mpsc::Sender<R::Task>,
    handle: JoinHandle<R>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker with a channel of `capacity` items.
    #[must_use]
    pub fn start(mut runnable: R, capacity: usize, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticker.tick() => runnable.on_tick().await,
                }
            }

            runnable.shutdown().await;
            runnable
        });

        Self { tx, handle }
    }

    /// A sender for producers. Clones keep the worker alive.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<R::Task> {
        self.tx.clone()
    }

    /// # Errors
    ///
    /// Fails when the worker task has exited.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        self.tx
            .send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker channel closed"))
    }

    /// Drops this handle's sender, waits for the remaining senders to go
    /// away and the queue to drain, and returns the runnable.
    ///
    /// # Errors
    ///
    /// Fails when the worker task panicked.
    pub async fn finish(self) -> anyhow::Result<R> {
        drop(self.tx);
        Ok(self.handle.await?)
    }
}
