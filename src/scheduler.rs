//! A fixed-delay poller that runs at most one task at a time.
//!
//! Each tick asks a [`TaskSource`] for the next due record and, if there is
//! one, runs the unit of work built by a [`TaskFactory`] to completion before
//! the delay starts again. Failures and panics are logged per tick; only
//! [`PollerHandle::stop`] ends the loop.
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub type TaskFuture = BoxFuture<'static, Result<()>>;

#[async_trait]
pub trait TaskSource<R>: Send + Sync {
    /// The oldest unclaimed due record, if any.
    async fn next_task(&self) -> Result<Option<R>>;
}

pub trait TaskFactory<R>: Send + Sync {
    fn create(&self, record: R) -> Result<TaskFuture>;
}

pub struct SerialPoller<R> {
    name: &'static str,
    source: Arc<dyn TaskSource<R>>,
    factory: Arc<dyn TaskFactory<R>>,
    delay: Duration,
}

impl<R: Send + 'static> SerialPoller<R> {
    pub fn new(
        name: &'static str,
        source: Arc<dyn TaskSource<R>>,
        factory: Arc<dyn TaskFactory<R>>,
        delay: Duration,
    ) -> Self {
        Self {
            name,
            source,
            factory,
            delay,
        }
    }

    /// One poll. Returns true when a task was dispatched.
    pub async fn tick(&self) -> bool {
        let record = match self.source.next_task().await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(err) => {
                error!(poller = self.name, ?err, "failed to select next task");
                return false;
            }
        };
        let task = match self.factory.create(record) {
            Ok(task) => task,
            Err(err) => {
                error!(poller = self.name, ?err, "failed to create task");
                return true;
            }
        };
        match AssertUnwindSafe(task).catch_unwind().await {
            Ok(Ok(())) => debug!(poller = self.name, "task finished"),
            Ok(Err(err)) => error!(poller = self.name, ?err, "task failed"),
            Err(_) => error!(poller = self.name, "task panicked"),
        }
        true
    }

    /// Polls immediately, then again `delay` after each tick returns.
    pub fn start(self) -> PollerHandle {
        let (shutdown, mut signal) = watch::channel(false);
        let name = self.name;
        let join = tokio::spawn(async move {
            info!(poller = name, delay_ms = self.delay.as_millis() as u64, "poller started");
            loop {
                let stopping = *signal.borrow();
                if stopping {
                    break;
                }
                self.tick().await;
                tokio::select! {
                    biased;
                    changed = signal.changed() => {
                        // Handle dropped: treat as stop.
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
            info!(poller = name, "poller stopped");
        });
        PollerHandle {
            name,
            shutdown,
            join,
        }
    }
}

pub struct PollerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// No new tick starts after this; an in-flight tick runs to completion.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(poller = self.name, ?err, "poller loop ended abnormally");
        }
    }
}
