//! Slot-based admission of concurrent probe tasks

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Caps in-flight tasks within one cooperative execution context.
///
/// A completed task frees its slot immediately, so one slow task never
/// holds back unrelated fast ones. All tasks are polled from the stream
/// returned by [`ConcurrencyLimiter::run`], on whichever task polls it.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Tasks currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// Stop admitting tasks. Running tasks finish; queued ones are skipped.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Run `tasks`, yielding each output as soon as its task completes.
    ///
    /// Tasks are pulled lazily from the iterator, one per freed slot.
    /// Completion order is unspecified. Tasks are owned boxed futures, so
    /// the stream can be driven from a spawned task.
    pub fn run<I, T>(&self, tasks: I) -> impl Stream<Item = T>
    where
        I: IntoIterator<Item = BoxFuture<'static, T>>,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);

        stream::iter(tasks)
            .map(move |task: BoxFuture<'static, T>| -> BoxFuture<'static, Option<T>> {
                let permits = Arc::clone(&permits);
                async move {
                    // Acquire fails only once the limiter is closed.
                    let _permit = permits.acquire_owned().await.ok()?;
                    Some(task.await)
                }
                .boxed()
            })
            .buffer_unordered(self.max_in_flight)
            .filter_map(future::ready)
    }
}
