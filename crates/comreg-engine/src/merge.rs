//! First-ready fan-in of several concurrent sources.
//!
//! Each source runs as its own task and pushes items into one unbounded
//! queue; the consumer gets whichever item is ready first. A source's own
//! items keep their order, items from different sources interleave freely.
//! The merge ends once every source has finished.

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle a source uses to hand items to the merge.
pub struct Feed<T> {
    tx: mpsc::UnboundedSender<T>,
    remaining: Arc<AtomicUsize>,
}

impl<T> Feed<T> {
    /// Returns false once the consumer is gone.
    pub fn push(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> Drop for Feed<T> {
    fn drop(&mut self) {
        // Before `tx` drops, so the consumer never sees the end first.
        self.remaining.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FanIn<T> {
    tx: Option<mpsc::UnboundedSender<T>>,
    rx: mpsc::UnboundedReceiver<T>,
    remaining: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> FanIn<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx,
            remaining: Arc::new(AtomicUsize::new(0)),
            tasks: Vec::new(),
        }
    }

    /// Spawns `source` with its own [`Feed`].
    pub fn add<F, Fut>(&mut self, source: F)
    where
        F: FnOnce(Feed<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        self.remaining.fetch_add(1, Ordering::SeqCst);
        let feed = Feed {
            tx: tx.clone(),
            remaining: self.remaining.clone(),
        };
        self.tasks.push(tokio::spawn(source(feed)));
    }

    /// Spawns a task draining `stream` into the merge.
    pub fn add_stream<S>(&mut self, stream: S)
    where
        S: Stream<Item = T> + Send + 'static,
    {
        use futures::StreamExt;
        self.add(|feed| async move {
            futures::pin_mut!(stream);
            while let Some(item) = stream.next().await {
                if !feed.push(item) {
                    break;
                }
            }
        });
    }

    /// No more sources; the merge ends when the current ones finish.
    pub fn seal(&mut self) {
        self.tx = None;
    }

    /// Sources still running.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Next item from whichever source produced one first. `None` once the
    /// merge is sealed and every source is done.
    pub async fn next(&mut self) -> Option<T> {
        self.seal();
        self.rx.recv().await
    }
}

impl<T: Send + 'static> Default for FanIn<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Stream for FanIn<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.seal();
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for FanIn<T> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
