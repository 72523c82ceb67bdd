//! Registration coordinator.
//!
//! `register` classifies every distinct input path, emits ineligible files as
//! failures straight away and hands the rest to a background batch: connect
//! the supervisor, start one registrar per chunk, merge their results first
//! ready first, then tear everything down. The caller pulls results from a
//! [`RegistrationStream`].

use crate::chunk::partition;
use crate::classify::Classifier;
use crate::error::CoordinatorError;
use crate::host::HelperHost;
use crate::link::SupervisorLink;
use crate::merge::{FanIn, Feed};
use crate::session::WorkerSession;
use comreg_core::settings::TimeoutSettings;
use comreg_core::{FileRecord, RegistrationResult};
use futures::Stream;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info, warn};

pub type RegistrationItem = Result<RegistrationResult, CoordinatorError>;

pub struct Coordinator {
    host: Arc<dyn HelperHost>,
    classifier: Arc<dyn Classifier>,
    timeouts: TimeoutSettings,
}

impl Coordinator {
    pub fn new(
        host: Arc<dyn HelperHost>,
        classifier: Arc<dyn Classifier>,
        timeouts: TimeoutSettings,
    ) -> Self {
        Self {
            host,
            classifier,
            timeouts,
        }
    }

    /// Starts registering `paths`. Must be called inside a tokio runtime.
    ///
    /// The stream yields one result per distinct path: ineligible files
    /// first, then eligible ones in completion order. A fatal error (such as
    /// declined elevation) is yielded once and ends the stream.
    pub fn register<I>(&self, paths: I, cancel: &CancellationToken) -> RegistrationStream
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let cancel = cancel.child_token();
        let mut seen = HashSet::new();
        let mut immediate = VecDeque::new();
        let mut eligible = Vec::new();

        for path in paths {
            if !seen.insert(path.clone()) {
                debug!(path = %path.display(), "skipping duplicate path");
                continue;
            }
            let record = self.classifier.classify(&path);
            match record.check_eligibility() {
                Ok(()) => eligible.push(record),
                Err(reason) => {
                    info!(path = %path.display(), %reason, "not eligible for registration");
                    immediate.push_back(RegistrationResult::failure(&path, reason.to_string()));
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = if eligible.is_empty() {
            None
        } else {
            info!(files = eligible.len(), "starting registration batch");
            let batch = Batch {
                host: self.host.clone(),
                timeouts: self.timeouts.clone(),
                cancel: cancel.clone(),
            };
            Some(tokio::spawn(batch.run(partition(eligible), tx)))
        };
        RegistrationStream::new(immediate, rx, driver, cancel)
    }
}

#[derive(Clone)]
struct Batch {
    host: Arc<dyn HelperHost>,
    timeouts: TimeoutSettings,
    cancel: CancellationToken,
}

impl Batch {
    async fn run(self, chunks: Vec<Vec<FileRecord>>, out: mpsc::UnboundedSender<RegistrationItem>) {
        let link = match SupervisorLink::connect(self.host.as_ref(), self.timeouts.clone(), &self.cancel)
            .await
        {
            Ok(link) => Arc::new(link),
            Err(CoordinatorError::Cancelled) => return,
            Err(e) => {
                let _ = out.send(Err(e));
                return;
            }
        };

        let mut merge = FanIn::new();
        for chunk in chunks {
            let batch = self.clone();
            let link = link.clone();
            merge.add(move |feed| batch.run_chunk(link, chunk, feed));
        }
        while let Some(item) = merge.next().await {
            let fatal = item.is_err();
            if let Err(e) = &item {
                warn!(error = %e, "registration batch failed");
            }
            // Queued ahead of the cancellation so the stream still sees it.
            let _ = out.send(item);
            if fatal {
                self.cancel.cancel();
            }
        }

        link.close().await;
        debug!("registration batch torn down");
    }

    /// Drives one registrar through its chunk. If the worker's channel
    /// breaks, every file it has not answered for is reported as failed.
    async fn run_chunk(
        self,
        link: Arc<SupervisorLink>,
        chunk: Vec<FileRecord>,
        feed: Feed<RegistrationItem>,
    ) {
        let mut session =
            match WorkerSession::start(&link, self.host.as_ref(), self.timeouts.clone(), &self.cancel)
                .await
            {
                Ok(session) => session,
                Err(CoordinatorError::Cancelled) => return,
                Err(e) => {
                    feed.push(Err(e));
                    return;
                }
            };

        let mut files = chunk.into_iter();
        while let Some(file) = files.next() {
            if self.cancel.is_cancelled() {
                break;
            }
            match session.register(&file, &self.cancel).await {
                Ok(result) => {
                    if !feed.push(Ok(result)) {
                        break;
                    }
                }
                Err(CoordinatorError::Cancelled) => break,
                Err(e) => {
                    warn!(pid = session.pid(), error = %e, "lost registrar worker");
                    let reason = format!("registrar worker failed: {e}");
                    for lost in std::iter::once(file).chain(files.by_ref()) {
                        feed.push(Ok(RegistrationResult::failure(&lost.path, reason.clone())));
                    }
                    break;
                }
            }
        }
        session.close().await;
    }
}

/// Results of one `register` call.
///
/// Dropping the stream cancels the batch; teardown then finishes in the
/// background. [`close`](Self::close) cancels and waits for teardown.
pub struct RegistrationStream {
    immediate: VecDeque<RegistrationResult>,
    rx: mpsc::UnboundedReceiver<RegistrationItem>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    driver: Option<JoinHandle<()>>,
    finished: bool,
}

impl RegistrationStream {
    fn new(
        immediate: VecDeque<RegistrationResult>,
        rx: mpsc::UnboundedReceiver<RegistrationItem>,
        driver: Option<JoinHandle<()>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            immediate,
            rx,
            cancelled: Box::pin(cancel.clone().cancelled_owned()),
            cancel,
            driver,
            finished: false,
        }
    }

    pub async fn next(&mut self) -> Option<RegistrationItem> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// After cancellation, pending results are dropped but a fatal error the
    /// batch queued before cancelling is still reported.
    fn take_fatal(&mut self) -> Option<CoordinatorError> {
        while let Ok(item) = self.rx.try_recv() {
            if let Err(e) = item {
                return Some(e);
            }
        }
        None
    }

    /// Stops the batch. No further results are yielded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels and waits until every helper has been torn down. Safe to call
    /// more than once.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.finished = true;
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                warn!(error = %e, "registration batch task failed");
            }
        }
    }
}

impl Stream for RegistrationStream {
    type Item = RegistrationItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if self.cancelled.as_mut().poll(cx).is_ready() {
            self.finished = true;
            return Poll::Ready(self.take_fatal().map(Err));
        }
        if let Some(result) = self.immediate.pop_front() {
            return Poll::Ready(Some(Ok(result)));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(ok)) => Poll::Ready(Some(ok)),
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RegistrationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
