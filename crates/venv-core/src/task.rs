//! Long-running operations on their own tokio task.
//!
//! A [`CancellableTask`] streams progress messages over an unbounded channel
//! to a single consumer and finishes with exactly one [`OpResult`].
//! Cancellation is cooperative: the operation sees it through
//! [`ProgressHandler::is_cancelled`], and whatever it returns after the flag
//! is set, the consumer receives the cancelled result.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::OpResult;
use crate::progress::{OpPhase, ProgressHandler};

/// What the consumer of a task receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Progress(String),
    /// Always the last event.
    Finished(OpResult),
}

/// Result of [`TaskHandle::cancel_and_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The operation returned within the grace period.
    Stopped,
    /// Still running; its result will be discarded.
    Unresponsive,
}

/// Progress handler that forwards rendered messages onto the task channel.
struct ChannelHandler {
    tx: mpsc::UnboundedSender<TaskEvent>,
    cancelled: Arc<AtomicBool>,
}

impl ProgressHandler for ChannelHandler {
    fn on_progress(&self, phase: OpPhase) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        // The consumer may have gone away; nothing to report to.
        let _ = self.tx.send(TaskEvent::Progress(phase.to_string()));
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handed to the operation running inside a task.
#[derive(Clone)]
pub struct TaskContext {
    handler: Arc<ChannelHandler>,
}

impl TaskContext {
    /// Handler to pass to registry and package operations.
    pub fn progress(&self) -> &dyn ProgressHandler {
        self.handler.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handler.is_cancelled()
    }

    /// Report a free-form message.
    pub fn report(&self, text: impl Into<String>) {
        self.handler
            .on_progress(OpPhase::Message { text: text.into() });
    }
}

pub struct CancellableTask;

impl CancellableTask {
    /// Run `op` on a new tokio task.
    pub fn spawn<F, Fut>(op: F) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = OpResult> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let ctx = TaskContext {
            handler: Arc::new(ChannelHandler {
                tx: tx.clone(),
                cancelled: cancelled.clone(),
            }),
        };

        let join = tokio::spawn(async move {
            let result = op(ctx).await;
            let _ = tx.send(TaskEvent::Finished(result));
        });

        TaskHandle {
            rx,
            cancelled,
            join,
            finished: false,
        }
    }
}

/// Consumer side of a running task.
pub struct TaskHandle {
    rx: mpsc::UnboundedReceiver<TaskEvent>,
    cancelled: Arc<AtomicBool>,
    join: JoinHandle<()>,
    finished: bool,
}

impl TaskHandle {
    /// Ask the operation to stop at its next decision point. The running
    /// subprocess, if any, is not interrupted.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            log::info!("[task] Cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the operation has returned (or panicked).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Next event, or `None` once [`TaskEvent::Finished`] was delivered.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Some(TaskEvent::Progress(_)) if self.is_cancelled() => continue,
                Some(TaskEvent::Progress(message)) => return Some(TaskEvent::Progress(message)),
                Some(TaskEvent::Finished(result)) => {
                    self.finished = true;
                    return Some(TaskEvent::Finished(self.settle(result)));
                }
                None => {
                    // Sender dropped without a result: the operation panicked.
                    self.finished = true;
                    return Some(TaskEvent::Finished(
                        self.settle(OpResult::fail("Operation ended unexpectedly")),
                    ));
                }
            }
        }
    }

    fn settle(&self, result: OpResult) -> OpResult {
        if self.is_cancelled() {
            OpResult::cancelled()
        } else {
            result
        }
    }

    /// Deliver every progress message to `on_progress` and return the
    /// final result.
    pub async fn drive<F>(mut self, mut on_progress: F) -> OpResult
    where
        F: FnMut(&str),
    {
        while let Some(event) = self.next_event().await {
            match event {
                TaskEvent::Progress(message) => on_progress(&message),
                TaskEvent::Finished(result) => return result,
            }
        }
        // next_event always yields Finished before None.
        OpResult::fail("Operation ended unexpectedly")
    }

    /// Final result, discarding progress.
    pub async fn wait(self) -> OpResult {
        self.drive(|_| {}).await
    }

    /// Cancel, then wait up to `grace` for the operation to return.
    pub async fn cancel_and_wait(&mut self, grace: Duration) -> CancelOutcome {
        self.cancel();
        if self.join.is_finished() {
            return CancelOutcome::Stopped;
        }
        match tokio::time::timeout(grace, &mut self.join).await {
            Ok(_) => CancelOutcome::Stopped,
            Err(_) => {
                log::warn!(
                    "[task] Operation still running {}s after cancellation",
                    grace.as_secs()
                );
                CancelOutcome::Unresponsive
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CANCELLED_MESSAGE;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_progress_then_result_in_order() {
        let handle = CancellableTask::spawn(|ctx| async move {
            ctx.report("one");
            ctx.progress().on_progress(OpPhase::UpgradingInstaller);
            OpResult::ok("done")
        });

        let mut messages = Vec::new();
        let result = handle.drive(|m| messages.push(m.to_string())).await;
        assert_eq!(messages, vec!["one".to_string(), "Upgrading pip...".to_string()]);
        assert_eq!(result, OpResult::ok("done"));
    }

    #[tokio::test]
    async fn test_cancel_overrides_successful_result() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let mut handle = CancellableTask::spawn(|ctx| async move {
            let _ = release_rx.await;
            // Progress after cancellation never reaches the consumer.
            ctx.report("late");
            OpResult::ok("finished anyway")
        });

        handle.cancel();
        let _ = release_tx.send(());

        let event = handle.next_event().await;
        assert_eq!(event, Some(TaskEvent::Finished(OpResult::cancelled())));
        assert_eq!(handle.next_event().await, None);
    }

    #[tokio::test]
    async fn test_cancel_after_operation_returned() {
        let handle = CancellableTask::spawn(|_ctx| async move { OpResult::ok("done") });
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }

        handle.cancel();
        let result = handle.wait().await;
        assert_eq!(result, OpResult::cancelled());
    }

    #[tokio::test]
    async fn test_operation_observes_cancellation() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let mut handle = CancellableTask::spawn(|ctx| async move {
            let _ = release_rx.await;
            if ctx.is_cancelled() {
                OpResult::fail("stopped early")
            } else {
                OpResult::ok("ran")
            }
        });

        handle.cancel();
        let _ = release_tx.send(());
        assert_eq!(
            handle.cancel_and_wait(Duration::from_secs(5)).await,
            CancelOutcome::Stopped
        );
        let result = handle.wait().await;
        assert!(result.cancelled);
        assert_eq!(result.message, CANCELLED_MESSAGE);
    }

    #[tokio::test]
    async fn test_unresponsive_after_grace() {
        let mut handle = CancellableTask::spawn(|_ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            OpResult::ok("slow")
        });
        let outcome = handle.cancel_and_wait(Duration::from_millis(50)).await;
        assert_eq!(outcome, CancelOutcome::Unresponsive);
        assert!(!handle.is_finished());
    }

    #[tokio::test]
    async fn test_panicking_operation_reports_failure() {
        let handle = CancellableTask::spawn(|_ctx| async move {
            if true {
                panic!("boom");
            }
            OpResult::ok("unreachable")
        });
        let result = handle.wait().await;
        assert!(!result.success);
        assert!(!result.cancelled);
    }
}
