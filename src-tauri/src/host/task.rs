use std::future::Future;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Task was already consumed")]
    AlreadyConsumed,
}

/// A spawned task paired with the token that asks it to stop.
///
/// Dropping the task cancels the token and aborts the join handle.
pub struct CancellableTask<T> {
    handle: Option<JoinHandle<T>>,
    token: CancellationToken,
}

impl<T> CancellableTask<T> {
    pub fn new<F, Fut>(function: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = Some(tokio::spawn(function(token.clone())));
        Self { handle, token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn join(&mut self) -> Result<T, TaskError> {
        match self.handle.take() {
            Some(handle) => Ok(handle.await?),
            None => Err(TaskError::AlreadyConsumed),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T> Drop for CancellableTask<T> {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn completes_with_value() {
        let mut task = CancellableTask::new(|_token| async {
            sleep(Duration::from_millis(10)).await;
            42
        });

        assert_eq!(task.join().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn cancellation_reaches_the_task() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let mut task = CancellableTask::new(move |token| async move {
            tokio::select! {
                _ = sleep(Duration::from_secs(10)) => 1,
                _ = token.cancelled() => {
                    flag.store(true, Ordering::Relaxed);
                    0
                }
            }
        });

        task.cancel();
        task.cancel();

        let result = timeout(Duration::from_millis(100), task.join()).await;
        assert_eq!(result.unwrap().unwrap(), 0);
        assert!(cancelled.load(Ordering::Relaxed));
        assert!(task.is_cancelled());
    }

    #[tokio::test]
    async fn second_join_is_rejected() {
        let mut task = CancellableTask::new(|_token| async { 7 });
        assert_eq!(task.join().await.unwrap(), 7);
        assert!(matches!(task.join().await, Err(TaskError::AlreadyConsumed)));
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn panicking_task_reports_join_error() {
        let mut task = CancellableTask::new(|token| async move {
            assert!(token.is_cancelled(), "task panic");
        });
        assert!(matches!(task.join().await, Err(TaskError::Join(_))));
    }

    #[tokio::test]
    async fn drop_cancels_token() {
        let token_seen = Arc::new(parking_lot::Mutex::new(None));
        let slot = token_seen.clone();
        let task = CancellableTask::new(move |token| {
            *slot.lock() = Some(token.clone());
            async move { token.cancelled().await }
        });

        drop(task);

        let token = token_seen.lock().clone().unwrap();
        assert!(token.is_cancelled());
    }
}
