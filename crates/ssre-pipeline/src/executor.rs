use async_trait::async_trait;
use futures::future::BoxFuture;

/// Runs detached background work. Callers never observe completion.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn submit(&self, task: BoxFuture<'static, ()>);
}

/// Spawns each task on the ambient tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioExecutor;

#[async_trait]
impl TaskExecutor for TokioExecutor {
    async fn submit(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

/// Drives each task to completion before `submit` returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

#[async_trait]
impl TaskExecutor for InlineExecutor {
    async fn submit(&self, task: BoxFuture<'static, ()>) {
        task.await;
    }
}
