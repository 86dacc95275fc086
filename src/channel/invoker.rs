use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

/// Unit of work produced for each inbound message
pub type HandlerJob = BoxFuture<'static, ()>;

/// Concurrency discipline applied to message handlers
///
/// Jobs of one topic always run one after another in the order they were passed in.
#[async_trait]
pub trait MessageHandlerInvoker: Send + Sync {
    /// Runs the job received on `topic`. Returning from this call allows the adapter to deliver the next message.
    async fn execute(&self, topic: &str, job: HandlerJob);

    /// Rejects further jobs. Jobs that are already running complete.
    async fn shutdown(&self);
}

async fn run_guarded(job: HandlerJob) {
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        error!("Message handler panicked");
    }
}

/// Runs handlers on the delivering task, one message of a topic at a time
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectInvoker;

#[async_trait]
impl MessageHandlerInvoker for DirectInvoker {
    async fn execute(&self, _topic: &str, job: HandlerJob) {
        run_guarded(job).await;
    }

    async fn shutdown(&self) {}
}

type Lane = UnboundedSender<(HandlerJob, OwnedSemaphorePermit)>;

/// Runs handlers on a bounded pool shared by all topics
///
/// Each topic is drained by its own lane so that handlers of one topic observe
/// messages in arrival order while different topics proceed in parallel. Delivery
/// of further messages is held back while every worker is busy.
pub struct ThreadPoolInvoker {
    workers: Arc<Semaphore>,
    lanes: Mutex<HashMap<String, Lane>>,
}

impl ThreadPoolInvoker {
    /// Creates a pool executing at most `size` handlers concurrently
    pub fn new(size: usize) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(size.max(1))),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    fn open_lane(topic: &str) -> Lane {
        let (sender, mut receiver) = unbounded_channel::<(HandlerJob, OwnedSemaphorePermit)>();
        let topic = topic.to_owned();

        tokio::spawn(async move {
            while let Some((job, permit)) = receiver.recv().await {
                run_guarded(job).await;
                drop(permit);
            }

            debug!(topic = %topic, "Closed handler lane");
        });

        sender
    }
}

#[async_trait]
impl MessageHandlerInvoker for ThreadPoolInvoker {
    async fn execute(&self, topic: &str, job: HandlerJob) {
        let permit = match self.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(topic, "Invoker has been shut down, rejecting message handler");
                return;
            }
        };

        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let lane = lanes
            .entry(topic.to_owned())
            .or_insert_with(|| Self::open_lane(topic));

        if lane.send((job, permit)).is_err() {
            warn!(topic, "Handler lane is gone, rejecting message handler");
            lanes.remove(topic);
        }
    }

    async fn shutdown(&self) {
        debug!("Shutting down handler pool");
        self.workers.close();
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
