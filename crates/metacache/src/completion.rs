use tokio::sync::mpsc;

type Delivery = Box<dyn FnOnce() + Send + 'static>;

/// The single delivery context shared by all components of the engine.
///
/// Every completion callback, no matter which component produced the result, is queued
/// here and run by one dedicated task. The relative order of deliveries is therefore the
/// order in which they were queued, not the order in which the underlying work was
/// submitted.
#[derive(Clone)]
pub struct CompletionQueue {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl CompletionQueue {
    /// Spawns the delivery task on the given runtime.
    pub fn new(runtime: &tokio::runtime::Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        runtime.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                delivery();
            }
            tracing::debug!("Completion queue terminated");
        });
        Self { tx }
    }

    /// Queues a callback for delivery on the completion context.
    ///
    /// Deliveries queued after the runtime shut down are dropped.
    pub fn dispatch(&self, delivery: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(delivery)).is_err() {
            tracing::debug!("Completion queue is gone, dropping delivery");
        }
    }
}
