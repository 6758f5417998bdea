//! In-process publish/subscribe channel
//!
//! Publishing never runs a handler inline. Every handler invocation is posted
//! as a job onto a work queue that a dedicated dispatcher task drains, so a
//! slow or failing handler can neither block nor re-enter the publisher.
//! A handler that returns an error or panics is logged and skipped; the other
//! handlers of the same publish still run.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{DTraderError, DTraderResult};
use crate::event::{Event, Topic};

/// Event handler registered on a topic
pub type Handler = Arc<dyn Fn(&Event) -> DTraderResult<()> + Send + Sync>;

/// Identity of a registered handler, used to unsubscribe it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    handlers: RwLock<HashMap<Topic, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn is_registered(&self, topic: Topic, id: SubscriptionId) -> bool {
        self.handlers
            .read()
            .get(&topic)
            .map(|regs| regs.iter().any(|r| r.id == id))
            .unwrap_or(false)
    }
}

enum Job {
    Invoke {
        topic: Topic,
        id: SubscriptionId,
        handler: Handler,
        event: Arc<Event>,
    },
    Barrier(oneshot::Sender<()>),
}

/// Cloneable handle onto one event channel instance
#[derive(Clone)]
pub struct EventChannel {
    registry: Arc<Registry>,
    queue: mpsc::UnboundedSender<Job>,
}

impl EventChannel {
    /// Create a channel and spawn its dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::default());

        tokio::spawn(dispatch(Arc::clone(&registry), jobs));

        Self { registry, queue }
    }

    /// Register a handler for a topic
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> DTraderResult<()> + Send + Sync + 'static,
    {
        self.register(topic, Arc::new(handler))
    }

    /// Register one handler for several topics
    pub fn subscribe_many<F>(&self, topics: &[Topic], handler: F) -> Vec<(Topic, SubscriptionId)>
    where
        F: Fn(&Event) -> DTraderResult<()> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        topics
            .iter()
            .map(|topic| (*topic, self.register(*topic, Arc::clone(&handler))))
            .collect()
    }

    fn register(&self, topic: Topic, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .handlers
            .write()
            .entry(topic)
            .or_default()
            .push(Registration { id, handler });
        debug!(topic = %topic, "handler subscribed");
        id
    }

    /// Remove a previously registered handler. Jobs already queued for it are skipped.
    pub fn unsubscribe(&self, topic: Topic, id: SubscriptionId) -> bool {
        let mut handlers = self.registry.handlers.write();
        let Some(regs) = handlers.get_mut(&topic) else {
            return false;
        };

        let before = regs.len();
        regs.retain(|r| r.id != id);
        let removed = regs.len() != before;
        if regs.is_empty() {
            handlers.remove(&topic);
        }
        removed
    }

    /// Drop every handler of a topic
    pub fn clear(&self, topic: Topic) {
        self.registry.handlers.write().remove(&topic);
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.registry
            .handlers
            .read()
            .get(&topic)
            .map(|regs| regs.len())
            .unwrap_or(0)
    }

    /// Queue one invocation per handler of the event's topic and return.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let targets: Vec<(SubscriptionId, Handler)> = {
            let handlers = self.registry.handlers.read();
            match handlers.get(&topic) {
                Some(regs) => regs
                    .iter()
                    .map(|r| (r.id, Arc::clone(&r.handler)))
                    .collect(),
                None => return,
            }
        };

        let event = Arc::new(event);
        for (id, handler) in targets {
            let job = Job::Invoke {
                topic,
                id,
                handler,
                event: Arc::clone(&event),
            };
            if self.queue.send(job).is_err() {
                warn!(topic = %topic, "event dispatcher stopped, dropping event");
                return;
            }
        }
    }

    /// Wait until every job queued before this call has been dispatched.
    ///
    /// Events published by handlers while draining are queued behind the
    /// barrier and are not waited for.
    pub async fn settled(&self) {
        let (done, wait) = oneshot::channel();
        if self.queue.send(Job::Barrier(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.registry.handlers.read().len();
        f.debug_struct("EventChannel")
            .field("topics", &topics)
            .finish()
    }
}

async fn dispatch(registry: Arc<Registry>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Invoke {
                topic,
                id,
                handler,
                event,
            } => {
                if !registry.is_registered(topic, id) {
                    continue;
                }

                if let Err(e) = invoke(topic, &handler, &event) {
                    warn!(topic = %topic, error = %e, "event handler failed");
                }
            }
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Run one handler, reporting a panic as a handler error
fn invoke(topic: Topic, handler: &Handler, event: &Event) -> DTraderResult<()> {
    panic::catch_unwind(AssertUnwindSafe(|| handler(event))).unwrap_or_else(|payload| {
        Err(DTraderError::handler(topic.name(), panic_message(payload.as_ref())))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
