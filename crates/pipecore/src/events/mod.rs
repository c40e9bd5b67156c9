//! Node state-transition events.
//!
//! Subscribers register a callback filtered by step name and/or state and
//! are invoked synchronously, in subscription order, every time the
//! scheduler publishes a transition. The same events are also fanned out on
//! a broadcast channel for asynchronous consumers.

use crate::{NodeState, PipelineNode, RunId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;

pub type EventCallback = Arc<dyn Fn(&NodeEvent) + Send + Sync>;

/// A snapshot of one node taken at the moment it changed state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvent {
    pub run_id: RunId,
    /// Set when the run was started by a delegate node of another run
    pub parent_run_id: Option<RunId>,
    pub node: PipelineNode,
    pub timestamp: DateTime<Utc>,
}

impl NodeEvent {
    pub fn new(run_id: RunId, parent_run_id: Option<RunId>, node: PipelineNode) -> Self {
        Self {
            run_id,
            parent_run_id,
            node,
            timestamp: Utc::now(),
        }
    }

    pub fn state(&self) -> NodeState {
        self.node.state
    }
}

struct Listener {
    id: u64,
    step: Option<String>,
    state: Option<NodeState>,
    callback: EventCallback,
}

impl Listener {
    fn matches(&self, node: &PipelineNode) -> bool {
        self.step.as_deref().map_or(true, |step| step == node.name())
            && self.state.map_or(true, |state| state == node.state)
    }
}

struct ChannelInner {
    listeners: Mutex<Vec<Arc<Listener>>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<NodeEvent>,
}

impl ChannelInner {
    fn listeners(&self) -> MutexGuard<'_, Vec<Arc<Listener>>> {
        // callbacks never run under this lock, so a poisoned guard still holds a consistent list
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Publish/subscribe broadcaster of node state transitions
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(ChannelInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                sender,
            }),
        }
    }

    /// Register a callback.
    ///
    /// `step` matches the node name and `state` the node state; `None`
    /// matches everything. The returned handle removes the callback.
    pub fn subscribe<F>(&self, step: Option<&str>, state: Option<NodeState>, callback: F) -> Subscription
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, step = ?step, state = ?state, "Subscribing listener");
        self.inner.listeners().push(Arc::new(Listener {
            id,
            step: step.map(str::to_string),
            state,
            callback: Arc::new(callback),
        }));
        Subscription {
            id,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Receive every published event asynchronously
    pub fn stream(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.sender.subscribe()
    }

    /// Invoke every matching callback, then forward to stream receivers.
    ///
    /// Dispatch iterates a copy of the listener list taken before the first
    /// callback runs: callbacks may subscribe or unsubscribe freely, and such
    /// changes apply from the next publish on. A panicking callback unwinds
    /// into the caller.
    pub fn publish(&self, event: NodeEvent) {
        let matching: Vec<Arc<Listener>> = self
            .inner
            .listeners()
            .iter()
            .filter(|listener| listener.matches(&event.node))
            .cloned()
            .collect();

        for listener in matching {
            (listener.callback)(&event);
        }

        // no stream receivers is not an error
        let _ = self.inner.sender.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle returned by `EventChannel::subscribe`
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    /// Remove the callback. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.channel.upgrade() {
            tracing::debug!(id = self.id, "Unsubscribing listener");
            inner.listeners().retain(|listener| listener.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StepDef;
    use std::sync::atomic::AtomicUsize;

    fn event(name: &str, state: NodeState) -> NodeEvent {
        let mut node = PipelineNode::new(Arc::new(StepDef::new("w", name, name)));
        node.state = state;
        NodeEvent::new(RunId::new_v4(), None, node)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&NodeEvent) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &NodeEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn filters_by_step_and_state() {
        let channel = EventChannel::default();
        let (any, any_cb) = counter();
        let (done, done_cb) = counter();
        let (only_a, a_cb) = counter();
        channel.subscribe(None, None, any_cb);
        channel.subscribe(None, Some(NodeState::Done), done_cb);
        channel.subscribe(Some("a"), None, a_cb);

        channel.publish(event("a", NodeState::Exec));
        channel.publish(event("a", NodeState::Done));
        channel.publish(event("b", NodeState::Done));

        assert_eq!(any.load(Ordering::SeqCst), 3);
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(only_a.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispatches_in_subscription_order() {
        let channel = EventChannel::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            channel.subscribe(None, None, move |_| order.lock().unwrap().push(i));
        }
        channel.publish(event("a", NodeState::Done));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let channel = EventChannel::default();
        let (count, cb) = counter();
        let (other, other_cb) = counter();
        let sub = channel.subscribe(None, None, cb);
        channel.subscribe(None, None, other_cb);

        sub.unsubscribe();
        sub.unsubscribe();
        channel.publish(event("a", NodeState::Done));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(other.load(Ordering::SeqCst), 1);
        assert_eq!(channel.listener_count(), 1);
    }

    #[test]
    fn unsubscribe_from_inside_callback() {
        let channel = EventChannel::default();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let (later, later_cb) = counter();

        let s = slot.clone();
        let c = calls.clone();
        let sub = channel.subscribe(None, None, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = s.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);
        channel.subscribe(None, None, later_cb);

        channel.publish(event("a", NodeState::Exec));
        channel.publish(event("a", NodeState::Done));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(later.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stream_receives_published_events() {
        let channel = EventChannel::new(16);
        let mut rx = channel.stream();
        channel.publish(event("a", NodeState::Done));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.node.name(), "a");
        assert_eq!(received.state(), NodeState::Done);
    }
}
