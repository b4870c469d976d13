//! Node registry and driver: the in-process topic map, the peer
//! reconciliation algorithm, and the facade the (out-of-scope) XML-RPC
//! slave API would drive.

use crate::publisher::{Publication, PublicationEntry, DEFAULT_QUEUE_SIZE};
use crate::stream::{force_deferred, Deferred, MessageStream};
use crate::subscriber::{new_subscription, SubscriptionEntry};
use crate::stats::TopicSnapshot;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tcpros_common::{validate_topic_name, RosMessage};
use tokio::sync::{mpsc, Notify};

pub use tcpros_common::{Error as NodeError, Result as NodeResult};

/// The bound on every subscription's input buffer, per spec.md §3.
pub const SUBSCRIPTION_QUEUE_SIZE: usize = 10;

struct NodeState {
    name: String,
    master_uri: std::sync::Mutex<String>,
    bind_addr: IpAddr,
    subscriptions: DashMap<String, Arc<dyn SubscriptionEntry>>,
    publications: DashMap<String, Arc<dyn PublicationEntry>>,
    shutdown_notify: Notify,
}

/// A cheaply-`Clone` handle onto a node's registry. This is the whole of
/// the user-facing and RPC-facing API surface described in spec.md §4.F:
/// the type-parametric `advertise`/`subscribe` calls for user code, and
/// the snapshot/update operations an external XML-RPC slave-API
/// implementation would drive.
#[derive(Clone)]
pub struct NodeHandle(Arc<NodeState>);

impl NodeHandle {
    /// Builds a standalone node registry, not yet driven by [`run_node`]
    /// or any RPC layer. Exposed directly (rather than only through
    /// `run_node`) so tests, and any custom driver loop, can construct
    /// one without also taking on `run_node`'s blocking-until-shutdown
    /// behavior.
    pub fn new(name: impl Into<String>, master_uri: impl Into<String>) -> Self {
        Self(Arc::new(NodeState {
            name: name.into(),
            master_uri: std::sync::Mutex::new(master_uri.into()),
            bind_addr: Ipv4Addr::UNSPECIFIED.into(),
            subscriptions: DashMap::new(),
            publications: DashMap::new(),
            shutdown_notify: Notify::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Advertises `topic`, starting the publisher transport immediately
    /// and consuming `stream`. Fails if `topic` is already advertised.
    pub async fn advertise<T: RosMessage>(
        &self,
        topic: &str,
        stream: MessageStream<T>,
        queue_size: usize,
    ) -> NodeResult<u16> {
        validate_topic_name(topic)?;
        if self.0.publications.contains_key(topic) {
            return Err(NodeError::DuplicateTopic(topic.to_owned(), "advertised"));
        }

        let publication =
            Publication::<T>::start(&self.0.name, topic, stream, self.0.bind_addr, queue_size)
                .await?;
        let port = publication.port();

        // The `contains_key` probe above only rules out the common case:
        // two concurrent `advertise` calls for the same topic can both
        // pass it and both reach here with a live publication already
        // bound and running. `entry` makes the actual registration
        // atomic: whichever call's publication loses the race is shut
        // down explicitly instead of being silently dropped from the map
        // with its accept/pump/writer tasks still running and now
        // unreachable.
        match self.0.publications.entry(topic.to_owned()) {
            Entry::Occupied(_) => {
                publication.shutdown().await;
                return Err(NodeError::DuplicateTopic(topic.to_owned(), "advertised"));
            }
            Entry::Vacant(slot) => {
                slot.insert(publication);
            }
        }
        info!("advertised {topic} on port {port}");
        Ok(port)
    }

    /// Lifts a stream of [`Deferred`] values, then advertises it.
    pub async fn advertise_deferred<T: RosMessage>(
        &self,
        topic: &str,
        stream: MessageStream<Deferred<T>>,
        queue_size: usize,
    ) -> NodeResult<u16> {
        self.advertise(topic, force_deferred(stream), queue_size)
            .await
    }

    /// Subscribes to `topic`, returning the stream of decoded messages.
    /// Fails if `topic` is already subscribed.
    pub fn subscribe<T: RosMessage>(
        &self,
        topic: &str,
        queue_size: usize,
    ) -> NodeResult<MessageStream<T>> {
        validate_topic_name(topic)?;
        if self.0.subscriptions.contains_key(topic) {
            return Err(NodeError::DuplicateTopic(topic.to_owned(), "subscribed"));
        }

        let (sender, receiver) = mpsc::channel::<T>(queue_size);
        let subscription = new_subscription::<T>(&self.0.name, topic, sender);
        // Same atomic check-and-insert as `advertise`: two concurrent
        // `subscribe` calls for the same topic can both pass the
        // `contains_key` probe above, and only one of them may end up
        // owning the registry's entry.
        match self.0.subscriptions.entry(topic.to_owned()) {
            Entry::Occupied(_) => {
                return Err(NodeError::DuplicateTopic(topic.to_owned(), "subscribed"));
            }
            Entry::Vacant(slot) => {
                slot.insert(subscription);
            }
        }
        info!("subscribed to {topic}");
        Ok(crate::stream::stream_from_receiver(receiver))
    }

    /// Snapshot of every live subscription, for the RPC facade.
    pub async fn snapshot_subscriptions(&self) -> Vec<TopicSnapshot> {
        let mut out = Vec::with_capacity(self.0.subscriptions.len());
        for entry in self.0.subscriptions.iter() {
            out.push(entry.value().snapshot().await);
        }
        out
    }

    /// Snapshot of every live publication, for the RPC facade.
    pub async fn snapshot_publications(&self) -> Vec<TopicSnapshot> {
        let mut out = Vec::with_capacity(self.0.publications.len());
        for entry in self.0.publications.iter() {
            out.push(entry.value().snapshot().await);
        }
        out
    }

    pub fn master_uri(&self) -> String {
        self.0.master_uri.lock().unwrap().clone()
    }

    pub fn set_master_uri(&self, uri: impl Into<String>) {
        *self.0.master_uri.lock().unwrap() = uri.into();
    }

    /// The peer reconciliation algorithm of spec.md §4.F: looks up the
    /// subscription for `topic`; if absent, ignores the update (the
    /// master may announce topics this node no longer cares about
    /// during a race, and that is not an error).
    pub async fn publisher_update(&self, topic: &str, uris: Vec<String>) {
        let Some(subscription) = self.0.subscriptions.get(topic).map(|e| e.value().clone())
        else {
            debug!("publisher_update for unknown topic {topic}, ignoring");
            return;
        };
        subscription.publisher_update(uris).await;
    }

    /// The listening port of an advertised topic, if any.
    pub fn topic_port(&self, topic: &str) -> Option<u16> {
        self.0.publications.get(topic).map(|e| e.value().port())
    }

    /// Runs every publication's and subscription's cleanup, then wakes
    /// anyone blocked in [`run_node`]. In-flight messages in bounded
    /// buffers are discarded, matching spec.md §5.
    pub async fn shutdown(&self) {
        info!("node {} shutting down", self.0.name);
        for entry in self.0.publications.iter() {
            entry.value().shutdown().await;
        }
        for entry in self.0.subscriptions.iter() {
            entry.value().shutdown().await;
        }
        self.0.publications.clear();
        self.0.subscriptions.clear();
        self.0.shutdown_notify.notify_waiters();
    }
}

/// Builds the initial node state, runs `program` to completion (the
/// program issues `advertise`/`subscribe` calls and may spawn its own
/// consuming tasks), then blocks until [`NodeHandle::shutdown`] is
/// called, at which point every publication and subscription is torn
/// down and this function returns.
///
/// The external XML-RPC registration / `publisher_update`-serving loop
/// is, per scope, not implemented here: `NodeHandle` is exactly the
/// facade such a layer would hold and drive (registering advertised
/// topics with the master, receiving peer lists via `publisher_update`,
/// serving slave-API requests) while this function's caller blocks.
///
/// `NodeHandle::shutdown` itself runs the teardown and fires
/// `shutdown_notify`; by the time `notified()` below resolves, every
/// publication and subscription is already gone, so this function only
/// needs to wait for that signal, not repeat the teardown.
pub async fn run_node<F, Fut>(name: impl Into<String>, master_uri: impl Into<String>, program: F)
where
    F: FnOnce(NodeHandle) -> Fut,
    Fut: Future<Output = ()>,
{
    let node = NodeHandle::new(name, master_uri);
    program(node.clone()).await;

    node.0.shutdown_notify.notified().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::stream_from_receiver;
    use tcpros_test_msgs::StringMsg;

    fn test_handle(name: &str) -> NodeHandle {
        NodeHandle::new(name, "")
    }

    #[tokio::test]
    async fn subscribing_same_topic_twice_fails() {
        let node = test_handle("/node");
        node.subscribe::<StringMsg>("/chat", 10).unwrap();
        let err = node.subscribe::<StringMsg>("/chat", 10).unwrap_err();
        assert!(matches!(err, NodeError::DuplicateTopic(_, "subscribed")));
    }

    #[tokio::test]
    async fn advertising_same_topic_twice_fails() {
        let node = test_handle("/node");
        let (_tx, rx) = mpsc::channel::<StringMsg>(10);
        node.advertise("/chat", stream_from_receiver(rx), 10)
            .await
            .unwrap();

        let (_tx2, rx2) = mpsc::channel::<StringMsg>(10);
        let err = node
            .advertise::<StringMsg>("/chat", stream_from_receiver(rx2), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::DuplicateTopic(_, "advertised")));
    }

    #[tokio::test]
    async fn publisher_update_for_unknown_topic_is_ignored() {
        let node = test_handle("/node");
        // Must not panic despite no subscription existing.
        node.publisher_update("/nonexistent", vec!["host:1".to_owned()])
            .await;
    }

    #[tokio::test]
    async fn topic_port_reflects_advertised_topics_only() {
        let node = test_handle("/node");
        assert_eq!(node.topic_port("/chat"), None);

        let (_tx, rx) = mpsc::channel::<StringMsg>(10);
        let port = node
            .advertise("/chat", stream_from_receiver(rx), 10)
            .await
            .unwrap();
        assert_eq!(node.topic_port("/chat"), Some(port));
    }

    #[tokio::test]
    async fn racing_advertise_calls_leave_exactly_one_live_publication() {
        let node = test_handle("/node");
        let (_tx1, rx1) = mpsc::channel::<StringMsg>(10);
        let (_tx2, rx2) = mpsc::channel::<StringMsg>(10);

        let node_a = node.clone();
        let node_b = node.clone();
        let (first, second) = tokio::join!(
            node_a.advertise("/race", stream_from_receiver(rx1), 10),
            node_b.advertise("/race", stream_from_receiver(rx2), 10),
        );

        // Exactly one side wins the race for the registry slot.
        let winner_port = match (first, second) {
            (Ok(port), Err(NodeError::DuplicateTopic(_, "advertised"))) => port,
            (Err(NodeError::DuplicateTopic(_, "advertised")), Ok(port)) => port,
            other => panic!("expected exactly one winner, got {other:?}"),
        };

        assert_eq!(node.snapshot_publications().await.len(), 1);
        assert_eq!(node.topic_port("/race"), Some(winner_port));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_clears_the_registry() {
        let node = test_handle("/node");
        node.subscribe::<StringMsg>("/chat", 10).unwrap();
        let (_tx, rx) = mpsc::channel::<StringMsg>(10);
        node.advertise("/out", stream_from_receiver(rx), 10)
            .await
            .unwrap();

        node.shutdown().await;
        assert_eq!(node.snapshot_subscriptions().await.len(), 0);
        assert_eq!(node.snapshot_publications().await.len(), 0);
    }
}
