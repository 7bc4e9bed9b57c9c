use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use tinymq_utils::Counter;

use crate::store::Store;
use crate::topic::Topic;
use crate::trie::SubscriptionTrie;
use crate::types::{ClientId, QoS, TopicFilter};
use crate::Result;

#[async_trait]
pub trait Router: Sync + Send {
    /// Adds or updates a subscription, returning the QoS previously granted for the same filter.
    /// The durable record is written first; a store failure leaves the router unchanged.
    async fn add(&self, topic_filter: &TopicFilter, client_id: &ClientId, qos: QoS) -> Result<Option<QoS>>;

    /// Removes one subscription. Unknown filters are not an error.
    async fn remove(&self, topic_filter: &TopicFilter, client_id: &ClientId) -> Result<bool>;

    /// Removes every subscription of `client_id`, durable records included.
    async fn remove_all(&self, client_id: &ClientId) -> Result<usize>;

    /// Subscribers of a topic name with the QoS each was granted.
    async fn matches(&self, topic: &Topic) -> Vec<(ClientId, QoS)>;

    /// Reloads all durable subscriptions into the router.
    async fn restore(&self) -> Result<usize>;

    async fn subscriptions_of(&self, client_id: &ClientId) -> Vec<(TopicFilter, QoS)>;

    fn subscriptions(&self) -> &Counter;
}

pub struct DefaultRouter {
    topics: RwLock<SubscriptionTrie>,
    subscriptions: Counter,
    store: Arc<dyn Store>,
}

impl DefaultRouter {
    #[inline]
    pub fn new(store: Arc<dyn Store>) -> DefaultRouter {
        Self { topics: RwLock::new(SubscriptionTrie::default()), subscriptions: Counter::new(), store }
    }
}

#[async_trait]
impl Router for DefaultRouter {
    #[inline]
    async fn add(&self, topic_filter: &TopicFilter, client_id: &ClientId, qos: QoS) -> Result<Option<QoS>> {
        log::debug!("{:?} add, topic_filter: {:?}, qos: {}", client_id, topic_filter, qos);
        let topic = Topic::from_str(topic_filter)?;
        self.store.store_subscription(client_id, topic_filter, qos).await?;
        let old = self.topics.write().await.insert(&topic, client_id.clone(), qos);
        if old.is_none() {
            self.subscriptions.inc();
        }
        Ok(old)
    }

    #[inline]
    async fn remove(&self, topic_filter: &TopicFilter, client_id: &ClientId) -> Result<bool> {
        log::debug!("{:?} remove, topic_filter: {:?}", client_id, topic_filter);
        let topic = Topic::from_str(topic_filter)?;
        let removed = self.topics.write().await.remove(&topic, client_id);
        if removed {
            self.subscriptions.dec();
        }
        self.store.delete_subscription(client_id, topic_filter).await?;
        Ok(removed)
    }

    #[inline]
    async fn remove_all(&self, client_id: &ClientId) -> Result<usize> {
        let removed = self.topics.write().await.remove_all(client_id);
        self.subscriptions.decs(removed as isize);
        self.store.clean_subscriptions(client_id).await?;
        log::debug!("{:?} remove_all, removed: {}", client_id, removed);
        Ok(removed)
    }

    #[inline]
    async fn matches(&self, topic: &Topic) -> Vec<(ClientId, QoS)> {
        self.topics.read().await.matches(topic)
    }

    async fn restore(&self) -> Result<usize> {
        let subs = self.store.lookup_all_subscriptions().await?;
        let mut topics = self.topics.write().await;
        let mut restored = 0;
        for (client_id, topic_filter, qos) in subs {
            let topic = match Topic::from_str(&topic_filter) {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("{:?} skip stored subscription {:?}, {}", client_id, topic_filter, e);
                    continue;
                }
            };
            if topics.insert(&topic, client_id, qos).is_none() {
                self.subscriptions.inc();
                restored += 1;
            }
        }
        Ok(restored)
    }

    async fn subscriptions_of(&self, client_id: &ClientId) -> Vec<(TopicFilter, QoS)> {
        let mut subs = Vec::new();
        self.topics.read().await.for_each(|topic, c, qos| {
            if c == client_id {
                subs.push((TopicFilter::from(topic.to_string()), qos));
            }
        });
        subs
    }

    #[inline]
    fn subscriptions(&self) -> &Counter {
        &self.subscriptions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn router() -> (DefaultRouter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (DefaultRouter::new(store.clone()), store)
    }

    fn name(s: &str) -> Topic {
        Topic::parse_name(s).unwrap()
    }

    #[tokio::test]
    async fn test_add_remove_persist() {
        let (router, store) = router();
        let c1: ClientId = "c1".into();
        assert_eq!(router.add(&"a/+".into(), &c1, QoS::AtLeastOnce).await.unwrap(), None);
        assert_eq!(router.add(&"a/+".into(), &c1, QoS::ExactlyOnce).await.unwrap(), Some(QoS::AtLeastOnce));
        assert_eq!(router.subscriptions().count(), 1);
        assert_eq!(router.matches(&name("a/b")).await, vec![(c1.clone(), QoS::ExactlyOnce)]);
        assert_eq!(store.lookup_all_subscriptions().await.unwrap(), vec![(c1.clone(), "a/+".into(), QoS::ExactlyOnce)]);

        assert!(router.add(&"a/#/b".into(), &c1, QoS::AtMostOnce).await.is_err());
        assert_eq!(store.lookup_all_subscriptions().await.unwrap().len(), 1);

        assert!(router.remove(&"a/+".into(), &c1).await.unwrap());
        assert!(!router.remove(&"a/+".into(), &c1).await.unwrap());
        assert!(router.matches(&name("a/b")).await.is_empty());
        assert!(store.lookup_all_subscriptions().await.unwrap().is_empty());
        assert_eq!(router.subscriptions().count(), 0);
    }

    #[tokio::test]
    async fn test_remove_all_and_restore() {
        let (router, store) = router();
        let c1: ClientId = "c1".into();
        let c2: ClientId = "c2".into();
        router.add(&"x/y".into(), &c1, QoS::AtMostOnce).await.unwrap();
        router.add(&"x/#".into(), &c1, QoS::AtLeastOnce).await.unwrap();
        router.add(&"x/y".into(), &c2, QoS::AtMostOnce).await.unwrap();

        let mut subs = router.subscriptions_of(&c1).await;
        subs.sort();
        assert_eq!(subs, vec![("x/#".into(), QoS::AtLeastOnce), ("x/y".into(), QoS::AtMostOnce)]);

        let restored = DefaultRouter::new(store.clone());
        assert_eq!(restored.restore().await.unwrap(), 3);
        let mut matched = restored.matches(&name("x/y")).await;
        matched.sort();
        assert_eq!(matched, vec![(c1.clone(), QoS::AtLeastOnce), (c2.clone(), QoS::AtMostOnce)]);

        assert_eq!(router.remove_all(&c1).await.unwrap(), 2);
        assert_eq!(router.matches(&name("x/y")).await, vec![(c2.clone(), QoS::AtMostOnce)]);
        assert_eq!(store.lookup_all_subscriptions().await.unwrap().len(), 1);
        assert_eq!(router.subscriptions().count(), 1);
        assert_eq!(router.subscriptions().max(), 3);
    }
}
