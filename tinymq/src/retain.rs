//! Retained messages.
//!
//! The latest retained PUBLISH per exact topic lives in a [`RetainTree`]; subscribing with a filter
//! walks the tree and replays every retained message under it. Publishing an empty retained payload
//! deletes the entry for that topic.

use std::str::FromStr;

use async_trait::async_trait;
use tokio::sync::RwLock;

use tinymq_utils::Counter;

use crate::topic::{Level, Topic};
use crate::types::{HashMap, Publish, TopicFilter};
use crate::Result;

#[async_trait]
pub trait RetainStorage: Sync + Send {
    ///topic - concrete topic taken from `publish.topic`, an empty payload removes the message
    async fn set(&self, publish: Publish) -> Result<()>;

    ///topic_filter - Topic filter
    async fn get(&self, topic_filter: &TopicFilter) -> Result<Vec<Publish>>;

    fn count(&self) -> isize;

    fn max(&self) -> isize;
}

pub struct DefaultRetainStorage {
    messages: RwLock<RetainTree<Publish>>,
    retaineds: Counter,
}

impl Default for DefaultRetainStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultRetainStorage {
    #[inline]
    pub fn new() -> DefaultRetainStorage {
        Self { messages: RwLock::new(RetainTree::default()), retaineds: Counter::new() }
    }
}

#[async_trait]
impl RetainStorage for DefaultRetainStorage {
    #[inline]
    async fn set(&self, publish: Publish) -> Result<()> {
        let topic = Topic::parse_name(&publish.topic)?;
        let mut messages = self.messages.write().await;
        let old = messages.remove(&topic);
        if !publish.payload.is_empty() {
            messages.insert(&topic, publish);
            if old.is_none() {
                self.retaineds.inc();
            }
        } else if old.is_some() {
            self.retaineds.dec();
        }
        Ok(())
    }

    #[inline]
    async fn get(&self, topic_filter: &TopicFilter) -> Result<Vec<Publish>> {
        let topic = Topic::from_str(topic_filter)?;
        let retains = self.messages.read().await.matches(&topic).into_iter().map(|(_, p)| p).collect();
        Ok(retains)
    }

    #[inline]
    fn count(&self) -> isize {
        self.retaineds.count()
    }

    #[inline]
    fn max(&self) -> isize {
        self.retaineds.max()
    }
}

pub type RetainTree<V> = Node<V>;

pub struct Node<V> {
    value: Option<V>,
    branches: HashMap<Level, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { value: None, branches: HashMap::default() }
    }
}

impl<V> Node<V>
where
    V: std::fmt::Debug + Clone,
{
    #[inline]
    pub fn insert(&mut self, topic: &Topic, value: V) -> Option<V> {
        let mut node = self;
        for level in topic.levels() {
            node = node.branches.entry(level.clone()).or_default();
        }
        node.value.replace(value)
    }

    #[inline]
    pub fn remove(&mut self, topic: &Topic) -> Option<V> {
        self._remove(topic.levels())
    }

    fn _remove(&mut self, path: &[Level]) -> Option<V> {
        let (first, rest) = match path.split_first() {
            None => return self.value.take(),
            Some(p) => p,
        };
        let child = self.branches.get_mut(first)?;
        let res = child._remove(rest);
        if child.is_empty() {
            self.branches.remove(first);
        }
        res
    }

    /// Retained values whose topic the filter matches, at most one per topic.
    #[inline]
    pub fn matches(&self, topic_filter: &Topic) -> Vec<(Topic, V)> {
        let mut out = Vec::new();
        self._matches(topic_filter.levels(), &mut Vec::new(), &mut out);
        out
    }

    fn _matches(&self, path: &[Level], sub_path: &mut Vec<Level>, out: &mut Vec<(Topic, V)>) {
        let (first, rest) = match path.split_first() {
            None => {
                //Precise matching
                if let Some(v) = self.value.as_ref() {
                    out.push((Topic::from(sub_path.clone()), v.clone()));
                }
                return;
            }
            Some(p) => p,
        };

        match first {
            Level::MultiWildcard => {
                //Multilayer matching, the parent level itself included
                if let Some(v) = self.value.as_ref() {
                    if !sub_path.is_empty() {
                        out.push((Topic::from(sub_path.clone()), v.clone()));
                    }
                }
                for (k, n) in self.branches.iter() {
                    if sub_path.is_empty() && k.is_metadata() {
                        continue;
                    }
                    sub_path.push(k.clone());
                    n._collect(sub_path, out);
                    sub_path.pop();
                }
            }
            Level::SingleWildcard => {
                for (k, n) in self.branches.iter() {
                    //Topic names starting with $ are not matched by filters starting with a wildcard
                    if sub_path.is_empty() && k.is_metadata() {
                        continue;
                    }
                    sub_path.push(k.clone());
                    n._matches(rest, sub_path, out);
                    sub_path.pop();
                }
            }
            _ => {
                if let Some(n) = self.branches.get(first) {
                    sub_path.push(first.clone());
                    n._matches(rest, sub_path, out);
                    sub_path.pop();
                }
            }
        }
    }

    fn _collect(&self, sub_path: &mut Vec<Level>, out: &mut Vec<(Topic, V)>) {
        if let Some(v) = self.value.as_ref() {
            out.push((Topic::from(sub_path.clone()), v.clone()));
        }
        for (k, n) in self.branches.iter() {
            sub_path.push(k.clone());
            n._collect(sub_path, out);
            sub_path.pop();
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.branches.is_empty()
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        if self.value.is_some() {
            len + 1
        } else {
            len
        }
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bytes::Bytes;

    use super::*;
    use crate::types::QoS;

    fn values(tree: &RetainTree<i32>, topic_filter: &str) -> Vec<i32> {
        let t = Topic::from_str(topic_filter).unwrap();
        let mut v: Vec<i32> = tree.matches(&t).into_iter().map(|(_, v)| v).collect();
        v.sort();
        v
    }

    fn insert(tree: &mut RetainTree<i32>, topic: &str, v: i32) {
        tree.insert(&Topic::parse_name(topic).unwrap(), v);
    }

    #[test]
    fn retain() {
        let mut tree: RetainTree<i32> = RetainTree::default();
        insert(&mut tree, "/iot/b/x", 1);
        insert(&mut tree, "/iot/b/y", 2);
        insert(&mut tree, "/iot/b/z", 3);
        insert(&mut tree, "/iot/b", 123);
        insert(&mut tree, "/x/y/z", 4);

        assert_eq!(values(&tree, "/iot/b/y"), vec![2]);
        assert_eq!(values(&tree, "/iot/b/+"), vec![1, 2, 3]);
        assert_eq!(values(&tree, "/iot/b/#"), vec![1, 2, 3, 123]);
        assert_eq!(values(&tree, "/iot/+"), vec![123]);
        assert_eq!(values(&tree, "/x/y/z"), vec![4]);
        assert_eq!(values(&tree, "#"), vec![1, 2, 3, 4, 123]);

        insert(&mut tree, "/xx/yy", -1);
        insert(&mut tree, "/xx/yy/", 0);
        insert(&mut tree, "/xx/yy/1", 1);
        insert(&mut tree, "/xx/yy/3/4", 4);
        insert(&mut tree, "/xx/yy/3/4/5", 5);

        assert_eq!(values(&tree, "/xx/yy/+"), vec![0, 1]);
        assert_eq!(values(&tree, "/xx/yy/3/+"), vec![4]);
        assert_eq!(values(&tree, "/xx/yy/3/4/+"), vec![5]);
        assert!(values(&tree, "/xx/yy/1/+").is_empty());
        assert_eq!(values(&tree, "/xx/+/3/#"), vec![4, 5]);
    }

    #[test]
    fn remove_prunes() {
        let mut tree: RetainTree<i32> = RetainTree::default();
        insert(&mut tree, "a/b/c", 1);
        insert(&mut tree, "a", 2);
        assert_eq!(tree.nodes_size(), 3);
        assert_eq!(tree.remove(&Topic::parse_name("a/b/c").unwrap()), Some(1));
        assert_eq!(tree.nodes_size(), 1);
        assert_eq!(tree.remove(&Topic::parse_name("a/b").unwrap()), None);
        assert_eq!(tree.remove(&Topic::parse_name("a").unwrap()), Some(2));
        assert!(tree.is_empty());
    }

    #[test]
    fn metadata_topics() {
        let mut tree: RetainTree<i32> = RetainTree::default();
        insert(&mut tree, "$SYS/uptime", 1);
        insert(&mut tree, "sys/uptime", 2);
        assert_eq!(values(&tree, "#"), vec![2]);
        assert_eq!(values(&tree, "+/uptime"), vec![2]);
        assert_eq!(values(&tree, "$SYS/#"), vec![1]);
        assert_eq!(values(&tree, "$SYS/+"), vec![1]);
    }

    fn retained(topic: &str, payload: &'static [u8], qos: QoS) -> Publish {
        Publish {
            dup: false,
            retain: true,
            qos,
            topic: topic.into(),
            packet_id: None,
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn storage_set_get_clear() {
        let storage = DefaultRetainStorage::new();
        storage.set(retained("a/b", b"hello", QoS::AtLeastOnce)).await.unwrap();
        storage.set(retained("a/c", b"world", QoS::AtMostOnce)).await.unwrap();
        storage.set(retained("a/b", b"again", QoS::ExactlyOnce)).await.unwrap();
        assert_eq!(storage.count(), 2);

        let got = storage.get(&"a/b".into()).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0].topic[..], "a/b");
        assert_eq!(got[0].payload, Bytes::from_static(b"again"));
        assert_eq!(got[0].qos, QoS::ExactlyOnce);
        assert!(got[0].retain);

        storage.set(retained("a/b", b"", QoS::AtMostOnce)).await.unwrap();
        assert_eq!(storage.count(), 1);
        assert_eq!(storage.get(&"a/#".into()).await.unwrap().len(), 1);
        assert_eq!(storage.max(), 2);

        assert!(storage.set(retained("a/+", b"x", QoS::AtMostOnce)).await.is_err());
        assert!(storage.get(&"a/#/b".into()).await.is_err());
    }
}
