use std::fmt;
use std::str::FromStr;

use crate::topic::{Level, Topic, TopicError};
use crate::types::{ClientId, HashMap, QoS};

pub type SubscriptionTrie = Node;

/// One level of the subscription tree. Subscribers are kept by client id only; the live session
/// is looked up in the registry at delivery time.
#[derive(Default)]
pub struct Node {
    subscribers: HashMap<ClientId, QoS>,
    branches: HashMap<Level, Node>,
}

impl Node {
    /// Adds or updates a subscription, returning the QoS previously granted for the same filter.
    #[inline]
    pub fn subscribe(&mut self, topic_filter: &str, client_id: ClientId, qos: QoS) -> Result<Option<QoS>, TopicError> {
        let topic = Topic::from_str(topic_filter)?;
        Ok(self.insert(&topic, client_id, qos))
    }

    #[inline]
    pub fn insert(&mut self, topic_filter: &Topic, client_id: ClientId, qos: QoS) -> Option<QoS> {
        let mut node = self;
        for level in topic_filter.levels() {
            node = node.branches.entry(level.clone()).or_default();
        }
        node.subscribers.insert(client_id, qos)
    }

    /// Removes a subscription. Unknown filters and subscribers are ignored.
    #[inline]
    pub fn unsubscribe(&mut self, topic_filter: &str, client_id: &ClientId) -> Result<bool, TopicError> {
        let topic = Topic::from_str(topic_filter)?;
        Ok(self.remove(&topic, client_id))
    }

    #[inline]
    pub fn remove(&mut self, topic_filter: &Topic, client_id: &ClientId) -> bool {
        self._remove(topic_filter.levels(), client_id)
    }

    fn _remove(&mut self, path: &[Level], client_id: &ClientId) -> bool {
        match path.split_first() {
            None => self.subscribers.remove(client_id).is_some(),
            Some((level, rest)) => {
                if let Some(n) = self.branches.get_mut(level) {
                    let removed = n._remove(rest, client_id);
                    if n.is_empty() {
                        self.branches.remove(level);
                    }
                    removed
                } else {
                    false
                }
            }
        }
    }

    /// Drops `client_id` from every filter, returning how many subscriptions were removed.
    pub fn remove_all(&mut self, client_id: &ClientId) -> usize {
        let mut removed = usize::from(self.subscribers.remove(client_id).is_some());
        self.branches.retain(|_, n| {
            removed += n.remove_all(client_id);
            !n.is_empty()
        });
        removed
    }

    /// Subscribers whose filters match `topic_name`, one entry per client with the highest QoS
    /// granted across its matching filters.
    #[inline]
    pub fn matches(&self, topic_name: &Topic) -> Vec<(ClientId, QoS)> {
        let mut out = HashMap::default();
        self._matches(topic_name.levels(), true, &mut out);
        out.into_iter().collect()
    }

    fn _matches(&self, path: &[Level], root: bool, out: &mut HashMap<ClientId, QoS>) {
        //Topic names starting with $ are not matched by filters starting with a wildcard
        let guarded = root && path.first().is_some_and(Level::is_metadata);

        if !guarded {
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                merge(out, &n.subscribers);
            }
        }

        match path.split_first() {
            None => merge(out, &self.subscribers),
            Some((level, rest)) => {
                if !guarded {
                    if let Some(n) = self.branches.get(&Level::SingleWildcard) {
                        n._matches(rest, false, out);
                    }
                }
                if let Some(n) = self.branches.get(level) {
                    n._matches(rest, false, out);
                }
            }
        }
    }

    /// Visits every (filter, client id, qos) triple in the tree.
    pub fn for_each<F: FnMut(&Topic, &ClientId, QoS)>(&self, mut f: F) {
        let mut path = Vec::new();
        self._for_each(&mut path, &mut f);
    }

    fn _for_each<F: FnMut(&Topic, &ClientId, QoS)>(&self, path: &mut Vec<Level>, f: &mut F) {
        if !self.subscribers.is_empty() {
            let topic = Topic::from(path.clone());
            for (client_id, qos) in self.subscribers.iter() {
                f(&topic, client_id, *qos);
            }
        }
        for (level, n) in self.branches.iter() {
            path.push(level.clone());
            n._for_each(path, f);
            path.pop();
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.branches.is_empty()
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        self.subscribers.len() + len
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }
}

#[inline]
fn merge(out: &mut HashMap<ClientId, QoS>, subscribers: &HashMap<ClientId, QoS>) {
    for (client_id, qos) in subscribers.iter() {
        out.entry(client_id.clone()).and_modify(|q| *q = (*q).max(*qos)).or_insert(*qos);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {{ nodes_size: {}, values_size: {} }}", self.nodes_size(), self.values_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut v: Vec<(ClientId, QoS)>) -> Vec<(ClientId, QoS)> {
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v
    }

    fn ids(trie: &SubscriptionTrie, name: &str) -> Vec<String> {
        let mut v: Vec<String> =
            trie.matches(&Topic::parse_name(name).unwrap()).into_iter().map(|(c, _)| c.to_string()).collect();
        v.sort();
        v
    }

    #[test]
    fn test_subscribe_and_match() {
        let mut trie = SubscriptionTrie::default();
        trie.subscribe("/iot/b/x", "c1".into(), QoS::AtMostOnce).unwrap();
        trie.subscribe("/iot/b/x", "c2".into(), QoS::AtMostOnce).unwrap();
        trie.subscribe("/iot/b/y", "c3".into(), QoS::AtMostOnce).unwrap();
        trie.subscribe("/ddl/22/#", "c5".into(), QoS::AtMostOnce).unwrap();
        trie.subscribe("/ddl/+/+", "c6".into(), QoS::AtMostOnce).unwrap();

        assert_eq!(ids(&trie, "/iot/b/x"), vec!["c1", "c2"]);
        assert_eq!(ids(&trie, "/iot/b/y"), vec!["c3"]);
        assert_eq!(ids(&trie, "/ddl/a/b"), vec!["c6"]);
        assert_eq!(ids(&trie, "/ddl/22/1/2"), vec!["c5"]);
        assert_eq!(ids(&trie, "/ddl/22/1"), vec!["c5", "c6"]);
        assert_eq!(ids(&trie, "/ddl/22/"), vec!["c5", "c6"]);
        assert_eq!(ids(&trie, "/ddl/22"), vec!["c5"]);
        assert!(ids(&trie, "/iot/b").is_empty());
    }

    #[test]
    fn test_resubscribe_updates_qos() {
        let mut trie = SubscriptionTrie::default();
        assert_eq!(trie.subscribe("a/b", "c1".into(), QoS::AtMostOnce).unwrap(), None);
        assert_eq!(trie.subscribe("a/b", "c1".into(), QoS::ExactlyOnce).unwrap(), Some(QoS::AtMostOnce));
        let name = Topic::parse_name("a/b").unwrap();
        assert_eq!(trie.matches(&name), vec![("c1".into(), QoS::ExactlyOnce)]);
        assert_eq!(trie.values_size(), 1);
    }

    #[test]
    fn test_overlapping_filters_max_qos() {
        let mut trie = SubscriptionTrie::default();
        trie.subscribe("a/+/c", "c1".into(), QoS::AtMostOnce).unwrap();
        trie.subscribe("a/#", "c1".into(), QoS::ExactlyOnce).unwrap();
        trie.subscribe("a/b/c", "c1".into(), QoS::AtLeastOnce).unwrap();
        trie.subscribe("a/b/c", "c2".into(), QoS::AtLeastOnce).unwrap();

        let name = Topic::parse_name("a/b/c").unwrap();
        assert_eq!(
            sorted(trie.matches(&name)),
            vec![("c1".into(), QoS::ExactlyOnce), ("c2".into(), QoS::AtLeastOnce)]
        );
    }

    #[test]
    fn test_metadata_not_matched_by_leading_wildcard() {
        let mut trie = SubscriptionTrie::default();
        trie.subscribe("#", "c1".into(), QoS::AtMostOnce).unwrap();
        trie.subscribe("+/monitor", "c2".into(), QoS::AtMostOnce).unwrap();
        trie.subscribe("$SYS/#", "c3".into(), QoS::AtMostOnce).unwrap();

        assert_eq!(ids(&trie, "$SYS/monitor"), vec!["c3"]);
        assert_eq!(ids(&trie, "$SYS"), vec!["c3"]);
        assert_eq!(ids(&trie, "x/monitor"), vec!["c1", "c2"]);
    }

    #[test]
    fn test_unsubscribe_prunes() {
        let mut trie = SubscriptionTrie::default();
        trie.subscribe("a/b/c", "c1".into(), QoS::AtMostOnce).unwrap();
        trie.subscribe("a/+", "c1".into(), QoS::AtMostOnce).unwrap();
        assert_eq!(trie.nodes_size(), 4);

        assert!(trie.unsubscribe("a/b/c", &"c1".into()).unwrap());
        assert!(!trie.unsubscribe("a/b/c", &"c1".into()).unwrap());
        assert!(!trie.unsubscribe("x/y", &"c1".into()).unwrap());
        assert_eq!(trie.nodes_size(), 2);
        assert!(trie.unsubscribe("a/b/#/c", &"c1".into()).is_err());

        assert!(trie.unsubscribe("a/+", &"c1".into()).unwrap());
        assert!(trie.is_empty());
    }

    #[test]
    fn test_remove_all() {
        let mut trie = SubscriptionTrie::default();
        trie.subscribe("a/b", "c1".into(), QoS::AtMostOnce).unwrap();
        trie.subscribe("a/#", "c1".into(), QoS::AtMostOnce).unwrap();
        trie.subscribe("x", "c1".into(), QoS::AtMostOnce).unwrap();
        trie.subscribe("a/b", "c2".into(), QoS::AtMostOnce).unwrap();

        assert_eq!(trie.remove_all(&"c1".into()), 3);
        assert_eq!(ids(&trie, "a/b"), vec!["c2"]);
        assert_eq!(trie.nodes_size(), 2);
        assert_eq!(trie.remove_all(&"c2".into()), 1);
        assert!(trie.is_empty());
    }

    #[test]
    fn test_agrees_with_topic_matches() {
        let filters = [
            "#", "+", "a", "a/#", "a/+", "a/b", "a/+/c", "+/b/#", "/+", "+/+", "$SYS/#", "$SYS/+", "a//c",
            "a/b/c/#",
        ];
        let names = ["a", "a/b", "a/b/c", "a/x/c", "/a", "a//c", "$SYS", "$SYS/x", "b/b/b", "a/b/c/d"];

        let mut trie = SubscriptionTrie::default();
        for (i, f) in filters.iter().enumerate() {
            trie.subscribe(f, i.to_string().into(), QoS::AtMostOnce).unwrap();
        }

        for name in names {
            let topic = Topic::parse_name(name).unwrap();
            let mut expected: Vec<String> = filters
                .iter()
                .enumerate()
                .filter(|(_, f)| Topic::from_str(f).unwrap().matches(&topic))
                .map(|(i, _)| i.to_string())
                .collect();
            expected.sort();
            assert_eq!(ids(&trie, name), expected, "topic name {}", name);
        }
    }

    #[test]
    fn test_for_each() {
        let mut trie = SubscriptionTrie::default();
        trie.subscribe("a/+", "c1".into(), QoS::AtLeastOnce).unwrap();
        trie.subscribe("b", "c2".into(), QoS::ExactlyOnce).unwrap();
        let mut all = Vec::new();
        trie.for_each(|t, c, q| all.push((t.to_string(), c.to_string(), q)));
        all.sort();
        assert_eq!(
            all,
            vec![("a/+".into(), "c1".into(), QoS::AtLeastOnce), ("b".into(), "c2".into(), QoS::ExactlyOnce)]
        );
    }
}
