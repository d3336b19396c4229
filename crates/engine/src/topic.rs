//! Topic membership for publish/subscribe.
//!
//! The registry only records which socket ids belong to which topics, in both
//! directions, so a closing socket can be purged from all of its topics at
//! once. Delivery lives in the reactor, which owns the sockets.

use std::collections::{BTreeSet, HashMap};

use crate::reactor::SocketId;

/// A membership change: `(new_count, old_count)` subscribers of the topic.
pub type SubscriberCounts = (usize, usize);

#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: HashMap<String, BTreeSet<SocketId>>,
    memberships: HashMap<SocketId, BTreeSet<String>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id` to `topic`, `None` when it already was a member.
    pub fn subscribe(&mut self, id: SocketId, topic: &str) -> Option<SubscriberCounts> {
        let subscribers = self.topics.entry(topic.to_string()).or_default();
        let old = subscribers.len();
        if !subscribers.insert(id) {
            return None;
        }
        self.memberships.entry(id).or_default().insert(topic.to_string());
        Some((old + 1, old))
    }

    /// Removes `id` from `topic`, `None` when it wasn't a member.
    pub fn unsubscribe(&mut self, id: SocketId, topic: &str) -> Option<SubscriberCounts> {
        let subscribers = self.topics.get_mut(topic)?;
        let old = subscribers.len();
        if !subscribers.remove(&id) {
            return None;
        }
        if subscribers.is_empty() {
            self.topics.remove(topic);
        }
        if let Some(topics) = self.memberships.get_mut(&id) {
            topics.remove(topic);
            if topics.is_empty() {
                self.memberships.remove(&id);
            }
        }
        Some((old - 1, old))
    }

    pub fn is_subscribed(&self, id: SocketId, topic: &str) -> bool {
        self.topics.get(topic).is_some_and(|subscribers| subscribers.contains(&id))
    }

    /// Topics of one socket in lexical order.
    pub fn topics_of(&self, id: SocketId) -> impl Iterator<Item = &str> {
        self.memberships.get(&id).into_iter().flatten().map(String::as_str)
    }

    pub fn subscribers<'a>(&'a self, topic: &str) -> impl Iterator<Item = SocketId> + use<'a> {
        self.topics.get(topic).into_iter().flatten().copied()
    }

    pub fn num_subscribers(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, BTreeSet::len)
    }

    pub fn num_topics(&self) -> usize {
        self.topics.len()
    }

    /// Drops `id` from every topic, returning each topic with its new and old count.
    pub fn remove_socket(&mut self, id: SocketId) -> Vec<(String, SubscriberCounts)> {
        let Some(topics) = self.memberships.remove(&id) else {
            return Vec::new();
        };

        let mut changes = Vec::with_capacity(topics.len());
        for topic in topics {
            if let Some(subscribers) = self.topics.get_mut(&topic) {
                let old = subscribers.len();
                subscribers.remove(&id);
                let new = subscribers.len();
                if new == 0 {
                    self.topics.remove(&topic);
                }
                changes.push((topic, (new, old)));
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::SocketTable;
    use crate::reactor::table::SocketEntry;
    use crate::response::HttpSocket;
    use crate::config::EngineConfig;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ids(n: usize) -> Vec<SocketId> {
        let mut table = SocketTable::new();
        (0..n)
            .map(|_| {
                table
                    .insert_with(|id| {
                        (SocketEntry::Http(Rc::new(RefCell::new(HttpSocket::new(id, None, &EngineConfig::default())))), ())
                    })
                    .0
            })
            .collect()
    }

    #[test]
    fn subscribe_is_idempotent() {
        let ids = ids(2);
        let mut registry = TopicRegistry::new();

        assert_eq!(registry.subscribe(ids[0], "news"), Some((1, 0)));
        assert_eq!(registry.subscribe(ids[0], "news"), None);
        assert_eq!(registry.num_subscribers("news"), 1);
        assert_eq!(registry.subscribe(ids[1], "news"), Some((2, 1)));

        assert_eq!(registry.unsubscribe(ids[0], "news"), Some((1, 2)));
        assert_eq!(registry.unsubscribe(ids[0], "news"), None);
        assert!(!registry.is_subscribed(ids[0], "news"));
        assert!(registry.is_subscribed(ids[1], "news"));
    }

    #[test]
    fn topics_of_one_socket() {
        let ids = ids(1);
        let mut registry = TopicRegistry::new();
        registry.subscribe(ids[0], "b");
        registry.subscribe(ids[0], "a");

        assert_eq!(registry.topics_of(ids[0]).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn empty_topic_has_no_subscribers() {
        let registry = TopicRegistry::new();
        assert_eq!(registry.subscribers("nobody").count(), 0);
        assert_eq!(registry.num_subscribers("nobody"), 0);
    }

    #[test]
    fn remove_socket_purges_every_topic() {
        let ids = ids(2);
        let mut registry = TopicRegistry::new();
        registry.subscribe(ids[0], "a");
        registry.subscribe(ids[0], "b");
        registry.subscribe(ids[1], "b");

        let changes = registry.remove_socket(ids[0]);
        assert_eq!(changes, vec![("a".to_string(), (0, 1)), ("b".to_string(), (1, 2))]);
        assert_eq!(registry.num_topics(), 1);
        assert_eq!(registry.subscribers("b").collect::<Vec<_>>(), vec![ids[1]]);
        assert_eq!(registry.topics_of(ids[0]).count(), 0);
        assert!(registry.remove_socket(ids[0]).is_empty());
    }
}
