//! Ref-counted market subscription set

use std::collections::HashMap;

/// Market id -> number of live positions referencing it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    refs: HashMap<String, usize>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference. Returns true when the market becomes newly active.
    pub fn add(&mut self, market_id: &str) -> bool {
        let count = self.refs.entry(market_id.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop a reference. Returns true when the last reference goes away.
    /// Removing an unknown market is a no-op.
    pub fn remove(&mut self, market_id: &str) -> bool {
        match self.refs.get_mut(market_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.refs.remove(market_id);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, market_id: &str) -> bool {
        self.refs.contains_key(market_id)
    }

    pub fn ref_count(&self, market_id: &str) -> usize {
        self.refs.get(market_id).copied().unwrap_or(0)
    }

    /// Active markets, sorted
    pub fn markets(&self) -> Vec<String> {
        let mut markets: Vec<String> = self.refs.keys().cloned().collect();
        markets.sort();
        markets
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_counting() {
        let mut set = SubscriptionSet::new();
        assert!(set.add("KXA"));
        assert!(!set.add("KXA"));
        assert_eq!(set.ref_count("KXA"), 2);

        assert!(!set.remove("KXA"));
        assert!(set.contains("KXA"));
        assert!(set.remove("KXA"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut set = SubscriptionSet::new();
        assert!(!set.remove("KXZ"));
        assert!(!set.remove("KXZ"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_unsubscribe_then_subscribe_restores_state() {
        let mut set = SubscriptionSet::new();
        set.add("KXA");
        set.add("KXB");
        let before = set.clone();

        set.remove("KXA");
        set.add("KXA");
        assert_eq!(set, before);
        assert_eq!(set.markets(), vec!["KXA".to_string(), "KXB".to_string()]);
    }
}
