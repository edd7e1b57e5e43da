//! Block keys currently held by claimed tasks.

use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockSet {
    keys: HashSet<String>,
}

impl BlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// A task without a key is never blocked.
    pub fn is_blocked(&self, key: Option<&str>) -> bool {
        key.is_some_and(|k| self.keys.contains(k))
    }

    pub fn hold(&mut self, key: Option<&str>) {
        if let Some(k) = key {
            self.keys.insert(k.to_string());
        }
    }

    pub fn release(&mut self, key: Option<&str>) {
        if let Some(k) = key {
            self.keys.remove(k);
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}
