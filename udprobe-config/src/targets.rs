use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
};

use serde::{Deserialize, Serialize};

use crate::tags::{TagSet, Tags, SRC_HOSTNAME};

/// A single reflector to probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub tags: Tags,
}

impl TargetConfig {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port, tags: Tags::new() }
    }

    /// Adds a tag to the target.
    pub fn with_tag(mut self, tag: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(tag.into(), value.into());
        self
    }

    /// The socket address probes are sent to.
    #[inline]
    pub const fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// A named group of targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetSet(pub Vec<TargetConfig>);

impl TargetSet {
    /// Lists the target addresses, in configuration order.
    pub fn resolved_targets(&self) -> Vec<SocketAddr> {
        self.0.iter().map(TargetConfig::addr).collect()
    }

    /// Builds a [`TagSet`] keyed by target IP. See [`TargetSet::into_tag_set`].
    pub fn tag_set(&self, global_src_hostname: &str) -> TagSet {
        let mut ts = TagSet::new();
        self.into_tag_set(&mut ts, global_src_hostname);
        ts
    }

    /// Adds the tags of every target to `ts`, keyed by target IP. Existing keys in `ts` are kept.
    ///
    /// `src_hostname` resolves as: the target's own tag, else `global_src_hostname` (which may be
    /// empty).
    pub fn into_tag_set(&self, ts: &mut TagSet, global_src_hostname: &str) {
        for target in &self.0 {
            let key = target.ip.to_string();
            for (tag, value) in &target.tags {
                ts.set(key.clone(), tag.clone(), value.clone());
            }

            if !target.tags.contains_key(SRC_HOSTNAME) {
                ts.set(key, SRC_HOSTNAME, global_src_hostname);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// All named target sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetsConfig(pub HashMap<String, TargetSet>);

impl TargetsConfig {
    pub fn get(&self, name: &str) -> Option<&TargetSet> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, set: TargetSet) {
        self.0.insert(name.into(), set);
    }

    pub fn tag_set(&self, global_src_hostname: &str) -> TagSet {
        let mut ts = TagSet::new();
        self.into_tag_set(&mut ts, global_src_hostname);
        ts
    }

    pub fn into_tag_set(&self, ts: &mut TagSet, global_src_hostname: &str) {
        for set in self.0.values() {
            set.into_tag_set(ts, global_src_hostname);
        }
    }
}
