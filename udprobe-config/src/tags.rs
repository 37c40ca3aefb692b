use std::collections::HashMap;

/// Descriptive attributes attached to a target, e.g. `dst_hostname`.
pub type Tags = HashMap<String, String>;

/// The tag used to label the source (collector) side of a path.
pub const SRC_HOSTNAME: &str = "src_hostname";
/// The tag used to label the destination (reflector) side of a path.
pub const DST_HOSTNAME: &str = "dst_hostname";

/// A collection of [`Tags`], keyed by destination IP address string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    inner: HashMap<String, Tags>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `tag` to `value` for `key`, creating the entry if needed.
    pub fn set(&mut self, key: impl Into<String>, tag: impl Into<String>, value: impl Into<String>) {
        self.inner.entry(key.into()).or_default().insert(tag.into(), value.into());
    }

    /// Returns the tags for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Tags> {
        self.inner.get(key)
    }

    /// Returns the value of `tag` for `key`, or an empty string if either is missing.
    pub fn tag(&self, key: &str, tag: &str) -> &str {
        self.inner.get(key).and_then(|tags| tags.get(tag)).map_or("", String::as_str)
    }

    /// Returns `true` if there are tags for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Merges `other` into this set. Tags present in `other` win; keys and tags only present
    /// here are kept.
    ///
    /// Reloads rely on this: results still in flight from a previous configuration keep their
    /// labels after the target disappears from the new one.
    pub fn merge(&mut self, other: Self) {
        for (key, tags) in other.inner {
            self.inner.entry(key).or_default().extend(tags);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tags)> {
        self.inner.iter()
    }
}

impl FromIterator<(String, Tags)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (String, Tags)>>(iter: I) -> Self {
        Self { inner: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_creates_entries() {
        let mut ts = TagSet::new();
        ts.set("1.2.3.4", DST_HOSTNAME, "localhost");

        assert_eq!(ts.tag("1.2.3.4", DST_HOSTNAME), "localhost");
        assert_eq!(ts.tag("1.2.3.4", SRC_HOSTNAME), "");
        assert_eq!(ts.tag("5.6.7.8", DST_HOSTNAME), "");
        assert!(ts.get("5.6.7.8").is_none());
    }

    #[test]
    fn merge_keeps_old_keys() {
        let mut current = TagSet::new();
        current.set("1.1.1.1", DST_HOSTNAME, "old");
        current.set("2.2.2.2", DST_HOSTNAME, "gone");

        let mut update = TagSet::new();
        update.set("1.1.1.1", DST_HOSTNAME, "new");
        update.set("3.3.3.3", DST_HOSTNAME, "added");

        current.merge(update);

        assert_eq!(current.len(), 3);
        assert_eq!(current.tag("1.1.1.1", DST_HOSTNAME), "new");
        assert_eq!(current.tag("2.2.2.2", DST_HOSTNAME), "gone");
        assert_eq!(current.tag("3.3.3.3", DST_HOSTNAME), "added");
    }
}
