//! Domain tree node.
//!
//! The cookie index is a trie keyed by reversed domain labels: the cookies of
//! `.a.b.com` live in the node reached by `com → b → a`. Host-only and IP
//! cookies are not split; their whole host is one [`NodeKey::Host`] child of the
//! protocol root.
//!
//! Each node owns the cookies whose domain is exactly that node's domain
//! (unique by `(name, path)`) and its children. It also tracks the index of its
//! least recently accessed cookie so the per-host limit can evict in O(1)
//! amortized time.
//!
//! Nodes are not synchronized. The manager is their only owner and mutator.

use std::collections::HashMap;

use crate::cookies::cookie::{Cookie, CookieFilter};

/// Key of a child node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
    /// One domain label, e.g. `b` in `.a.b.com`.
    Label(String),
    /// A whole host for host-only or IP cookies, e.g. `a.b.com`.
    Host(String),
}

/// Result of [`CookieNode::add_or_replace`].
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// New `(name, path)` pair
    Added,
    /// An existing cookie with the same `(name, path)` was replaced
    Replaced(Cookie),
    /// The existing cookie is `HttpOnly` and the caller may not touch it
    Rejected,
}

#[derive(Debug, Default)]
pub struct CookieNode {
    cookies: Vec<Cookie>,
    children: HashMap<NodeKey, CookieNode>,
    /// Index into `cookies` of the least recently accessed cookie.
    oldest: Option<usize>,
}

impl CookieNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cookies held directly by this node.
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Cookies held directly by this node, in insertion order.
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn oldest_cookie(&self) -> Option<&Cookie> {
        self.oldest.map(|idx| &self.cookies[idx])
    }

    pub fn child(&self, key: &NodeKey) -> Option<&CookieNode> {
        self.children.get(key)
    }

    pub fn child_mut(&mut self, key: &NodeKey) -> Option<&mut CookieNode> {
        self.children.get_mut(key)
    }

    pub fn child_or_insert(&mut self, key: NodeKey) -> &mut CookieNode {
        self.children.entry(key).or_default()
    }

    pub fn children(&self) -> impl Iterator<Item = (&NodeKey, &CookieNode)> {
        self.children.iter()
    }

    fn position(&self, cookie: &Cookie) -> Option<usize> {
        self.cookies.iter().position(|c| c.same_key(cookie))
    }

    /// Adds `cookie`, replacing the cookie with the same `(name, path)` if any.
    ///
    /// A replacement keeps the creation time of the cookie it replaces, so
    /// request ordering is stable across updates.
    pub fn add_or_replace(&mut self, mut cookie: Cookie, filter: CookieFilter) -> AddOutcome {
        let Some(idx) = self.position(&cookie) else {
            self.cookies.push(cookie);
            let idx = self.cookies.len() - 1;
            self.consider_oldest(idx);
            return AddOutcome::Added;
        };

        if self.cookies[idx].http_only && !filter.allows_http_only() {
            return AddOutcome::Rejected;
        }

        cookie.creation_time = self.cookies[idx].creation_time;
        let old = std::mem::replace(&mut self.cookies[idx], cookie);

        if self.oldest == Some(idx) {
            self.recompute_oldest();
        } else {
            self.consider_oldest(idx);
        }

        AddOutcome::Replaced(old)
    }

    /// Removes the cookie with the same `(name, path)` as `cookie`.
    pub fn remove(&mut self, cookie: &Cookie, filter: CookieFilter) -> Option<Cookie> {
        let idx = self.position(cookie)?;

        if self.cookies[idx].http_only && !filter.allows_http_only() {
            return None;
        }

        Some(self.remove_at(idx))
    }

    /// Drops expired cookies from this node and returns how many went.
    ///
    /// Nothing is reported to the backing store: the durable copy stays until
    /// the next full reload. Session cookies never expire, so every dropped
    /// cookie was a persistent one.
    pub fn remove_expired(&mut self, now: i64) -> usize {
        let before = self.cookies.len();
        self.cookies.retain(|c| !c.has_expired(now));

        let dropped = before - self.cookies.len();
        if dropped > 0 {
            self.recompute_oldest();
        }
        dropped
    }

    /// Returns the live cookies of this node, dropping expired ones on the way.
    pub fn get_all_cookies(&mut self, now: i64) -> Vec<Cookie> {
        self.remove_expired(now);
        self.cookies.clone()
    }

    /// Like [`get_all_cookies`](Self::get_all_cookies) for this node and every
    /// node below it. Returns the number of expired cookies dropped.
    pub fn collect_all_cookies(&mut self, now: i64, out: &mut Vec<Cookie>) -> usize {
        let mut dropped = self.remove_expired(now);
        out.extend(self.cookies.iter().cloned());
        for child in self.children.values_mut() {
            dropped += child.collect_all_cookies(now, out);
        }
        dropped
    }

    /// Evicts the least recently accessed cookie.
    ///
    /// A node with no cookies of its own delegates to its children, in map order,
    /// and returns the first cookie one of them evicts.
    pub fn remove_oldest_cookie(&mut self) -> Option<Cookie> {
        match self.oldest {
            Some(idx) => Some(self.remove_at(idx)),
            None => self
                .children
                .values_mut()
                .find_map(|child| child.remove_oldest_cookie()),
        }
    }

    /// Records a read access of the cookie `(name, path)` at `now`.
    pub fn touch(&mut self, name: &str, path: &str, now: i64) {
        let Some(idx) = self
            .cookies
            .iter()
            .position(|c| c.name == name && c.path == path)
        else {
            return;
        };

        self.cookies[idx].last_accessed = now;
        if self.oldest == Some(idx) {
            self.recompute_oldest();
        }
    }

    /// Drops every cookie and child node.
    pub fn clear(&mut self) {
        self.cookies.clear();
        self.children.clear();
        self.oldest = None;
    }

    fn remove_at(&mut self, idx: usize) -> Cookie {
        let removed = self.cookies.remove(idx);

        match self.oldest {
            Some(oldest) if oldest == idx => self.recompute_oldest(),
            Some(oldest) if oldest > idx => self.oldest = Some(oldest - 1),
            _ => {}
        }

        removed
    }

    fn consider_oldest(&mut self, idx: usize) {
        let candidate = self.cookies[idx].last_accessed;
        match self.oldest {
            Some(oldest) if self.cookies[oldest].last_accessed <= candidate => {}
            _ => self.oldest = Some(idx),
        }
    }

    fn recompute_oldest(&mut self) {
        self.oldest = self
            .cookies
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.last_accessed)
            .map(|(idx, _)| idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str, path: &str, accessed: i64) -> Cookie {
        let mut c = Cookie::new(name, "v", ".example.com", path, "http", accessed);
        c.last_accessed = accessed;
        c
    }

    #[test]
    fn replace_matches_name_and_path() {
        let mut node = CookieNode::new();
        assert_eq!(node.add_or_replace(cookie("n1", "/", 1), CookieFilter::default()), AddOutcome::Added);
        assert_eq!(node.add_or_replace(cookie("n1", "/sub", 2), CookieFilter::default()), AddOutcome::Added);
        assert_eq!(node.len(), 2);

        let mut update = cookie("n1", "/", 3);
        update.value = "new".into();
        match node.add_or_replace(update, CookieFilter::default()) {
            AddOutcome::Replaced(old) => assert_eq!(old.path, "/"),
            other => panic!("expected replace, got {:?}", other),
        }

        assert_eq!(node.len(), 2);
        let values: Vec<_> = node.cookies().iter().map(|c| (c.path.as_str(), c.value.as_str())).collect();
        assert_eq!(values, [("/", "new"), ("/sub", "v")]);
    }

    #[test]
    fn replace_keeps_creation_time() {
        let mut node = CookieNode::new();
        node.add_or_replace(cookie("a", "/", 10), CookieFilter::default());
        node.add_or_replace(cookie("a", "/", 20), CookieFilter::default());
        assert_eq!(node.cookies()[0].creation_time, 10);
        assert_eq!(node.cookies()[0].last_accessed, 20);
    }

    #[test]
    fn script_filter_cannot_clobber_http_only() {
        let mut node = CookieNode::new();
        let mut protected = cookie("s", "/", 1);
        protected.http_only = true;
        node.add_or_replace(protected, CookieFilter::WithHttpOnlyCookies);

        assert_eq!(
            node.add_or_replace(cookie("s", "/", 2), CookieFilter::NoHttpOnlyCookie),
            AddOutcome::Rejected
        );
        assert!(node.remove(&cookie("s", "/", 2), CookieFilter::NoHttpOnlyCookie).is_none());
        assert!(node.cookies()[0].http_only);

        assert!(node.remove(&cookie("s", "/", 2), CookieFilter::WithHttpOnlyCookies).is_some());
        assert!(node.is_empty());
    }

    #[test]
    fn oldest_tracks_last_accessed() {
        let mut node = CookieNode::new();
        node.add_or_replace(cookie("a", "/", 30), CookieFilter::default());
        node.add_or_replace(cookie("b", "/", 10), CookieFilter::default());
        node.add_or_replace(cookie("c", "/", 20), CookieFilter::default());
        assert_eq!(node.oldest_cookie().unwrap().name, "b");

        let evicted = node.remove_oldest_cookie().unwrap();
        assert_eq!(evicted.name, "b");
        assert_eq!(node.oldest_cookie().unwrap().name, "c");
    }

    #[test]
    fn removing_before_oldest_keeps_tracking_right_cookie() {
        let mut node = CookieNode::new();
        node.add_or_replace(cookie("a", "/", 30), CookieFilter::default());
        node.add_or_replace(cookie("b", "/", 10), CookieFilter::default());
        node.remove(&cookie("a", "/", 0), CookieFilter::default());
        assert_eq!(node.oldest_cookie().unwrap().name, "b");
    }

    #[test]
    fn touch_moves_cookie_out_of_oldest_slot() {
        let mut node = CookieNode::new();
        node.add_or_replace(cookie("a", "/", 10), CookieFilter::default());
        node.add_or_replace(cookie("b", "/", 20), CookieFilter::default());

        node.touch("a", "/", 30);
        assert_eq!(node.oldest_cookie().unwrap().name, "b");
    }

    #[test]
    fn get_all_cookies_drops_expired() {
        let mut node = CookieNode::new();
        let mut expired = cookie("gone", "/", 1);
        expired.expiry = Some(50);
        node.add_or_replace(expired, CookieFilter::default());
        node.add_or_replace(cookie("kept", "/", 2), CookieFilter::default());

        let live = node.get_all_cookies(100);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].name, "kept");
        assert_eq!(node.len(), 1);
        assert_eq!(node.oldest_cookie().unwrap().name, "kept");
    }

    #[test]
    fn remove_expired_counts_dropped_cookies() {
        let mut node = CookieNode::new();
        for (name, expiry) in [("a", 10), ("b", 20), ("c", 500)] {
            let mut c = cookie(name, "/", 1);
            c.expiry = Some(expiry);
            node.add_or_replace(c, CookieFilter::default());
        }
        node.add_or_replace(cookie("session", "/", 1), CookieFilter::default());

        assert_eq!(node.remove_expired(100), 2);
        assert_eq!(node.remove_expired(100), 0);
        assert_eq!(node.len(), 2);

        let mut root = CookieNode::new();
        let mut c = cookie("deep", "/", 1);
        c.expiry = Some(10);
        root.child_or_insert(NodeKey::Label("com".into()))
            .add_or_replace(c, CookieFilter::default());
        let mut all = Vec::new();
        assert_eq!(root.collect_all_cookies(100, &mut all), 1);
        assert!(all.is_empty());
    }

    #[test]
    fn remove_oldest_descends_into_children() {
        let mut root = CookieNode::new();
        root.child_or_insert(NodeKey::Label("com".into()))
            .child_or_insert(NodeKey::Label("example".into()))
            .add_or_replace(cookie("deep", "/", 5), CookieFilter::default());

        let evicted = root.remove_oldest_cookie().unwrap();
        assert_eq!(evicted.name, "deep");
        assert!(root.remove_oldest_cookie().is_none());
    }

    #[test]
    fn collect_all_walks_subtree() {
        let mut root = CookieNode::new();
        root.add_or_replace(cookie("root", "/", 1), CookieFilter::default());
        root.child_or_insert(NodeKey::Host("a.com".into()))
            .add_or_replace(cookie("host", "/", 1), CookieFilter::default());
        root.child_or_insert(NodeKey::Label("com".into()))
            .add_or_replace(cookie("label", "/", 1), CookieFilter::default());

        let mut all = Vec::new();
        root.collect_all_cookies(0, &mut all);
        let mut names: Vec<_> = all.iter().map(|c| c.name.clone()).collect();
        names.sort();
        assert_eq!(names, ["host", "label", "root"]);
    }
}
