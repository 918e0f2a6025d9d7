//! Cookie manager: the facade and policy engine.
//!
//! The manager owns one domain tree per (aliased) URL scheme, routes every
//! parsed cookie through [`CookieManager::check_and_treat_cookie`], enforces the
//! per-host and global cookie limits and keeps the backing store informed.
//!
//! - `https` shares the `http` tree and `wss` shares the `ws` tree; WebSocket
//!   lookups also read the `http` tree.
//! - The first access after startup synchronously loads the database, so reads
//!   and writes always see cookies persisted by a previous run.
//! - The per-host limit evicts the node's least recently accessed cookie right
//!   away. The global limit only schedules a deferred cleanup, run from
//!   [`CookieManager::tick`].
//! - Private mode discards the in-memory trees and neither reads nor writes the
//!   database until it is switched off again.
//!
//! The manager is single-threaded: the HTTP layer owns it (for instance behind
//! a `Mutex` or on its network task) and calls it directly. With a database
//! configured, the first access, `flush` and the deferred cleanup block on the
//! store worker; from async code run them through `spawn_blocking`. Dropping
//! the manager is fine anywhere.
//!
//! ```rust
//! use gosub_cookies::{CookieConfig, CookieManager};
//! use gosub_cookies::cookies::CookieFilter;
//! use url::Url;
//!
//! let mut manager = CookieManager::new(CookieConfig::default());
//! let url = Url::parse("http://a.b.com/x/y").unwrap();
//! manager.set_cookies(&url, "id=1; Domain=b.com; Path=/x", CookieFilter::WithHttpOnlyCookies);
//!
//! let next = Url::parse("http://a.b.com/x/y/z").unwrap();
//! assert_eq!(manager.get_cookie(&next, CookieFilter::WithHttpOnlyCookies), "id=1");
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use http::HeaderMap;
use log::{debug, info, warn};
use url::Url;

use crate::clock::{ClockHandle, SystemClock};
use crate::config::{CookieConfig, CookiePolicy};
use crate::cookies::cookie::{canonical_ip, Cookie, CookieFilter, CookieRecord};
use crate::cookies::node::{AddOutcome, CookieNode, NodeKey};
use crate::cookies::parser::CookieParser;
use crate::cookies::scheduler::DeferredTask;
use crate::cookies::store::CookieBackingStore;

/// How a cookie mutation relates to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingStorePolicy {
    /// A cookie from the network: mirror every change to the store.
    Write,
    /// A cookie read from the store: it is already persisted, but delete it
    /// there if it turns out to be expired.
    ExistingEntry,
    /// Never touch the store (private mode).
    Skip,
}

/// `true` when `request_path` is within `cookie_path`.
pub fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }

    let mut request = request_path.to_string();
    if !request.ends_with('/') {
        request.push('/');
    }

    if cookie_path.ends_with('/') {
        request.starts_with(cookie_path)
    } else {
        request.starts_with(&format!("{}/", cookie_path))
    }
}

pub fn is_connection_secure(scheme: &str) -> bool {
    matches!(scheme, "https" | "wss")
}

/// Sorts cookies the way a `Cookie:` header lists them: longer paths first,
/// then earlier creation time.
pub fn sort_for_request(cookies: &mut [Cookie]) {
    cookies.sort_by(|a, b| {
        b.path
            .len()
            .cmp(&a.path.len())
            .then(a.creation_time.cmp(&b.creation_time))
    });
}

/// Tree position of a cookie below its protocol root.
fn node_keys(cookie: &Cookie) -> Vec<NodeKey> {
    if cookie.domain.is_empty() {
        return Vec::new();
    }

    if cookie.domain_is_ip || cookie.is_host_only() {
        return vec![NodeKey::Host(cookie.domain.clone())];
    }

    cookie
        .domain
        .trim_start_matches('.')
        .split('.')
        .rev()
        .map(|label| NodeKey::Label(label.to_string()))
        .collect()
}

fn walk_mut<'a>(mut node: &'a mut CookieNode, keys: &[NodeKey]) -> Option<&'a mut CookieNode> {
    for key in keys {
        node = node.child_mut(key)?;
    }
    Some(node)
}

fn walk_or_create<'a>(mut node: &'a mut CookieNode, keys: Vec<NodeKey>) -> &'a mut CookieNode {
    for key in keys {
        node = node.child_or_insert(key);
    }
    node
}

/// What a lookup is matching against.
struct RequestContext<'a> {
    path: &'a str,
    secure: bool,
    filter: CookieFilter,
    now: i64,
}

impl RequestContext<'_> {
    fn accepts(&self, cookie: &Cookie) -> bool {
        path_matches(&cookie.path, self.path)
            && (!cookie.secure || self.secure)
            && (!cookie.http_only || self.filter.allows_http_only())
    }

    /// Collects the matching cookies of `node`, marking them accessed.
    ///
    /// Returns the number of expired cookies dropped from the node.
    fn collect(&self, node: &mut CookieNode, out: &mut Vec<Cookie>) -> usize {
        let expired = node.remove_expired(self.now);
        for mut cookie in node.get_all_cookies(self.now) {
            if self.accepts(&cookie) {
                node.touch(&cookie.name, &cookie.path, self.now);
                cookie.last_accessed = self.now;
                out.push(cookie);
            }
        }
        expired
    }
}

pub struct CookieManager {
    config: CookieConfig,
    clock: ClockHandle,
    /// Domain trees by aliased scheme
    trees: HashMap<String, CookieNode>,
    /// Non-session cookies across all trees
    persistent_count: usize,
    store: Option<CookieBackingStore>,
    /// Whether the database has been loaded since startup (or since private
    /// mode was last left)
    loaded: bool,
    private_mode: bool,
    policy: CookiePolicy,
    cleanup: DeferredTask,
}

impl std::fmt::Debug for CookieManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieManager")
            .field("trees", &self.trees.keys().collect::<Vec<_>>())
            .field("persistent_count", &self.persistent_count)
            .field("store", &self.store)
            .field("private_mode", &self.private_mode)
            .finish_non_exhaustive()
    }
}

impl CookieManager {
    /// Creates a manager reading wall-clock time.
    pub fn new(config: CookieConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a manager with an explicit time source.
    ///
    /// When `config.database_path` is set, the backing-store worker is started
    /// right away; the database itself is opened on first access.
    pub fn with_clock(config: CookieConfig, clock: ClockHandle) -> Self {
        let store = match &config.database_path {
            Some(_) => match CookieBackingStore::spawn(config.flush_delay) {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!("Cookies will not be persisted: {}", e);
                    None
                }
            },
            None => None,
        };

        Self {
            cleanup: DeferredTask::new(config.cleanup_delay),
            private_mode: config.private_mode,
            policy: config.policy,
            clock,
            trees: HashMap::new(),
            persistent_count: 0,
            store,
            loaded: false,
            config,
        }
    }

    pub fn config(&self) -> &CookieConfig {
        &self.config
    }

    pub fn policy(&self) -> CookiePolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: CookiePolicy) {
        self.policy = policy;
    }

    pub fn backing_store(&self) -> Option<&CookieBackingStore> {
        self.store.as_ref()
    }

    /// Number of non-session cookies held in memory.
    pub fn cookie_count(&self) -> usize {
        self.persistent_count
    }

    pub fn is_private_mode(&self) -> bool {
        self.private_mode
    }

    fn network_policy(&self) -> BackingStorePolicy {
        if self.private_mode {
            BackingStorePolicy::Skip
        } else {
            BackingStorePolicy::Write
        }
    }

    /// Tree a scheme's cookies live in, or `None` for unsupported schemes.
    fn tree_key(&self, scheme: &str) -> Option<String> {
        match scheme {
            "http" | "https" => Some("http".to_string()),
            "ws" | "wss" => Some("ws".to_string()),
            "file" | "local" if !self.config.support_local_cookies => None,
            other => Some(other.to_string()),
        }
    }

    /// Loads the database on the first access since startup.
    fn ensure_loaded(&mut self) {
        if self.loaded || self.private_mode {
            return;
        }
        self.loaded = true;

        let (Some(store), Some(path)) = (&self.store, &self.config.database_path) else {
            return;
        };

        let cookies = store.open_and_load_synchronously(path.clone());
        info!("Restoring {} persisted cookies", cookies.len());

        for cookie in cookies {
            self.check_and_treat_cookie(
                cookie,
                BackingStorePolicy::ExistingEntry,
                CookieFilter::WithHttpOnlyCookies,
            );
        }
    }

    /// Parses `header` as received from `url` and stores the result.
    pub fn set_cookies(&mut self, url: &Url, header: &str, filter: CookieFilter) {
        self.ensure_loaded();
        self.tick();

        let parser = CookieParser::new(url, self.clock.now_millis());
        let policy = self.network_policy();
        for cookie in parser.parse(header) {
            self.check_and_treat_cookie(cookie, policy, filter);
        }
    }

    /// Like [`set_cookies`](Self::set_cookies) for a list of header values.
    pub fn set_cookies_from_list<S: AsRef<str>>(&mut self, url: &Url, headers: &[S], filter: CookieFilter) {
        self.ensure_loaded();
        self.tick();

        let parser = CookieParser::new(url, self.clock.now_millis());
        let policy = self.network_policy();
        for cookie in parser.parse_all(headers) {
            self.check_and_treat_cookie(cookie, policy, filter);
        }
    }

    /// Stores every `Set-Cookie` header of a response to `url`.
    pub fn set_cookies_from_headers(&mut self, url: &Url, headers: &HeaderMap) {
        let values: Vec<&str> = headers
            .get_all(http::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();

        self.set_cookies_from_list(url, &values, CookieFilter::WithHttpOnlyCookies);
    }

    /// Inserts, replaces or removes `candidate` in its domain tree.
    ///
    /// Returns `true` when the tree changed.
    pub fn check_and_treat_cookie(
        &mut self,
        candidate: Cookie,
        policy: BackingStorePolicy,
        filter: CookieFilter,
    ) -> bool {
        let now = self.clock.now_millis();

        let Some(tree_key) = self.tree_key(&candidate.protocol) else {
            debug!("Dropping cookie '{}' for unsupported scheme {}", candidate.name, candidate.protocol);
            return false;
        };

        if candidate.is_dead(now) {
            if policy == BackingStorePolicy::ExistingEntry {
                // Expired while stored; it never enters the tree.
                if let Some(store) = &self.store {
                    store.remove(&candidate);
                }
                return false;
            }
            return self.remove_from_tree(&tree_key, &candidate, policy, filter);
        }

        let max_per_host = self.config.max_cookies_per_host;
        let keys = node_keys(&candidate);
        let is_session = candidate.is_session();

        let (outcome, stored, evicted) = {
            let root = self.trees.entry(tree_key).or_default();
            let node = walk_or_create(root, keys);

            let outcome = node.add_or_replace(candidate.clone(), filter);
            let stored = node
                .cookies()
                .iter()
                .find(|c| c.same_key(&candidate))
                .cloned()
                .unwrap_or(candidate);

            let evicted = if matches!(outcome, AddOutcome::Added) && node.len() > max_per_host {
                node.remove_oldest_cookie()
            } else {
                None
            };

            (outcome, stored, evicted)
        };

        let writer = Self::writer(&self.store, policy, self.private_mode);

        match outcome {
            AddOutcome::Rejected => {
                debug!("Refusing to overwrite HttpOnly cookie '{}'", stored.name);
                return false;
            }
            AddOutcome::Added => {
                if !is_session {
                    self.persistent_count += 1;
                    if let Some(store) = writer {
                        store.insert(&stored);
                    }
                }
            }
            AddOutcome::Replaced(old) => match (old.is_session(), is_session) {
                (false, false) => {
                    if let Some(store) = writer {
                        store.update(&stored);
                    }
                }
                (false, true) => {
                    self.persistent_count = self.persistent_count.saturating_sub(1);
                    if let Some(store) = writer {
                        store.remove(&old);
                    }
                }
                (true, false) => {
                    self.persistent_count += 1;
                    if let Some(store) = writer {
                        store.insert(&stored);
                    }
                }
                (true, true) => {}
            },
        }

        if let Some(evicted) = evicted {
            debug!("Per-host limit reached, evicting '{}' of {}", evicted.name, evicted.domain);
            if !evicted.is_session() {
                self.persistent_count = self.persistent_count.saturating_sub(1);
                if policy != BackingStorePolicy::Skip && !self.private_mode {
                    if let Some(store) = &self.store {
                        store.remove(&evicted);
                    }
                }
            }
        }

        if policy == BackingStorePolicy::Write
            && self.persistent_count > self.config.max_cookies_global
            && self.cleanup.arm()
        {
            info!(
                "Global cookie limit exceeded ({} > {}), scheduling cleanup",
                self.persistent_count, self.config.max_cookies_global
            );
        }

        true
    }

    /// The store to mirror a change to, if `policy` allows writing.
    ///
    /// Takes the store field rather than `&self` so callers can keep updating
    /// the cookie count while holding the result.
    fn writer(
        store: &Option<CookieBackingStore>,
        policy: BackingStorePolicy,
        private_mode: bool,
    ) -> Option<&CookieBackingStore> {
        if policy == BackingStorePolicy::Write && !private_mode {
            store.as_ref()
        } else {
            None
        }
    }

    fn remove_from_tree(
        &mut self,
        tree_key: &str,
        candidate: &Cookie,
        policy: BackingStorePolicy,
        filter: CookieFilter,
    ) -> bool {
        let keys = node_keys(candidate);
        let removed = self
            .trees
            .get_mut(tree_key)
            .and_then(|root| walk_mut(root, &keys))
            .and_then(|node| node.remove(candidate, filter));

        let Some(removed) = removed else {
            return false;
        };

        if !removed.is_session() {
            self.persistent_count = self.persistent_count.saturating_sub(1);
            if let Some(store) = Self::writer(&self.store, policy, self.private_mode) {
                store.remove(&removed);
            }
        }

        true
    }

    /// Cookies applicable to a request for `url`, in request order.
    ///
    /// Every returned cookie is marked as accessed now.
    pub fn get_raw_cookies(&mut self, url: &Url, filter: CookieFilter) -> Vec<Cookie> {
        self.ensure_loaded();
        self.tick();

        let scheme = url.scheme();
        let Some(tree_key) = self.tree_key(scheme) else {
            return Vec::new();
        };

        let mut tree_keys = vec![tree_key];
        if matches!(scheme, "ws" | "wss") {
            tree_keys.push("http".to_string());
        }

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let ip = canonical_ip(&host);
        let ctx = RequestContext {
            path: url.path(),
            secure: is_connection_secure(scheme),
            filter,
            now: self.clock.now_millis(),
        };

        let mut out = Vec::new();
        let mut expired = 0;
        for key in &tree_keys {
            let Some(root) = self.trees.get_mut(key) else {
                continue;
            };

            expired += ctx.collect(root, &mut out);

            if host.is_empty() {
                continue;
            }

            let exact = NodeKey::Host(ip.clone().unwrap_or_else(|| host.clone()));
            if let Some(node) = root.child_mut(&exact) {
                expired += ctx.collect(node, &mut out);
            }

            if ip.is_some() {
                continue;
            }

            let labels: Vec<NodeKey> = host
                .split('.')
                .rev()
                .map(|label| NodeKey::Label(label.to_string()))
                .collect();

            for depth in (1..=labels.len()).rev() {
                if let Some(node) = walk_mut(root, &labels[..depth]) {
                    expired += ctx.collect(node, &mut out);
                }
            }
        }

        self.forget_expired(expired);
        sort_for_request(&mut out);
        out
    }

    /// The `Cookie` request header value for `url` (empty when nothing matches).
    pub fn get_cookie(&mut self, url: &Url, filter: CookieFilter) -> String {
        self.get_raw_cookies(url, filter)
            .iter()
            .map(Cookie::to_name_value)
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Structured view of the cookies applicable to `url`.
    pub fn get_cookie_records(&mut self, url: &Url, filter: CookieFilter) -> Vec<CookieRecord> {
        self.get_raw_cookies(url, filter)
            .iter()
            .map(CookieRecord::from)
            .collect()
    }

    /// Every live cookie in every tree.
    pub fn all_cookies(&mut self) -> Vec<Cookie> {
        self.ensure_loaded();

        let now = self.clock.now_millis();
        let mut out = Vec::new();
        let mut expired = 0;
        for root in self.trees.values_mut() {
            expired += root.collect_all_cookies(now, &mut out);
        }

        self.forget_expired(expired);
        out
    }

    /// Accounts for persistent cookies that expired in memory. Their rows stay
    /// in the store until the next load.
    fn forget_expired(&mut self, expired: usize) {
        if expired > 0 {
            debug!("Dropped {} expired cookies", expired);
            self.persistent_count = self.persistent_count.saturating_sub(expired);
        }
    }

    /// Removes every cookie named `name` that a request to `url` would carry.
    pub fn remove_cookie_with_name(&mut self, url: &Url, name: &str) {
        let policy = self.network_policy();
        let victims: Vec<Cookie> = self
            .get_raw_cookies(url, CookieFilter::WithHttpOnlyCookies)
            .into_iter()
            .filter(|c| c.name == name)
            .collect();

        for mut cookie in victims {
            cookie.force_expired = true;
            self.check_and_treat_cookie(cookie, policy, CookieFilter::WithHttpOnlyCookies);
        }
    }

    fn clear_trees(&mut self) {
        self.trees.clear();
        self.persistent_count = 0;
        self.cleanup.disarm();
    }

    /// Drops every cookie from memory and, outside private mode, from disk.
    pub fn remove_all_cookies(&mut self) {
        self.clear_trees();

        if !self.private_mode {
            if let Some(store) = &self.store {
                store.remove_all();
            }
        }
    }

    /// Switches private mode. Memory is discarded either way; leaving private
    /// mode reloads the database.
    pub fn set_private_mode(&mut self, enabled: bool) {
        if self.private_mode == enabled {
            return;
        }

        info!("Cookie private mode {}", if enabled { "on" } else { "off" });
        self.private_mode = enabled;
        self.clear_trees();

        if !enabled {
            self.loaded = false;
            self.ensure_loaded();
        }
    }

    /// Runs the deferred cleanup if it is due.
    ///
    /// Setting and reading cookies polls this too; hosts with an event loop
    /// can call it from there so a due cleanup does not wait for traffic.
    pub fn tick(&mut self) {
        if self.cleanup.take_due() {
            self.run_deferred_cleanup();
        }
    }

    /// Reclaims the least recently accessed persistent cookies until the global
    /// limit holds again, plus one cleanup batch.
    pub fn run_deferred_cleanup(&mut self) {
        self.cleanup.disarm();

        let overage = self
            .persistent_count
            .saturating_sub(self.config.max_cookies_global);
        if overage == 0 || self.private_mode {
            return;
        }

        let Some(store) = &self.store else {
            return;
        };

        let victims = store.get_cookies(self.config.cleanup_batch_size + overage);
        info!("Reclaiming {} cookies", victims.len());
        let reclaimed_any = !victims.is_empty();

        for mut cookie in victims {
            cookie.force_expired = true;
            if !self.check_and_treat_cookie(
                cookie.clone(),
                BackingStorePolicy::Write,
                CookieFilter::WithHttpOnlyCookies,
            ) {
                // Stored but no longer in memory; drop the row directly.
                if let Some(store) = &self.store {
                    store.remove(&cookie);
                }
            }
        }

        // Stale rows used up part of the batch; go again on the next tick.
        if reclaimed_any && self.persistent_count > self.config.max_cookies_global {
            self.cleanup.arm();
        }
    }

    /// Writes every pending change to disk and waits for it.
    pub fn flush(&self) {
        if let Some(store) = &self.store {
            store.flush_synchronously();
        }
    }

    /// Final flush; stops the backing-store worker. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(mut store) = self.store.take() {
            store.shutdown();
        }
    }
}
