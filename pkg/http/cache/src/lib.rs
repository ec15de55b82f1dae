#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::header::Headers;
use http::status_code::StatusCode;

/// In-memory response cache keyed by caller-supplied fingerprints, with
/// `Vary`-aware variants and a one-writer/many-waiters update protocol.
///
/// A variant's lifecycle: Spawning (first fetch in flight), Active
/// (fresh), Stale (TTL passed, still deliverable until the shadow TTL
/// passes), Updating (stale with a refresh in flight).
pub struct Cache {
    config: CacheConfig,
    objects: Mutex<HashMap<String, Arc<Mutex<Object>>>>,

    hits: AtomicU64,
    shadow_hits: AtomicU64,
    misses: AtomicU64,
    purges: AtomicU64,
    expiries: AtomicU64,
}

#[derive(Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Whether waiters block on an in-flight update; when false, stale
    /// payloads are served immediately instead.
    pub lock_on_update: bool,
    pub update_lock_timeout: Duration,
    pub default_ttl: Duration,
    pub default_shadow_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_on_update: false,
            update_lock_timeout: Duration::from_secs(10),
            default_ttl: Duration::from_secs(60),
            default_shadow_ttl: Duration::from_secs(600),
        }
    }
}

/// One cached payload.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectState {
    Spawning,
    Active,
    Stale,
    Updating,
}

pub type Waiter = Box<dyn FnOnce(&CachedResponse) + Send>;

/// The decision for one lookup.
pub enum Delivery {
    /// Served fresh from cache; the callback ran.
    Hit,
    /// Served a stale payload; the callback ran.
    Shadow,
    /// Nothing usable; the caller is now the sole updater and must call
    /// `complete` or `fail`.
    Miss,
    /// An update is in flight; the callback was queued behind it.
    Queued,
}

/// Cache entry for one key: the group of concrete variants
/// distinguished by their recorded `Vary` request-header values.
pub struct Object {
    variants: Vec<ConcreteObject>,
}

struct ConcreteObject {
    state: ObjectState,
    ctime: Instant,
    update_started: Instant,
    ttl: Duration,
    shadow_ttl: Duration,
    response: Option<CachedResponse>,
    /// `(header name, request value)` pairs from the response's Vary.
    varying_headers: Vec<(String, String)>,
    hits: u64,
    waiters: Vec<Waiter>,
}

impl ConcreteObject {
    fn new(ttl: Duration, shadow_ttl: Duration) -> Self {
        Self {
            state: ObjectState::Spawning,
            ctime: Instant::now(),
            update_started: Instant::now(),
            ttl,
            shadow_ttl,
            response: None,
            varying_headers: vec![],
            hits: 0,
            waiters: vec![],
        }
    }

    /// Applies lazy TTL transitions.
    fn refresh(&mut self) {
        if self.state == ObjectState::Active && self.ctime.elapsed() > self.ttl {
            self.state = ObjectState::Stale;
        }
    }

    fn shadow_expired(&self) -> bool {
        self.state == ObjectState::Stale && self.ctime.elapsed() > self.ttl + self.shadow_ttl
    }

    /// True when this variant serves requests carrying `headers`.
    fn matches(&self, headers: &Headers) -> bool {
        self.varying_headers
            .iter()
            .all(|(name, value)| headers.get(name).unwrap_or("") == value)
    }
}

impl Object {
    fn new() -> Self {
        Self { variants: vec![] }
    }

    /// Selects the concrete variant for the request's header values.
    fn select_mut(&mut self, headers: &Headers) -> Option<&mut ConcreteObject> {
        self.variants.iter_mut().find(|v| v.matches(headers))
    }

    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    pub fn total_hits(&self) -> u64 {
        self.variants.iter().map(|v| v.hits).sum()
    }

    /// Flags every variant stale; payloads stay deliverable as shadows.
    pub fn expire(&mut self) {
        for variant in &mut self.variants {
            if variant.state == ObjectState::Active {
                variant.state = ObjectState::Stale;
            }
        }
    }
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            objects: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            shadow_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            purges: AtomicU64::new(0),
            expiries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Looks up a cache object for read access; the callback sees None
    /// when the key is unknown. Returns whether the key was present.
    pub fn find(&self, key: &str, callback: impl FnOnce(Option<&mut Object>)) -> bool {
        let entry = {
            let objects = self.objects.lock().unwrap();
            objects.get(key).cloned()
        };
        match entry {
            Some(object) => {
                callback(Some(&mut object.lock().unwrap()));
                true
            }
            None => {
                callback(None);
                false
            }
        }
    }

    /// Looks up (or creates) a cache object for read/write access; the
    /// callback learns whether the object was just created. Returns
    /// whether the key existed before.
    pub fn acquire(&self, key: &str, callback: impl FnOnce(&mut Object, bool)) -> bool {
        let (entry, created) = {
            let mut objects = self.objects.lock().unwrap();
            match objects.get(key) {
                Some(object) => (object.clone(), false),
                None => {
                    let object = Arc::new(Mutex::new(Object::new()));
                    objects.insert(key.to_string(), object.clone());
                    (object, true)
                }
            }
        };
        callback(&mut entry.lock().unwrap(), created);
        !created
    }

    /// The request-side entry point: serve from cache, queue behind an
    /// in-flight update, or make the caller the updater.
    pub fn deliver(&self, key: &str, request_headers: &Headers, on_response: Waiter) -> Delivery {
        if !self.config.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Delivery::Miss;
        }

        let (ttl, shadow_ttl, lock_on_update, lock_timeout) = (
            self.config.default_ttl,
            self.config.default_shadow_ttl,
            self.config.lock_on_update,
            self.config.update_lock_timeout,
        );

        let mut decision = Delivery::Miss;
        self.acquire(key, |object, _created| {
            let variant = match object.select_mut(request_headers) {
                Some(variant) => variant,
                None => {
                    object.variants.push(ConcreteObject::new(ttl, shadow_ttl));
                    let variant = object.variants.last_mut().unwrap();
                    variant.update_started = Instant::now();
                    decision = Delivery::Miss;
                    return;
                }
            };

            variant.refresh();

            match variant.state {
                ObjectState::Active => {
                    variant.hits += 1;
                    let response = variant.response.as_ref().unwrap();
                    on_response(response);
                    decision = Delivery::Hit;
                }
                ObjectState::Stale => {
                    if variant.shadow_expired() {
                        // The payload aged out entirely; refetch from
                        // scratch.
                        variant.response = None;
                        variant.state = ObjectState::Spawning;
                        variant.update_started = Instant::now();
                        decision = Delivery::Miss;
                    } else {
                        variant.state = ObjectState::Updating;
                        variant.update_started = Instant::now();
                        decision = Delivery::Miss;
                    }
                }
                ObjectState::Spawning | ObjectState::Updating => {
                    // A stalled updater loses ownership to this caller.
                    if variant.update_started.elapsed() > lock_timeout {
                        variant.update_started = Instant::now();
                        decision = Delivery::Miss;
                        return;
                    }

                    if !lock_on_update {
                        if let Some(response) = &variant.response {
                            // Serve the previous payload rather than
                            // waiting for the refresh.
                            variant.hits += 1;
                            on_response(response);
                            decision = Delivery::Shadow;
                            return;
                        }
                    }
                    variant.waiters.push(on_response);
                    decision = Delivery::Queued;
                }
            }
        });

        match decision {
            Delivery::Hit => {
                self.hits.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::Shadow => {
                self.shadow_hits.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::Miss => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::Queued => {}
        }
        decision
    }

    /// Installs the refreshed payload produced by the updater and
    /// releases the waiters.
    pub fn complete(&self, key: &str, request_headers: &Headers, response: CachedResponse) {
        let varying: Vec<(String, String)> = response
            .headers
            .get("Vary")
            .map(|value| {
                value
                    .split(',')
                    .map(|name| {
                        let name = name.trim().to_string();
                        let request_value =
                            request_headers.get(&name).unwrap_or("").to_string();
                        (name, request_value)
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.acquire(key, |object, _| {
            let variant = match object.select_mut(request_headers) {
                Some(variant) => variant,
                None => {
                    object.variants.push(ConcreteObject::new(
                        self.config.default_ttl,
                        self.config.default_shadow_ttl,
                    ));
                    object.variants.last_mut().unwrap()
                }
            };

            variant.varying_headers = varying.clone();
            variant.response = Some(response.clone());
            variant.state = ObjectState::Active;
            variant.ctime = Instant::now();

            for waiter in variant.waiters.drain(..) {
                waiter(variant.response.as_ref().unwrap());
            }
        });
    }

    /// The updater failed; fall back to the previous payload when there
    /// is one, otherwise drop the spawning variant.
    pub fn fail(&self, key: &str, request_headers: &Headers) {
        self.acquire(key, |object, _| {
            let index = object
                .variants
                .iter()
                .position(|v| v.matches(request_headers));
            if let Some(index) = index {
                let variant = &mut object.variants[index];
                warn!("cache update for '{}' failed ({} waiters)", key, variant.waiters.len());
                variant.waiters.clear();
                if variant.response.is_some() {
                    variant.state = ObjectState::Stale;
                } else {
                    object.variants.remove(index);
                }
            }
        });
    }

    /// Flags the object stale; shadow delivery still applies. Returns
    /// whether the key was known.
    pub fn purge(&self, key: &str) -> bool {
        let found = self.find(key, |object| {
            if let Some(object) = object {
                object.expire();
            }
        });
        if found {
            self.purges.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Expires every cached object without freeing payloads.
    pub fn expire_all(&self) {
        let objects = self.objects.lock().unwrap();
        for object in objects.values() {
            object.lock().unwrap().expire();
            self.expiries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops everything.
    pub fn purge_all(&self) {
        let mut objects = self.objects.lock().unwrap();
        let n = objects.len() as u64;
        objects.clear();
        self.purges.fetch_add(n, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn cache_shadow_hits(&self) -> u64 {
        self.shadow_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn cache_purges(&self) -> u64 {
        self.purges.load(Ordering::Relaxed)
    }

    pub fn cache_expiries(&self) -> u64 {
        self.expiries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::status_code;

    fn response(body: &str) -> CachedResponse {
        CachedResponse {
            status: status_code::OK,
            headers: Headers::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn response_varying(body: &str, vary: &str) -> CachedResponse {
        let mut r = response(body);
        r.headers.push("Vary", vary);
        r
    }

    fn request_headers(pairs: &[(&str, &str)]) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.push(*name, *value);
        }
        headers
    }

    fn collected() -> (Arc<Mutex<Vec<Vec<u8>>>>, impl Fn() -> Waiter) {
        let sink = Arc::new(Mutex::new(vec![]));
        let s = sink.clone();
        let make = move || -> Waiter {
            let s = s.clone();
            Box::new(move |r: &CachedResponse| s.lock().unwrap().push(r.body.clone()))
        };
        (sink, make)
    }

    #[test]
    fn miss_then_complete_then_hit() {
        let cache = Cache::new(CacheConfig::default());
        let headers = request_headers(&[]);
        let (sink, waiter) = collected();

        assert!(matches!(
            cache.deliver("GET /x", &headers, waiter()),
            Delivery::Miss
        ));
        cache.complete("GET /x", &headers, response("payload"));

        assert!(matches!(
            cache.deliver("GET /x", &headers, waiter()),
            Delivery::Hit
        ));
        assert_eq!(*sink.lock().unwrap(), vec![b"payload".to_vec()]);
        assert_eq!(cache.cache_hits(), 1);
        assert_eq!(cache.cache_misses(), 1);
    }

    #[test]
    fn vary_selects_the_matching_variant() {
        let cache = Cache::new(CacheConfig::default());
        let gz = request_headers(&[("Accept-Encoding", "gzip")]);
        let id = request_headers(&[("Accept-Encoding", "identity")]);
        let (sink, waiter) = collected();

        assert!(matches!(cache.deliver("k", &gz, waiter()), Delivery::Miss));
        cache.complete("k", &gz, response_varying("gzipped", "Accept-Encoding"));

        // A request with a different varying value does not see the
        // gzip variant.
        assert!(matches!(cache.deliver("k", &id, waiter()), Delivery::Miss));
        cache.complete("k", &id, response_varying("plain", "Accept-Encoding"));

        assert!(matches!(cache.deliver("k", &gz, waiter()), Delivery::Hit));
        assert!(matches!(cache.deliver("k", &id, waiter()), Delivery::Hit));
        assert_eq!(
            *sink.lock().unwrap(),
            vec![b"gzipped".to_vec(), b"plain".to_vec()]
        );

        cache.find("k", |object| {
            assert_eq!(object.unwrap().variant_count(), 2);
        });
    }

    #[test]
    fn stale_objects_are_served_as_shadow_while_updating() {
        let config = CacheConfig {
            default_ttl: Duration::ZERO,
            lock_on_update: false,
            ..Default::default()
        };
        let cache = Cache::new(config);
        let headers = request_headers(&[]);
        let (sink, waiter) = collected();

        assert!(matches!(cache.deliver("k", &headers, waiter()), Delivery::Miss));
        cache.complete("k", &headers, response("v1"));

        // TTL zero: immediately stale. The first requester becomes the
        // updater...
        assert!(matches!(cache.deliver("k", &headers, waiter()), Delivery::Miss));
        // ...and concurrent requesters get the stale payload right away.
        assert!(matches!(
            cache.deliver("k", &headers, waiter()),
            Delivery::Shadow
        ));
        assert_eq!(sink.lock().unwrap().last().unwrap(), b"v1");
        assert_eq!(cache.cache_shadow_hits(), 1);

        cache.complete("k", &headers, response("v2"));
        assert!(matches!(
            cache.deliver("k", &headers, waiter()),
            Delivery::Miss | Delivery::Hit
        ));
    }

    #[test]
    fn lock_on_update_queues_waiters_until_completion() {
        let config = CacheConfig {
            default_ttl: Duration::ZERO,
            lock_on_update: true,
            ..Default::default()
        };
        let cache = Cache::new(config);
        let headers = request_headers(&[]);
        let (sink, waiter) = collected();

        assert!(matches!(cache.deliver("k", &headers, waiter()), Delivery::Miss));
        cache.complete("k", &headers, response("v1"));

        assert!(matches!(cache.deliver("k", &headers, waiter()), Delivery::Miss));
        assert!(matches!(
            cache.deliver("k", &headers, waiter()),
            Delivery::Queued
        ));
        assert!(matches!(
            cache.deliver("k", &headers, waiter()),
            Delivery::Queued
        ));
        // Nothing delivered yet beyond the initial fill.
        assert_eq!(sink.lock().unwrap().len(), 0);

        cache.complete("k", &headers, response("v2"));
        let delivered = sink.lock().unwrap().clone();
        assert_eq!(delivered, vec![b"v2".to_vec(), b"v2".to_vec()]);
    }

    #[test]
    fn first_fill_queues_other_requesters() {
        let cache = Cache::new(CacheConfig::default());
        let headers = request_headers(&[]);
        let (sink, waiter) = collected();

        assert!(matches!(cache.deliver("k", &headers, waiter()), Delivery::Miss));
        // No payload exists yet, so even without lock_on_update the
        // second requester has to wait.
        assert!(matches!(
            cache.deliver("k", &headers, waiter()),
            Delivery::Queued
        ));

        cache.complete("k", &headers, response("first"));
        assert_eq!(*sink.lock().unwrap(), vec![b"first".to_vec()]);
    }

    #[test]
    fn stalled_update_is_taken_over() {
        let config = CacheConfig {
            update_lock_timeout: Duration::ZERO,
            ..Default::default()
        };
        let cache = Cache::new(config);
        let headers = request_headers(&[]);
        let (_, waiter) = collected();

        assert!(matches!(cache.deliver("k", &headers, waiter()), Delivery::Miss));
        // The previous updater's deadline passed; ownership moves on.
        assert!(matches!(cache.deliver("k", &headers, waiter()), Delivery::Miss));
    }

    #[test]
    fn failed_update_without_payload_drops_the_variant() {
        let cache = Cache::new(CacheConfig::default());
        let headers = request_headers(&[]);
        let (sink, waiter) = collected();

        assert!(matches!(cache.deliver("k", &headers, waiter()), Delivery::Miss));
        cache.fail("k", &headers);
        assert_eq!(sink.lock().unwrap().len(), 0);

        cache.find("k", |object| {
            assert_eq!(object.unwrap().variant_count(), 0);
        });
    }

    #[test]
    fn purge_keeps_shadow_payloads() {
        let cache = Cache::new(CacheConfig::default());
        let headers = request_headers(&[]);
        let (sink, waiter) = collected();

        assert!(matches!(cache.deliver("k", &headers, waiter()), Delivery::Miss));
        cache.complete("k", &headers, response("kept"));
        assert!(cache.purge("k"));
        assert_eq!(cache.cache_purges(), 1);

        // Stale now, but the payload still flows to concurrent readers
        // while the first one refreshes.
        assert!(matches!(cache.deliver("k", &headers, waiter()), Delivery::Miss));
        assert!(matches!(
            cache.deliver("k", &headers, waiter()),
            Delivery::Shadow
        ));
        assert_eq!(sink.lock().unwrap().last().unwrap(), b"kept");
    }

    #[test]
    fn purge_unknown_key_reports_not_found() {
        let cache = Cache::new(CacheConfig::default());
        assert!(!cache.purge("nope"));
    }

    #[test]
    fn purge_all_frees_everything() {
        let cache = Cache::new(CacheConfig::default());
        let headers = request_headers(&[]);
        let (_, waiter) = collected();

        assert!(matches!(cache.deliver("a", &headers, waiter()), Delivery::Miss));
        cache.complete("a", &headers, response("x"));
        cache.purge_all();

        assert!(!cache.find("a", |_| {}));
    }

    #[test]
    fn expire_all_counts_expiries() {
        let cache = Cache::new(CacheConfig::default());
        let headers = request_headers(&[]);
        let (_, waiter) = collected();

        for key in ["a", "b"] {
            assert!(matches!(cache.deliver(key, &headers, waiter()), Delivery::Miss));
            cache.complete(key, &headers, response("x"));
        }
        cache.expire_all();
        assert_eq!(cache.cache_expiries(), 2);

        // Both serve as shadows afterwards.
        assert!(matches!(cache.deliver("a", &headers, waiter()), Delivery::Miss));
        assert!(matches!(
            cache.deliver("b", &headers, waiter()),
            Delivery::Miss
        ));
    }

    #[test]
    fn disabled_cache_always_misses() {
        let cache = Cache::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        let headers = request_headers(&[]);
        let (_, waiter) = collected();
        assert!(matches!(cache.deliver("k", &headers, waiter()), Delivery::Miss));
        assert!(matches!(cache.deliver("k", &headers, waiter()), Delivery::Miss));
    }
}
