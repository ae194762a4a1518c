//! Asynchronous DNS resolution.
//!
//! The reactor thread must never block, so lookups run on a small tokio
//! runtime and their answers come back through a channel. A `mio::Waker`
//! interrupts the poll so answers are dispatched promptly. Each
//! [`Resolver::resolve`] call produces exactly one [`Resolution`], always
//! delivered later through [`Resolver::drain`], never on the caller's stack.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::Waker;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::engine::HandlerId;
use crate::error::{Error, Result};

/// Answer to one lookup.
#[derive(Debug)]
pub struct Resolution {
    /// Handler that asked
    pub id: HandlerId,
    /// Name that was looked up
    pub host: String,
    /// Resolved address, or why there is none
    pub result: Result<IpAddr>,
}

/// Name resolution capability used by the role state machines.
pub trait Resolver {
    /// Start resolving `host` on behalf of handler `id`.
    fn resolve(&mut self, host: &str, id: HandlerId) -> Result<()>;

    /// Collect every answer that has arrived since the last call.
    fn drain(&mut self) -> Vec<Resolution>;

    /// Drop stale cached answers. Called from the periodic hook.
    fn purge(&mut self) {}
}

/// Positive answers with an expiry.
struct DnsCache {
    entries: HashMap<String, (IpAddr, Instant)>,
    ttl: Duration,
}

impl DnsCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    fn get(&mut self, host: &str, now: Instant) -> Option<IpAddr> {
        match self.entries.get(host) {
            Some((ip, expires)) if *expires > now => Some(*ip),
            Some(_) => {
                self.entries.remove(host);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, host: String, ip: IpAddr, now: Instant) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.insert(host, (ip, now + self.ttl));
    }

    fn purge(&mut self, now: Instant) {
        self.entries.retain(|_, (_, expires)| *expires > now);
    }
}

/// System resolver running on a background tokio runtime.
pub struct DnsResolver {
    runtime: Runtime,
    tx: UnboundedSender<Resolution>,
    rx: UnboundedReceiver<Resolution>,
    cache: Arc<Mutex<DnsCache>>,
    timeout: Duration,
    waker: Option<Arc<Waker>>,
}

impl DnsResolver {
    /// Create a resolver.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Upper bound for a single lookup
    /// * `cache_ttl` - How long positive answers are reused; zero disables caching
    pub fn new(timeout: Duration, cache_ttl: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("sstunnel-dns")
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            runtime,
            tx,
            rx,
            cache: Arc::new(Mutex::new(DnsCache::new(cache_ttl))),
            timeout,
            waker: None,
        })
    }

    /// Wake the reactor's poll whenever an answer is queued.
    pub fn with_waker(mut self, waker: Arc<Waker>) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Drop expired cache entries.
    pub fn purge_cache(&self) {
        self.cache.lock().purge(Instant::now());
    }

    /// Number of cached names.
    pub fn cached(&self) -> usize {
        self.cache.lock().entries.len()
    }

    fn deliver(tx: &UnboundedSender<Resolution>, waker: Option<&Waker>, resolution: Resolution) {
        if tx.send(resolution).is_err() {
            // Receiver lives as long as the resolver; nothing to do.
            return;
        }
        if let Some(waker) = waker {
            if let Err(e) = waker.wake() {
                tracing::warn!("failed to wake reactor after DNS answer: {}", e);
            }
        }
    }
}

impl Resolver for DnsResolver {
    fn resolve(&mut self, host: &str, id: HandlerId) -> Result<()> {
        if host.is_empty() {
            return Err(Error::resolve(host, "empty host name"));
        }

        // Literals and cache hits still go through the channel so the answer
        // arrives after the caller has returned.
        let ready = host
            .parse::<IpAddr>()
            .ok()
            .or_else(|| self.cache.lock().get(host, Instant::now()));
        if let Some(ip) = ready {
            Self::deliver(
                &self.tx,
                self.waker.as_deref(),
                Resolution {
                    id,
                    host: host.to_string(),
                    result: Ok(ip),
                },
            );
            return Ok(());
        }

        let tx = self.tx.clone();
        let waker = self.waker.clone();
        let cache = Arc::clone(&self.cache);
        let timeout = self.timeout;
        let host = host.to_string();

        self.runtime.spawn(async move {
            tracing::debug!("resolving {}", host);
            let lookup = tokio::net::lookup_host((host.as_str(), 0));
            let result = match tokio::time::timeout(timeout, lookup).await {
                Ok(Ok(addrs)) => {
                    let addrs: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
                    addrs
                        .iter()
                        .find(|ip| ip.is_ipv4())
                        .or_else(|| addrs.first())
                        .copied()
                        .ok_or_else(|| Error::resolve(host.as_str(), "no address records"))
                }
                Ok(Err(e)) => Err(Error::resolve(host.as_str(), e)),
                Err(_) => Err(Error::resolve(
                    host.as_str(),
                    format!("timed out after {}ms", timeout.as_millis()),
                )),
            };

            if let Ok(ip) = &result {
                cache.lock().insert(host.clone(), *ip, Instant::now());
            }
            Self::deliver(&tx, waker.as_deref(), Resolution { id, host, result });
        });

        Ok(())
    }

    fn drain(&mut self) -> Vec<Resolution> {
        let mut answers = Vec::new();
        while let Ok(resolution) = self.rx.try_recv() {
            answers.push(resolution);
        }
        answers
    }

    fn purge(&mut self) {
        self.purge_cache();
    }
}
