use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::cache::ClientCache;
use crate::command::Command;
use crate::config::ClientOption;
use crate::error::{Error, Result};
use crate::pool::ConnPool;
use crate::wire::{HandshakeMode, Wire};

const SENTINEL_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const SENTINEL_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Routing layer for sentinel-monitored deployments: resolves the current
/// primary, watches the sentinel event stream, and swaps the primary pool
/// on failover while submits park briefly on the watch channel.
pub(crate) struct SentinelRouter {
    opt: Arc<ClientOption>,
    master_set: String,
    cache: Option<Arc<ClientCache>>,
    current: watch::Sender<Option<Arc<ConnPool>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl SentinelRouter {
    pub async fn new(opt: Arc<ClientOption>, cache: Option<Arc<ClientCache>>) -> Result<Arc<Self>> {
        let master_set = opt
            .sentinel
            .as_ref()
            .map(|sentinel| sentinel.master_set.clone())
            .ok_or_else(|| Error::Config("sentinel option is required".into()))?;

        let mut sentinels: Vec<Arc<str>> = opt
            .init_address
            .iter()
            .map(|address| Arc::from(address.as_str()))
            .collect();
        if opt.shuffle_init {
            sentinels.shuffle(&mut rand::thread_rng());
        }

        let primary = discover_primary(&opt, &master_set, &sentinels).await?;
        info!(master_set = %master_set, primary = %primary, "sentinel discovery resolved primary");
        let pool = ConnPool::new(primary, opt.clone(), cache.clone());
        let (current, _) = watch::channel(Some(pool));

        let router = Arc::new(Self {
            opt,
            master_set,
            cache,
            current,
            watcher: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        });
        let task = tokio::spawn(watch_sentinels(router.clone(), sentinels));
        *router.watcher.lock() = Some(task);
        Ok(router)
    }

    /// The pool for the current primary. During a failover the slot is
    /// empty and callers park here, bounded by the failover timeout.
    pub async fn current_pool(&self) -> Result<Arc<ConnPool>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closing);
        }
        let mut rx = self.current.subscribe();
        if let Some(pool) = rx.borrow().clone() {
            return Ok(pool);
        }
        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    return Err(Error::Closing);
                }
                let current = rx.borrow().clone();
                if let Some(pool) = current {
                    return Ok(pool);
                }
            }
        };
        match timeout(self.opt.failover_timeout(), wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::NoEndpoint(format!(
                "failover of master set {} did not settle in time",
                self.master_set
            ))),
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.watcher.lock().take() {
            task.abort();
        }
        let old = self.current.send_replace(None);
        if let Some(pool) = old {
            pool.close().await;
        }
    }

    /// Swap in a pool for the newly promoted primary. The old pool drains
    /// its outstanding replies before closing.
    fn promote(&self, address: Arc<str>) {
        info!(master_set = %self.master_set, primary = %address, "following +switch-master");
        let old = self.current.send_replace(None);
        if let Some(old_pool) = old {
            tokio::spawn(async move { old_pool.close().await });
        }
        let pool = ConnPool::new(address, self.opt.clone(), self.cache.clone());
        self.current.send_replace(Some(pool));
    }
}

/// Ask each sentinel in turn for the primary of the watched set.
async fn discover_primary(
    opt: &Arc<ClientOption>,
    master_set: &str,
    sentinels: &[Arc<str>],
) -> Result<Arc<str>> {
    let mut last_err = Error::NoEndpoint("no sentinel reachable".into());
    for sentinel in sentinels {
        match query_primary(opt, master_set, sentinel).await {
            Ok(address) => return Ok(address),
            Err(err) => {
                warn!(sentinel = %sentinel, error = %err, "sentinel query failed");
                last_err = err;
            }
        }
    }
    Err(last_err)
}

async fn query_primary(
    opt: &Arc<ClientOption>,
    master_set: &str,
    sentinel: &Arc<str>,
) -> Result<Arc<str>> {
    let wire = Wire::connect(sentinel.clone(), opt, HandshakeMode::Sentinel, None).await?;
    let reply = wire
        .do_cmd(&Command::new([
            "SENTINEL",
            "GET-MASTER-ADDR-BY-NAME",
            master_set,
        ])?)
        .await;
    wire.close(false).await;
    let reply = reply?;
    if let Some(message) = reply.error_text() {
        return Err(Error::Server(String::from_utf8_lossy(message).into_owned()));
    }
    let fields = reply
        .as_array()
        .ok_or_else(|| Error::NoEndpoint(format!("master set {master_set} is unknown")))?;
    if fields.len() < 2 {
        return Err(Error::protocol("sentinel returned a short master address"));
    }
    let host = fields[0]
        .as_bytes()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .ok_or_else(|| Error::protocol("sentinel master host is not a string"))?;
    let port = fields[1]
        .as_int()
        .ok_or_else(|| Error::protocol("sentinel master port is not numeric"))?;
    Ok(format!("{host}:{port}").into())
}

/// Long-lived watcher: subscribe to failover events on any reachable
/// sentinel, reconnecting with backoff when the wire drops.
async fn watch_sentinels(router: Arc<SentinelRouter>, sentinels: Vec<Arc<str>>) {
    let mut backoff = SENTINEL_RETRY_BACKOFF;
    let mut index = 0usize;
    loop {
        if router.closed.load(Ordering::Acquire) {
            return;
        }
        let sentinel = sentinels[index % sentinels.len()].clone();
        index += 1;
        match watch_one(&router, &sentinel).await {
            Ok(()) => return, // router closed
            Err(err) => {
                debug!(sentinel = %sentinel, error = %err, "sentinel watch interrupted");
                sleep(backoff).await;
                backoff = (backoff * 2).min(SENTINEL_BACKOFF_MAX);
            }
        }
    }
}

async fn watch_one(router: &Arc<SentinelRouter>, sentinel: &Arc<str>) -> Result<()> {
    let wire = Wire::connect(sentinel.clone(), &router.opt, HandshakeMode::Sentinel, None).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    for channel in [&b"+switch-master"[..], &b"+sdown"[..], &b"+odown"[..]] {
        wire.subscriptions()
            .register_channel(Bytes::copy_from_slice(channel), tx.clone());
    }
    // the registry holds the only senders now, so a dead wire ends the loop
    drop(tx);
    let subscribe = Command::new(["SUBSCRIBE", "+switch-master", "+sdown", "+odown"])?;
    let reply = wire.do_cmd(&subscribe).await?;
    if let Some(message) = reply.error_text() {
        wire.close(false).await;
        return Err(Error::Server(String::from_utf8_lossy(message).into_owned()));
    }

    while let Some(event) = rx.recv().await {
        if router.closed.load(Ordering::Acquire) {
            wire.close(false).await;
            return Ok(());
        }
        if event.channel.as_ref() != b"+switch-master" {
            debug!(
                channel = %String::from_utf8_lossy(&event.channel),
                payload = %String::from_utf8_lossy(&event.payload),
                "sentinel state event"
            );
            continue;
        }
        if let Some(address) = parse_switch_master(&router.master_set, &event.payload) {
            router.promote(address);
        }
    }
    Err(Error::broken(format!("sentinel {sentinel} event stream ended")))
}

/// `+switch-master` payload: `<set> <old-ip> <old-port> <new-ip> <new-port>`.
fn parse_switch_master(master_set: &str, payload: &[u8]) -> Option<Arc<str>> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut parts = text.split_whitespace();
    if parts.next()? != master_set {
        return None;
    }
    let _old_ip = parts.next()?;
    let _old_port = parts.next()?;
    let new_ip = parts.next()?;
    let new_port = parts.next()?;
    Some(format!("{new_ip}:{new_port}").into())
}
