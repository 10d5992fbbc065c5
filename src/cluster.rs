use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cache::ClientCache;
use crate::command::Command;
use crate::config::ClientOption;
use crate::error::{Error, Result};
use crate::metrics;
use crate::pool::{ConnPool, DedicatedWire};
use crate::protocol::RespValue;
use crate::utils::SLOT_COUNT;

const REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 5;
const TRYAGAIN_ATTEMPTS: u32 = 3;
const TRYAGAIN_BACKOFF: Duration = Duration::from_millis(20);

/// Cluster redirect parsed from an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Redirect {
    Moved { slot: u16, address: String },
    Ask { address: String },
}

pub(crate) fn parse_redirect(value: &RespValue) -> Option<Redirect> {
    let text = value.error_text()?;
    let text = std::str::from_utf8(text).ok()?;
    if let Some(rest) = text.strip_prefix("MOVED ") {
        let mut parts = rest.split_whitespace();
        let slot = parts.next()?.parse().ok()?;
        let address = parts.next()?.to_string();
        return Some(Redirect::Moved { slot, address });
    }
    if let Some(rest) = text.strip_prefix("ASK ") {
        let mut parts = rest.split_whitespace();
        let _slot: u16 = parts.next()?.parse().ok()?;
        let address = parts.next()?.to_string();
        return Some(Redirect::Ask { address });
    }
    None
}

fn is_tryagain(value: &RespValue) -> bool {
    value
        .error_text()
        .map(|text| text.starts_with(b"TRYAGAIN"))
        .unwrap_or(false)
}

fn is_cluster_disabled(text: &[u8]) -> bool {
    let text = String::from_utf8_lossy(text).to_ascii_lowercase();
    text.contains("cluster support disabled") || text.contains("unknown command")
}

/// Immutable slot ownership snapshot. Replaced wholesale on refresh; a
/// MOVED redirect patches a single mapping copy-on-write.
#[derive(Debug, Clone)]
pub(crate) struct SlotTable {
    version: u64,
    primaries: Vec<Option<Arc<str>>>,
    replicas: Vec<Vec<Arc<str>>>,
}

impl SlotTable {
    pub fn empty() -> Self {
        Self {
            version: 0,
            primaries: vec![None; SLOT_COUNT as usize],
            replicas: vec![Vec::new(); SLOT_COUNT as usize],
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn primary(&self, slot: u16) -> Option<Arc<str>> {
        self.primaries.get(slot as usize).and_then(|entry| entry.clone())
    }

    pub fn replica(&self, slot: u16) -> Option<Arc<str>> {
        self.replicas
            .get(slot as usize)
            .and_then(|list| list.first().cloned())
    }

    fn with_moved(&self, slot: u16, address: Arc<str>) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next.primaries[slot as usize] = Some(address);
        next
    }

    fn any_primary(&self) -> Option<Arc<str>> {
        self.primaries.iter().flatten().next().cloned()
    }

    fn endpoints(&self) -> Vec<Arc<str>> {
        let mut seen = std::collections::BTreeSet::new();
        for primary in self.primaries.iter().flatten() {
            seen.insert(primary.clone());
        }
        for list in &self.replicas {
            for replica in list {
                seen.insert(replica.clone());
            }
        }
        seen.into_iter().collect()
    }
}

/// Parse a `CLUSTER SHARDS` reply.
pub(crate) fn table_from_shards(resp: &RespValue, version: u64) -> Result<SlotTable> {
    let shards = resp
        .as_array()
        .ok_or_else(|| Error::protocol("CLUSTER SHARDS must return an array"))?;
    let mut table = SlotTable::empty();
    table.version = version;
    for shard in shards {
        let slots_field = shard_field(shard, b"slots")
            .ok_or_else(|| Error::protocol("shard entry is missing its slot ranges"))?;
        let nodes_field = shard_field(shard, b"nodes")
            .ok_or_else(|| Error::protocol("shard entry is missing its nodes"))?;

        let ranges = slot_ranges(&slots_field)?;
        let mut primary: Option<Arc<str>> = None;
        let mut replicas: Vec<Arc<str>> = Vec::new();
        for node in nodes_field
            .as_array()
            .ok_or_else(|| Error::protocol("shard nodes must be an array"))?
        {
            let endpoint = match node_endpoint(node) {
                Some(endpoint) => endpoint,
                None => continue,
            };
            match shard_field(node, b"role")
                .and_then(|role| role.as_bytes().map(|bytes| bytes.to_ascii_lowercase()))
            {
                Some(role) if role == b"master" => primary = Some(endpoint),
                _ => replicas.push(endpoint),
            }
        }
        let primary = match primary {
            Some(primary) => primary,
            None => continue, // failed-over shard with no promoted node yet
        };
        for (start, end) in ranges {
            for slot in start..=end {
                table.primaries[slot as usize] = Some(primary.clone());
                table.replicas[slot as usize] = replicas.clone();
            }
        }
    }
    Ok(table)
}

/// Parse the legacy `CLUSTER SLOTS` reply shape.
pub(crate) fn table_from_slots(resp: &RespValue, version: u64) -> Result<SlotTable> {
    let entries = resp
        .as_array()
        .ok_or_else(|| Error::protocol("CLUSTER SLOTS must return an array"))?;
    let mut table = SlotTable::empty();
    table.version = version;
    for entry in entries {
        let fields = entry
            .as_array()
            .ok_or_else(|| Error::protocol("slot entry must be an array"))?;
        if fields.len() < 3 {
            return Err(Error::protocol("slot entry must contain start, end, and master"));
        }
        let start = fields[0]
            .as_int()
            .ok_or_else(|| Error::protocol("slot range start must be an integer"))?;
        let end = fields[1]
            .as_int()
            .ok_or_else(|| Error::protocol("slot range end must be an integer"))?;
        if start < 0 || end < start || end >= SLOT_COUNT as i64 {
            return Err(Error::protocol(format!("slot range {start}-{end} out of bounds")));
        }
        let primary = endpoint_from_pair(&fields[2])
            .ok_or_else(|| Error::protocol("slot master endpoint is malformed"))?;
        let replicas: Vec<Arc<str>> = fields[3..]
            .iter()
            .filter_map(endpoint_from_pair)
            .collect();
        for slot in start..=end {
            table.primaries[slot as usize] = Some(primary.clone());
            table.replicas[slot as usize] = replicas.clone();
        }
    }
    Ok(table)
}

/// Field lookup tolerating both RESP3 maps and RESP2 flattened key/value
/// arrays.
fn shard_field(entry: &RespValue, name: &[u8]) -> Option<RespValue> {
    if let Some(pairs) = entry.as_map() {
        for (key, value) in pairs {
            if key.as_bytes().map(|k| k.eq_ignore_ascii_case(name)) == Some(true) {
                return Some(value.clone());
            }
        }
        return None;
    }
    let items = entry.as_array()?;
    let mut index = 0;
    while index + 1 < items.len() {
        if items[index].as_bytes().map(|k| k.eq_ignore_ascii_case(name)) == Some(true) {
            return Some(items[index + 1].clone());
        }
        index += 2;
    }
    None
}

fn slot_ranges(field: &RespValue) -> Result<Vec<(u16, u16)>> {
    let bounds = field
        .as_array()
        .ok_or_else(|| Error::protocol("shard slots must be an array"))?;
    if bounds.len() % 2 != 0 {
        return Err(Error::protocol("shard slot ranges must come in pairs"));
    }
    let mut ranges = Vec::with_capacity(bounds.len() / 2);
    for pair in bounds.chunks(2) {
        let start = pair[0]
            .as_int()
            .ok_or_else(|| Error::protocol("slot bound must be an integer"))?;
        let end = pair[1]
            .as_int()
            .ok_or_else(|| Error::protocol("slot bound must be an integer"))?;
        if start < 0 || end < start || end >= SLOT_COUNT as i64 {
            return Err(Error::protocol(format!("slot range {start}-{end} out of bounds")));
        }
        ranges.push((start as u16, end as u16));
    }
    Ok(ranges)
}

fn node_endpoint(node: &RespValue) -> Option<Arc<str>> {
    let host = shard_field(node, b"endpoint")
        .or_else(|| shard_field(node, b"ip"))
        .and_then(|host| {
            host.as_bytes()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        })?;
    if host.is_empty() {
        return None;
    }
    let port = shard_field(node, b"port").and_then(|port| port.as_int())?;
    Some(format!("{host}:{port}").into())
}

fn endpoint_from_pair(value: &RespValue) -> Option<Arc<str>> {
    let fields = value.as_array()?;
    if fields.len() < 2 {
        return None;
    }
    let host = fields[0]
        .as_bytes()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())?;
    let port = fields[1].as_int()?;
    Some(format!("{host}:{port}").into())
}

/// Routing layer for sharded deployments: owns the slot table and one
/// [`ConnPool`] per known endpoint, follows MOVED/ASK redirects, and keeps
/// the table fresh in the background.
pub(crate) struct ClusterRouter {
    opt: Arc<ClientOption>,
    cache: Option<Arc<ClientCache>>,
    seeds: Vec<Arc<str>>,
    table: ArcSwap<SlotTable>,
    pools: RwLock<HashMap<Arc<str>, Arc<ConnPool>>>,
    refresh_tx: mpsc::UnboundedSender<()>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ClusterRouter {
    /// Build the router and populate the slot table synchronously from the
    /// seeds. Returns `Ok(None)` when the seed node reports that cluster
    /// support is disabled, so the caller can fall back to standalone mode.
    pub async fn new(
        opt: Arc<ClientOption>,
        cache: Option<Arc<ClientCache>>,
        seeds: Vec<String>,
    ) -> Result<Option<Arc<Self>>> {
        let mut seeds: Vec<Arc<str>> = seeds.into_iter().map(Arc::from).collect();
        if opt.shuffle_init {
            seeds.shuffle(&mut rand::thread_rng());
        }
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            opt,
            cache,
            seeds,
            table: ArcSwap::from_pointee(SlotTable::empty()),
            pools: RwLock::new(HashMap::new()),
            refresh_tx,
            refresh_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        match router.refresh_once().await {
            Ok(()) => {}
            Err(Error::Server(message)) if is_cluster_disabled(message.as_bytes()) => {
                router.shutdown_pools().await;
                return Ok(None);
            }
            Err(err) => return Err(err),
        }

        let task = tokio::spawn(refresh_loop(router.clone(), refresh_rx));
        *router.refresh_task.lock() = Some(task);
        Ok(Some(router))
    }

    pub async fn do_cmd(&self, command: &Command) -> Result<RespValue> {
        if command.is_cross_slot() {
            return Err(Error::CrossSlot);
        }
        let mut target: Option<Arc<str>> = None;
        let mut asking = false;
        let mut tryagain_left = TRYAGAIN_ATTEMPTS;
        let mut backoff = TRYAGAIN_BACKOFF;

        for _ in 0..MAX_REDIRECTS {
            let endpoint = match target.clone() {
                Some(endpoint) => endpoint,
                None => self.endpoint_for(command)?,
            };
            let pool = self.pool_for(&endpoint);

            let reply = if asking {
                // single-shot redirect: ASKING and the command must share a
                // connection, so they ride a dedicated sub-wire
                let dedicated = pool.acquire_dedicated().await?;
                let handoff = dedicated
                    .wire()
                    .do_multi(&[Command::new(["ASKING"])?, command.clone()])
                    .await?;
                handoff
                    .into_iter()
                    .nth(1)
                    .ok_or_else(|| Error::protocol("ASKING exchange returned no reply"))?
            } else if command.is_blocking() {
                let dedicated = pool.acquire_dedicated().await?;
                dedicated.wire().do_cmd(command).await?
            } else {
                pool.do_cmd(command).await?
            };
            asking = false;

            match parse_redirect(&reply) {
                Some(Redirect::Moved { slot, address }) => {
                    metrics::redirect_moved();
                    debug!(slot, address = %address, "following MOVED redirect");
                    let address: Arc<str> = address.into();
                    self.apply_moved(slot, address.clone());
                    target = Some(address);
                    let _ = self.refresh_tx.send(());
                }
                Some(Redirect::Ask { address }) => {
                    metrics::redirect_ask();
                    target = Some(address.into());
                    asking = true;
                }
                None if is_tryagain(&reply) && tryagain_left > 0 => {
                    tryagain_left -= 1;
                    sleep(backoff).await;
                    backoff *= 2;
                    target = None;
                }
                None => return Ok(reply),
            }
        }
        Err(Error::NoEndpoint("too many cluster redirects".into()))
    }

    /// Acquire a dedicated wire on the node owning the command's slot.
    pub async fn dedicated_for(&self, command: &Command) -> Result<DedicatedWire> {
        if command.is_cross_slot() {
            return Err(Error::CrossSlot);
        }
        let endpoint = self.endpoint_for(command)?;
        self.pool_for(&endpoint).acquire_dedicated().await
    }

    /// The shared pool owning the command's slot, for cache fetches.
    pub fn pool_for_command(&self, command: &Command) -> Result<Arc<ConnPool>> {
        let endpoint = self.endpoint_for(command)?;
        Ok(self.pool_for(&endpoint))
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
        self.shutdown_pools().await;
    }

    async fn shutdown_pools(&self) {
        let pools: Vec<_> = self.pools.write().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close().await;
        }
    }

    fn endpoint_for(&self, command: &Command) -> Result<Arc<str>> {
        let table = self.table.load();
        match command.slot() {
            Some(slot) => {
                if self.opt.read_from_replica && command.is_readonly() {
                    if let Some(replica) = table.replica(slot) {
                        return Ok(replica);
                    }
                }
                table
                    .primary(slot)
                    .ok_or_else(|| Error::NoEndpoint(format!("slot {slot} has no known owner")))
            }
            None => table
                .any_primary()
                .or_else(|| self.seeds.first().cloned())
                .ok_or_else(|| Error::NoEndpoint("no cluster endpoints known".into())),
        }
    }

    fn pool_for(&self, endpoint: &Arc<str>) -> Arc<ConnPool> {
        if let Some(pool) = self.pools.read().get(endpoint) {
            return pool.clone();
        }
        let mut pools = self.pools.write();
        pools
            .entry(endpoint.clone())
            .or_insert_with(|| {
                ConnPool::new(endpoint.clone(), self.opt.clone(), self.cache.clone())
            })
            .clone()
    }

    fn apply_moved(&self, slot: u16, address: Arc<str>) {
        self.table
            .rcu(|table| table.with_moved(slot, address.clone()));
    }

    /// One full table refresh against the healthiest reachable endpoint.
    pub async fn refresh_once(&self) -> Result<()> {
        let mut candidates = self.table.load().endpoints();
        for seed in &self.seeds {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }
        candidates.shuffle(&mut rand::thread_rng());

        let mut last_err = Error::NoEndpoint("no cluster endpoints known".into());
        for endpoint in candidates {
            let pool = self.pool_for(&endpoint);
            match fetch_table(&pool, self.table.load().version() + 1).await {
                Ok(table) => {
                    info!(endpoint = %endpoint, version = table.version(), "slot table refreshed");
                    self.table.store(Arc::new(table));
                    metrics::slot_refresh();
                    return Ok(());
                }
                Err(err) => {
                    if let Error::Server(message) = &err {
                        if is_cluster_disabled(message.as_bytes()) {
                            return Err(err);
                        }
                    }
                    warn!(endpoint = %endpoint, error = %err, "slot refresh candidate failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

/// `CLUSTER SHARDS` with a `CLUSTER SLOTS` fallback for older servers.
async fn fetch_table(pool: &Arc<ConnPool>, version: u64) -> Result<SlotTable> {
    let shards_reply = pool.do_cmd(&Command::new(["CLUSTER", "SHARDS"])?).await?;
    match shards_reply.error_text() {
        None => table_from_shards(&shards_reply, version),
        Some(message) if is_cluster_disabled(message) => {
            Err(Error::Server(String::from_utf8_lossy(message).into_owned()))
        }
        Some(_) => {
            let slots_reply = pool.do_cmd(&Command::new(["CLUSTER", "SLOTS"])?).await?;
            match slots_reply.error_text() {
                None => table_from_slots(&slots_reply, version),
                Some(message) => Err(Error::Server(
                    String::from_utf8_lossy(message).into_owned(),
                )),
            }
        }
    }
}

/// Periodic refresh plus coalesced on-demand triggers: all triggers queued
/// while a refresh runs collapse into the next single run.
async fn refresh_loop(router: Arc<ClusterRouter>, mut trigger: mpsc::UnboundedReceiver<()>) {
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the initial tick fires immediately
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            received = trigger.recv() => {
                if received.is_none() {
                    break;
                }
                while trigger.try_recv().is_ok() {}
            }
        }
        if router.closed.load(Ordering::Acquire) {
            break;
        }
        if let Err(err) = router.refresh_once().await {
            warn!(error = %err, "cluster topology refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn endpoint_pair(host: &str, port: i64) -> RespValue {
        RespValue::Array(vec![
            RespValue::bulk(host),
            RespValue::Integer(port),
        ])
    }

    #[test]
    fn parses_moved_and_ask_redirects() {
        let moved = RespValue::Error(Bytes::from_static(b"MOVED 3999 127.0.0.1:6381"));
        assert_eq!(
            parse_redirect(&moved),
            Some(Redirect::Moved {
                slot: 3999,
                address: "127.0.0.1:6381".into()
            })
        );
        let ask = RespValue::Error(Bytes::from_static(b"ASK 42 127.0.0.1:6382"));
        assert_eq!(
            parse_redirect(&ask),
            Some(Redirect::Ask {
                address: "127.0.0.1:6382".into()
            })
        );
        assert_eq!(parse_redirect(&RespValue::error("ERR other")), None);
    }

    #[test]
    fn slots_reply_covers_full_range() {
        let resp = RespValue::Array(vec![
            RespValue::Array(vec![
                RespValue::Integer(0),
                RespValue::Integer(5460),
                endpoint_pair("10.0.0.1", 7000),
                endpoint_pair("10.0.0.4", 7003),
            ]),
            RespValue::Array(vec![
                RespValue::Integer(5461),
                RespValue::Integer(16383),
                endpoint_pair("10.0.0.2", 7001),
            ]),
        ]);
        let table = table_from_slots(&resp, 1).unwrap();
        assert_eq!(table.primary(0).as_deref(), Some("10.0.0.1:7000"));
        assert_eq!(table.primary(5460).as_deref(), Some("10.0.0.1:7000"));
        assert_eq!(table.replica(42).as_deref(), Some("10.0.0.4:7003"));
        assert_eq!(table.primary(16383).as_deref(), Some("10.0.0.2:7001"));
    }

    #[test]
    fn shards_reply_parses_roles_and_ranges() {
        let node = |endpoint: &str, port: i64, role: &str| {
            RespValue::Map(vec![
                (RespValue::bulk("endpoint"), RespValue::bulk(endpoint)),
                (RespValue::bulk("port"), RespValue::Integer(port)),
                (RespValue::bulk("role"), RespValue::bulk(role)),
            ])
        };
        let resp = RespValue::Array(vec![RespValue::Map(vec![
            (
                RespValue::bulk("slots"),
                RespValue::Array(vec![RespValue::Integer(0), RespValue::Integer(99)]),
            ),
            (
                RespValue::bulk("nodes"),
                RespValue::Array(vec![
                    node("10.0.0.1", 7000, "master"),
                    node("10.0.0.2", 7001, "replica"),
                ]),
            ),
        ])]);
        let table = table_from_shards(&resp, 3).unwrap();
        assert_eq!(table.version(), 3);
        assert_eq!(table.primary(50).as_deref(), Some("10.0.0.1:7000"));
        assert_eq!(table.replica(50).as_deref(), Some("10.0.0.2:7001"));
        assert_eq!(table.primary(100), None);
    }

    #[test]
    fn moved_patch_is_copy_on_write() {
        let resp = RespValue::Array(vec![RespValue::Array(vec![
            RespValue::Integer(0),
            RespValue::Integer(16383),
            endpoint_pair("10.0.0.1", 7000),
        ])]);
        let table = table_from_slots(&resp, 1).unwrap();
        let patched = table.with_moved(77, Arc::from("10.0.0.9:7009"));
        assert_eq!(patched.version(), 2);
        assert_eq!(patched.primary(77).as_deref(), Some("10.0.0.9:7009"));
        assert_eq!(table.primary(77).as_deref(), Some("10.0.0.1:7000"));
        assert_eq!(patched.primary(78).as_deref(), Some("10.0.0.1:7000"));
    }
}
