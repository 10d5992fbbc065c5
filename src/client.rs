use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::cache::{ClientCache, Flight};
use crate::cluster::{parse_redirect, ClusterRouter};
use crate::command::Command;
use crate::config::ClientOption;
use crate::error::{Error, Result};
use crate::pipeline::PubSubMessage;
use crate::pool::{ConnPool, DedicatedWire};
use crate::protocol::RespValue;
use crate::sentinel::SentinelRouter;

/// Reply from [`Client::do_cache`].
#[derive(Debug, Clone)]
pub struct CacheReply {
    pub value: RespValue,
    /// True when the value was served locally (including joins onto an
    /// in-flight fetch); false only for the lookup that hit the server.
    pub cache_hit: bool,
}

#[derive(Clone)]
enum Router {
    Standalone(Arc<ConnPool>),
    Cluster(Arc<ClusterRouter>),
    Sentinel(Arc<SentinelRouter>),
}

/// The public client surface over all three deployment topologies.
///
/// One `Client` multiplexes any number of concurrent callers over a small
/// set of pipelined wires; blocking commands and subscriptions transparently
/// move to dedicated wires so they cannot starve pipelined traffic.
pub struct Client {
    opt: Arc<ClientOption>,
    cache: Option<Arc<ClientCache>>,
    router: Router,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl Client {
    /// Connect according to the options: sentinel discovery when
    /// `sentinel` is set, otherwise cluster mode with a transparent
    /// fallback to standalone when the seed reports cluster support
    /// disabled.
    pub async fn new(opt: ClientOption) -> Result<Client> {
        opt.ensure_valid()?;
        let opt = Arc::new(opt);
        let cache = if opt.disable_cache {
            None
        } else {
            Some(Arc::new(ClientCache::new(opt.cache_size_each_conn)))
        };

        let router = if opt.sentinel.is_some() {
            Router::Sentinel(SentinelRouter::new(opt.clone(), cache.clone()).await?)
        } else {
            match ClusterRouter::new(opt.clone(), cache.clone(), opt.init_address.clone()).await? {
                Some(cluster) => Router::Cluster(cluster),
                None => {
                    debug!("seed reports cluster support disabled; running standalone");
                    let endpoint: Arc<str> = Arc::from(opt.init_address[0].as_str());
                    Router::Standalone(ConnPool::new(endpoint, opt.clone(), cache.clone()))
                }
            }
        };

        let (close_tx, _) = watch::channel(false);
        Ok(Client {
            opt,
            cache,
            router,
            closed: AtomicBool::new(false),
            close_tx,
        })
    }

    /// Execute one command and return its reply. Server error replies
    /// surface as [`Error::Server`]; null replies are values.
    pub async fn do_cmd(&self, command: Command) -> Result<RespValue> {
        self.check_open()?;
        if command.subscription_kind().is_subscription_family() {
            // a subscription would wedge the shared pipelined wire
            return Err(Error::Command(
                "subscribe commands must go through receive".into(),
            ));
        }
        let reply = self.route(&command).await?;
        finish(reply)
    }

    async fn route(&self, command: &Command) -> Result<RespValue> {
        match &self.router {
            Router::Standalone(pool) => {
                if command.is_blocking() {
                    let dedicated = pool.acquire_dedicated().await?;
                    dedicated.wire().do_cmd(command).await
                } else {
                    pool.do_cmd(command).await
                }
            }
            Router::Sentinel(sentinel) => {
                let pool = sentinel.current_pool().await?;
                if command.is_blocking() {
                    let dedicated = pool.acquire_dedicated().await?;
                    dedicated.wire().do_cmd(command).await
                } else {
                    pool.do_cmd(command).await
                }
            }
            Router::Cluster(cluster) => cluster.do_cmd(command).await,
        }
    }

    /// Cached execution with single-flight per `(cache key, fingerprint)`.
    ///
    /// The entry TTL is the requested `ttl` capped by the server's PTTL
    /// hint, which is pipelined immediately ahead of the command on the
    /// same wire.
    pub async fn do_cache(&self, command: Command, ttl: Duration) -> Result<CacheReply> {
        self.check_open()?;
        let key = match command.cache_key() {
            Some(key) => key.clone(),
            None => {
                return Err(Error::Command(
                    "do_cache requires a command built for caching".into(),
                ))
            }
        };
        let cache = match &self.cache {
            Some(cache) => cache.clone(),
            None => {
                let value = self.do_cmd(command).await?;
                return Ok(CacheReply {
                    value,
                    cache_hit: false,
                });
            }
        };

        match cache.begin(&key, command.fingerprint()) {
            Flight::Hit(value) => Ok(CacheReply {
                value,
                cache_hit: true,
            }),
            Flight::Join(rx) => match rx.await {
                Ok(Ok(value)) => Ok(CacheReply {
                    value: finish(value)?,
                    cache_hit: true,
                }),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(Error::broken("cache fetch was abandoned")),
            },
            Flight::Fetch(ticket) => match self.fetch_for_cache(&command, &key).await {
                Ok((value, pttl_hint)) => {
                    cache.complete_fetch(ticket, &value, ttl, pttl_hint);
                    Ok(CacheReply {
                        value: finish(value)?,
                        cache_hit: false,
                    })
                }
                Err(err) => {
                    cache.fail_fetch(ticket, &err);
                    Err(err)
                }
            },
        }
    }

    /// Issue `PTTL key` and the command in one flush on the wire whose
    /// tracking scope covers the key.
    async fn fetch_for_cache(
        &self,
        command: &Command,
        key: &Bytes,
    ) -> Result<(RespValue, Option<i64>)> {
        let pttl = Command::build("PTTL").key(key).build();
        let batch = [pttl, command.clone()];
        let replies = match &self.router {
            Router::Standalone(pool) => pool.do_multi(&batch).await?,
            Router::Sentinel(sentinel) => sentinel.current_pool().await?.do_multi(&batch).await?,
            Router::Cluster(cluster) => {
                let pool = cluster.pool_for_command(command)?;
                let replies = pool.do_multi(&batch).await?;
                if replies.get(1).map(parse_redirect_hit).unwrap_or(false) {
                    // the slot moved under us: let the router chase the
                    // redirect; the TTL hint is lost for this fill
                    let value = cluster.do_cmd(command).await?;
                    return Ok((value, None));
                }
                replies
            }
        };
        let mut replies = replies.into_iter();
        let pttl_reply = replies
            .next()
            .ok_or_else(|| Error::protocol("missing PTTL reply"))?;
        let value = replies
            .next()
            .ok_or_else(|| Error::protocol("missing command reply"))?;
        let hint = pttl_reply.as_int().filter(|millis| *millis >= 0);
        Ok((value, hint))
    }

    /// Run `f` against a dedicated wire, for transactions and command
    /// streaks that need connection affinity. The wire binds lazily on the
    /// first command (so cluster deployments can route by its slot) and
    /// returns to the pool afterwards.
    pub async fn dedicated<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(DedicatedClient) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.check_open()?;
        let handle = DedicatedClient {
            router: self.router.clone(),
            guard: None,
        };
        f(handle).await
    }

    /// Subscribe and stream messages into `handler` until the client
    /// closes ([`Error::Closing`]) or the wire breaks
    /// ([`Error::ConnBroken`]).
    pub async fn receive<F>(&self, command: Command, mut handler: F) -> Result<()>
    where
        F: FnMut(PubSubMessage) + Send,
    {
        self.check_open()?;
        let kind = command.subscription_kind();
        if !kind.is_subscribe() {
            return Err(Error::Command("receive requires a subscribe command".into()));
        }

        // subscriptions monopolize a connection, so they always run on a
        // dedicated wire
        let dedicated = match &self.router {
            Router::Standalone(pool) => pool.acquire_dedicated().await?,
            Router::Sentinel(sentinel) => {
                sentinel.current_pool().await?.acquire_dedicated().await?
            }
            Router::Cluster(cluster) => cluster.dedicated_for(&command).await?,
        };
        let wire = dedicated.wire().clone();

        let (tx, mut rx) = mpsc::unbounded_channel();
        for name in &command.tokens()[1..] {
            if kind == crate::command::SubscriptionKind::Pattern {
                wire.subscriptions().register_pattern(name.clone(), tx.clone());
            } else {
                wire.subscriptions().register_channel(name.clone(), tx.clone());
            }
        }
        drop(tx);

        let confirm = wire.do_cmd(&command).await?;
        if let Some(message) = confirm.error_text() {
            dedicated.discard();
            return Err(Error::Server(String::from_utf8_lossy(message).into_owned()));
        }

        let mut close_rx = self.close_tx.subscribe();
        if *close_rx.borrow() {
            dedicated.discard();
            return Err(Error::Closing);
        }
        let result = loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => handler(message),
                    None => {
                        // the registry only drains when the wire tears down
                        break if self.closed.load(Ordering::Acquire) {
                            Err(Error::Closing)
                        } else {
                            Err(Error::broken("subscription wire failed"))
                        };
                    }
                },
                _ = close_rx.changed() => break Err(Error::Closing),
            }
        };
        // server-side subscription state makes the wire unfit for reuse
        dedicated.discard();
        result
    }

    /// Close the client: all pending completions fail with
    /// [`Error::Closing`], pools drain, and subscriptions terminate.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.close_tx.send(true);
        match &self.router {
            Router::Standalone(pool) => pool.close().await,
            Router::Cluster(cluster) => cluster.close().await,
            Router::Sentinel(sentinel) => sentinel.close().await,
        }
    }

    /// The active configuration.
    pub fn option(&self) -> &ClientOption {
        &self.opt
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closing);
        }
        Ok(())
    }
}

/// Exclusive handle passed to [`Client::dedicated`] callbacks.
pub struct DedicatedClient {
    router: Router,
    guard: Option<DedicatedWire>,
}

impl DedicatedClient {
    async fn bind(&mut self, command: &Command) -> Result<Arc<crate::wire::Wire>> {
        if self.guard.is_none() {
            let guard = match &self.router {
                Router::Standalone(pool) => pool.acquire_dedicated().await?,
                Router::Sentinel(sentinel) => {
                    sentinel.current_pool().await?.acquire_dedicated().await?
                }
                Router::Cluster(cluster) => cluster.dedicated_for(command).await?,
            };
            self.guard = Some(guard);
        }
        Ok(self
            .guard
            .as_ref()
            .map(|guard| guard.wire().clone())
            .expect("dedicated wire was just bound"))
    }

    /// Execute one command on the bound wire.
    pub async fn do_cmd(&mut self, command: Command) -> Result<RespValue> {
        let wire = self.bind(&command).await?;
        finish(wire.do_cmd(&command).await?)
    }

    /// Flush a batch in one write and collect the replies in order; this is
    /// how `MULTI ... EXEC` rides a dedicated wire.
    pub async fn do_multi(&mut self, commands: Vec<Command>) -> Result<Vec<RespValue>> {
        let first = commands
            .first()
            .ok_or_else(|| Error::Command("do_multi requires at least one command".into()))?;
        let wire = self.bind(first).await?;
        let replies = wire.do_multi(&commands).await?;
        replies.into_iter().map(finish).collect()
    }
}

fn finish(value: RespValue) -> Result<RespValue> {
    match value.error_text() {
        Some(message) => Err(Error::Server(String::from_utf8_lossy(message).into_owned())),
        None => Ok(value),
    }
}

fn parse_redirect_hit(value: &RespValue) -> bool {
    parse_redirect(value).is_some()
}
