use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::cache::ClientCache;
use crate::command::Command;
use crate::config::ClientOption;
use crate::error::{Error, Result};
use crate::protocol::RespValue;
use crate::wire::{HandshakeMode, Wire};

/// Per-endpoint connection pool: one shared pipelined wire for ordinary
/// traffic plus a bounded set of dedicated wires for blocking commands and
/// transactions.
pub(crate) struct ConnPool {
    endpoint: Arc<str>,
    opt: Arc<ClientOption>,
    cache: Option<Arc<ClientCache>>,
    shared: tokio::sync::Mutex<Option<Arc<Wire>>>,
    idle: Mutex<Vec<Arc<Wire>>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl ConnPool {
    pub fn new(
        endpoint: Arc<str>,
        opt: Arc<ClientOption>,
        cache: Option<Arc<ClientCache>>,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(opt.blocking_pool_size));
        Arc::new(Self {
            endpoint,
            opt,
            cache,
            shared: tokio::sync::Mutex::new(None),
            idle: Mutex::new(Vec::new()),
            permits,
            closed: AtomicBool::new(false),
        })
    }

    /// The shared pipelined wire, dialing lazily and replacing a broken
    /// wire transparently.
    pub async fn shared_wire(&self) -> Result<Arc<Wire>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closing);
        }
        let mut guard = self.shared.lock().await;
        if let Some(wire) = guard.as_ref() {
            if !wire.is_broken() {
                return Ok(wire.clone());
            }
            debug!(endpoint = %self.endpoint, "replacing broken shared wire");
        }
        let wire = Wire::connect(
            self.endpoint.clone(),
            &self.opt,
            HandshakeMode::Data,
            self.cache.clone(),
        )
        .await?;
        *guard = Some(wire.clone());
        Ok(wire)
    }

    /// Pipelined dispatch. Read-only commands observing a broken wire are
    /// retried once against a fresh one.
    pub async fn do_cmd(&self, command: &Command) -> Result<RespValue> {
        let wire = self.shared_wire().await?;
        match wire.do_cmd(command).await {
            Err(err) if err.is_retriable() && command.is_readonly() => {
                debug!(endpoint = %self.endpoint, error = %err, "retrying read-only command on a fresh wire");
                let wire = self.shared_wire().await?;
                wire.do_cmd(command).await
            }
            other => other,
        }
    }

    /// Batched pipelined dispatch with the same retry-once rule, applied
    /// only when every command in the batch is read-only.
    pub async fn do_multi(&self, commands: &[Command]) -> Result<Vec<RespValue>> {
        let wire = self.shared_wire().await?;
        match wire.do_multi(commands).await {
            Err(err)
                if err.is_retriable() && commands.iter().all(Command::is_readonly) =>
            {
                let wire = self.shared_wire().await?;
                wire.do_multi(commands).await
            }
            other => other,
        }
    }

    /// Take a dedicated wire out of the pool, parking until one of the
    /// `blocking_pool_size` slots frees up.
    pub async fn acquire_dedicated(self: &Arc<Self>) -> Result<DedicatedWire> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted);
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolExhausted)?;

        loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some(wire) if wire.is_broken() => continue,
                Some(wire) => {
                    return Ok(DedicatedWire {
                        wire,
                        pool: self.clone(),
                        _permit: permit,
                        reusable: true,
                    })
                }
                None => break,
            }
        }

        let wire = Wire::connect(
            self.endpoint.clone(),
            &self.opt,
            HandshakeMode::Dedicated,
            None,
        )
        .await?;
        Ok(DedicatedWire {
            wire,
            pool: self.clone(),
            _permit: permit,
            reusable: true,
        })
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let shared = self.shared.lock().await.take();
        if let Some(wire) = shared {
            wire.close(true).await;
        }
        let idle: Vec<_> = std::mem::take(&mut *self.idle.lock());
        for wire in idle {
            wire.close(false).await;
        }
    }
}

/// Exclusive hold on a wire for the duration of a blocking command,
/// transaction, or subscription. Returned to the pool on drop unless it
/// broke or was discarded.
pub(crate) struct DedicatedWire {
    wire: Arc<Wire>,
    pool: Arc<ConnPool>,
    _permit: OwnedSemaphorePermit,
    reusable: bool,
}

impl DedicatedWire {
    pub fn wire(&self) -> &Arc<Wire> {
        &self.wire
    }

    /// Mark the wire as tainted; it will be torn down instead of pooled.
    /// Used after subscriptions, whose server-side state would leak into
    /// the next borrower.
    pub fn discard(mut self) {
        self.reusable = false;
    }
}

impl Drop for DedicatedWire {
    fn drop(&mut self) {
        if self.reusable
            && !self.wire.is_broken()
            && !self.pool.closed.load(Ordering::Acquire)
        {
            self.pool.idle.lock().push(self.wire.clone());
        }
    }
}
