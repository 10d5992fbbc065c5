use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::ClientCache;
use crate::command::Command;
use crate::config::ClientOption;
use crate::error::{Error, Result};
use crate::metrics;
use crate::pipeline::{Pipeline, PipelineOptions, Subscriptions};
use crate::protocol::RespValue;

/// Handshake flavor for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeMode {
    /// Shared pipelined wire: full handshake including `CLIENT TRACKING`
    /// when a cache is attached.
    Data,
    /// Dedicated wire for blocking/transactional use: no tracking.
    Dedicated,
    /// Sentinel control connection: sentinel credentials, RESP2 fallback,
    /// no SELECT/tracking.
    Sentinel,
}

/// A live connection: one pipeline plus its identity and lifecycle.
///
/// Wires are created lazily, destroyed on unrecoverable I/O errors, and
/// replaced transparently by their owning pool.
pub(crate) struct Wire {
    endpoint: Arc<str>,
    pipeline: Pipeline,
    subscriptions: Arc<Subscriptions>,
    client_id: i64,
}

impl Wire {
    pub async fn connect(
        endpoint: Arc<str>,
        opt: &ClientOption,
        mode: HandshakeMode,
        cache: Option<Arc<ClientCache>>,
    ) -> Result<Arc<Wire>> {
        let stream = match timeout(opt.connect_timeout(), TcpStream::connect(endpoint.as_ref()))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(Error::broken(format!("connect to {endpoint} failed: {err}")))
            }
            Err(_) => return Err(Error::broken(format!("connect to {endpoint} timed out"))),
        };
        stream.set_nodelay(true)?;
        apply_keepalive(&stream, &endpoint);

        let tracking = cache.is_some() && mode == HandshakeMode::Data;
        let subscriptions = Arc::new(Subscriptions::new());
        let pipeline = Pipeline::spawn(
            endpoint.clone(),
            stream,
            PipelineOptions::from_option(opt),
            cache,
            subscriptions.clone(),
        );
        metrics::wire_connect();

        let client_id = handshake(&pipeline, opt, mode, tracking).await?;
        debug!(endpoint = %endpoint, client_id, "wire established");
        Ok(Arc::new(Wire {
            endpoint,
            pipeline,
            subscriptions,
            client_id,
        }))
    }

    pub fn endpoint(&self) -> &Arc<str> {
        &self.endpoint
    }

    pub fn is_broken(&self) -> bool {
        self.pipeline.is_broken()
    }

    pub fn subscriptions(&self) -> &Arc<Subscriptions> {
        &self.subscriptions
    }

    /// Send one command, returning the correlated reply frame. Server
    /// error frames come back as values.
    pub async fn do_cmd(&self, command: &Command) -> Result<RespValue> {
        self.pipeline.call(command).await
    }

    /// Send a batch back-to-back and collect replies in submission order.
    pub async fn do_multi(&self, commands: &[Command]) -> Result<Vec<RespValue>> {
        self.pipeline.call_multi(commands).await
    }

    pub async fn close(&self, send_quit: bool) {
        debug!(endpoint = %self.endpoint, client_id = self.client_id, "closing wire");
        self.pipeline.close(send_quit).await;
    }
}

/// `HELLO 3` ladder, then SELECT / CLIENT ID / CLIENT TRACKING as the mode
/// requires. All handshake commands ride the ordinary pipeline, so a push
/// frame arriving in between cannot disturb reply correlation.
async fn handshake(
    pipeline: &Pipeline,
    opt: &ClientOption,
    mode: HandshakeMode,
    tracking: bool,
) -> Result<i64> {
    let credentials = match mode {
        HandshakeMode::Sentinel => opt
            .sentinel
            .as_ref()
            .and_then(|sentinel| sentinel.hello_credentials()),
        _ => opt.hello_credentials(),
    };

    let mut tokens: Vec<Vec<u8>> = vec![b"HELLO".to_vec(), b"3".to_vec()];
    if let Some((username, password)) = &credentials {
        tokens.push(b"AUTH".to_vec());
        tokens.push(username.clone().into_bytes());
        tokens.push(password.clone().into_bytes());
    }
    if mode != HandshakeMode::Sentinel {
        if let Some(name) = &opt.client_name {
            tokens.push(b"SETNAME".to_vec());
            tokens.push(name.clone().into_bytes());
        }
    }

    let hello_reply = pipeline.call(&Command::new(tokens)?).await?;
    if let Some(message) = hello_reply.error_text() {
        if mode == HandshakeMode::Sentinel {
            // older sentinels speak RESP2 only; fall back to legacy AUTH
            legacy_auth(pipeline, credentials).await?;
        } else {
            return Err(Error::broken(format!(
                "HELLO rejected: {}",
                String::from_utf8_lossy(message)
            )));
        }
    }

    if mode == HandshakeMode::Sentinel {
        return Ok(0);
    }

    if let Some(db) = opt.select_db {
        let reply = pipeline
            .call(&Command::new(["SELECT".to_string(), db.to_string()])?)
            .await?;
        if let Some(message) = reply.error_text() {
            return Err(Error::broken(format!(
                "SELECT {db} rejected: {}",
                String::from_utf8_lossy(message)
            )));
        }
    }

    let id_reply = pipeline.call(&Command::new(["CLIENT", "ID"])?).await?;
    let client_id = id_reply
        .as_int()
        .ok_or_else(|| Error::protocol("CLIENT ID reply is not an integer"))?;

    if tracking {
        // invalidations are redirected to this very connection, so they
        // arrive as push frames on the pipeline that owns the cache
        let reply = pipeline
            .call(&Command::new([
                "CLIENT".to_string(),
                "TRACKING".to_string(),
                "ON".to_string(),
                "REDIRECT".to_string(),
                client_id.to_string(),
            ])?)
            .await?;
        if let Some(message) = reply.error_text() {
            return Err(Error::broken(format!(
                "CLIENT TRACKING rejected: {}",
                String::from_utf8_lossy(message)
            )));
        }
    }

    Ok(client_id)
}

async fn legacy_auth(pipeline: &Pipeline, credentials: Option<(String, String)>) -> Result<()> {
    let (username, password) = match credentials {
        Some(credentials) => credentials,
        None => return Ok(()),
    };
    let command = if username == "default" {
        Command::new(["AUTH".to_string(), password])?
    } else {
        Command::new(["AUTH".to_string(), username, password])?
    };
    let reply = pipeline.call(&command).await?;
    if let Some(message) = reply.error_text() {
        return Err(Error::broken(format!(
            "AUTH rejected: {}",
            String::from_utf8_lossy(message)
        )));
    }
    Ok(())
}

#[cfg(any(unix, windows))]
fn apply_keepalive(stream: &TcpStream, endpoint: &str) {
    use std::time::Duration;

    use socket2::{SockRef, TcpKeepalive};

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(60));
    if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(endpoint = %endpoint, error = %err, "failed to set TCP keepalive");
    }
}

#[cfg(not(any(unix, windows)))]
fn apply_keepalive(_stream: &TcpStream, _endpoint: &str) {}
