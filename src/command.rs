use std::hash::Hasher;

use ahash::AHasher;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::utils::key_slot;

/// Pub/sub classification of a command name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    None,
    Channel,
    Pattern,
    Unsubscribe,
    PatternUnsubscribe,
}

impl SubscriptionKind {
    pub fn is_subscribe(self) -> bool {
        matches!(self, SubscriptionKind::Channel | SubscriptionKind::Pattern)
    }

    pub fn is_subscription_family(self) -> bool {
        !matches!(self, SubscriptionKind::None)
    }
}

/// A fully built command: an ordered token sequence plus routing metadata.
///
/// This is the contract the external command-builder DSL produces. The
/// library itself only needs the token list, the readonly/blocking/no-reply
/// flags, the declared cache key, and the slot derived from the designated
/// keys.
#[derive(Debug, Clone)]
pub struct Command {
    tokens: Vec<Bytes>,
    readonly: bool,
    blocking: bool,
    no_reply: bool,
    cache_key: Option<Bytes>,
    fingerprint: u64,
    slot: Option<u16>,
    cross_slot: bool,
}

impl Command {
    /// Start building a command from its name token.
    pub fn build(name: impl AsRef<[u8]>) -> CommandBuilder {
        CommandBuilder {
            tokens: vec![Bytes::copy_from_slice(name.as_ref())],
            first_key: None,
            slot: None,
            cross_slot: false,
            readonly: None,
            blocking: None,
        }
    }

    /// Build a command from raw tokens, inferring flags and the key slot
    /// from the command name. The second token is treated as the key unless
    /// the command is known to be keyless.
    pub fn new<I, T>(tokens: I) -> Result<Command>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let tokens: Vec<Bytes> = tokens
            .into_iter()
            .map(|token| Bytes::copy_from_slice(token.as_ref()))
            .collect();
        if tokens.is_empty() {
            return Err(Error::Command("command must contain at least one token".into()));
        }
        let mut builder = CommandBuilder {
            tokens: vec![tokens[0].clone()],
            first_key: None,
            slot: None,
            cross_slot: false,
            readonly: None,
            blocking: None,
        };
        let keyless = is_keyless(&upper_name(&tokens[0]));
        for (index, token) in tokens.into_iter().enumerate().skip(1) {
            if index == 1 && !keyless {
                builder = builder.key(token);
            } else {
                builder = builder.arg(token);
            }
        }
        Ok(builder.build())
    }

    pub fn tokens(&self) -> &[Bytes] {
        &self.tokens
    }

    pub fn name(&self) -> &[u8] {
        self.tokens.first().map(|token| token.as_ref()).unwrap_or(&[])
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn is_no_reply(&self) -> bool {
        self.no_reply
    }

    /// The canonical key the server will track for this command, when it
    /// was built for caching.
    pub fn cache_key(&self) -> Option<&Bytes> {
        self.cache_key.as_ref()
    }

    /// Hash over the full token sequence, distinguishing e.g. `GET k` from
    /// `HGET k f` under the same cache key.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn slot(&self) -> Option<u16> {
        self.slot
    }

    /// True when the declared keys span more than one cluster slot.
    pub fn is_cross_slot(&self) -> bool {
        self.cross_slot
    }

    pub fn subscription_kind(&self) -> SubscriptionKind {
        match upper_name(self.name()).as_slice() {
            b"SUBSCRIBE" | b"SSUBSCRIBE" => SubscriptionKind::Channel,
            b"PSUBSCRIBE" => SubscriptionKind::Pattern,
            b"UNSUBSCRIBE" | b"SUNSUBSCRIBE" => SubscriptionKind::Unsubscribe,
            b"PUNSUBSCRIBE" => SubscriptionKind::PatternUnsubscribe,
            _ => SubscriptionKind::None,
        }
    }

    /// Confirmation frames the server will emit for this command: one per
    /// channel argument for the subscribe family, zero otherwise.
    pub fn expected_acks(&self) -> usize {
        if self.subscription_kind().is_subscription_family() {
            self.tokens.len().saturating_sub(1).max(1)
        } else {
            0
        }
    }
}

/// Minimal builder implementing the external command-builder contract:
/// `Keys` tokens participate in slot routing, `Args` tokens do not.
#[derive(Debug)]
pub struct CommandBuilder {
    tokens: Vec<Bytes>,
    first_key: Option<Bytes>,
    slot: Option<u16>,
    cross_slot: bool,
    readonly: Option<bool>,
    blocking: Option<bool>,
}

impl CommandBuilder {
    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        let key = Bytes::copy_from_slice(key.as_ref());
        let slot = key_slot(&key);
        match self.slot {
            Some(existing) if existing != slot => self.cross_slot = true,
            Some(_) => {}
            None => self.slot = Some(slot),
        }
        if self.first_key.is_none() {
            self.first_key = Some(key.clone());
        }
        self.tokens.push(key);
        self
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.tokens.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    pub fn args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        for arg in args {
            self.tokens.push(Bytes::copy_from_slice(arg.as_ref()));
        }
        self
    }

    /// Mark the command read-only; read-only commands are retried once on a
    /// fresh wire after a connection failure.
    pub fn readonly(mut self) -> Self {
        self.readonly = Some(true);
        self
    }

    /// Mark the command blocking; blocking commands run on dedicated wires.
    pub fn blocking(mut self) -> Self {
        self.blocking = Some(true);
        self
    }

    pub fn build(self) -> Command {
        let name = upper_name(&self.tokens[0]);
        let readonly = self.readonly.unwrap_or_else(|| is_readonly_name(&name));
        let blocking = self
            .blocking
            .unwrap_or_else(|| is_blocking_command(&name, &self.tokens));
        let subscription = matches!(
            name.as_slice(),
            b"SUBSCRIBE" | b"PSUBSCRIBE" | b"SSUBSCRIBE" | b"UNSUBSCRIBE" | b"PUNSUBSCRIBE"
                | b"SUNSUBSCRIBE"
        );
        let fingerprint = fingerprint_tokens(&self.tokens);
        Command {
            tokens: self.tokens,
            readonly,
            blocking,
            no_reply: subscription,
            cache_key: None,
            fingerprint,
            slot: self.slot,
            cross_slot: self.cross_slot,
        }
    }

    /// Finish building a cacheable command. The first declared key becomes
    /// the cache key the server tracks.
    pub fn cache(self) -> Result<Command> {
        if self.first_key.is_none() {
            return Err(Error::Command(
                "cacheable command must declare at least one key".into(),
            ));
        }
        let first_key = self.first_key.clone();
        let mut command = self.build();
        if command.blocking {
            return Err(Error::Command("blocking commands are not cacheable".into()));
        }
        command.cache_key = first_key;
        Ok(command)
    }
}

fn fingerprint_tokens(tokens: &[Bytes]) -> u64 {
    let mut hasher = AHasher::default();
    for token in tokens {
        hasher.write_usize(token.len());
        hasher.write(token);
    }
    hasher.finish()
}

fn upper_name(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b.to_ascii_uppercase()).collect()
}

fn is_keyless(name: &[u8]) -> bool {
    matches!(
        name,
        b"PING"
            | b"HELLO"
            | b"AUTH"
            | b"SELECT"
            | b"QUIT"
            | b"RESET"
            | b"CLIENT"
            | b"CLUSTER"
            | b"CONFIG"
            | b"INFO"
            | b"COMMAND"
            | b"FLUSHALL"
            | b"FLUSHDB"
            | b"SENTINEL"
            | b"SUBSCRIBE"
            | b"PSUBSCRIBE"
            | b"UNSUBSCRIBE"
            | b"PUNSUBSCRIBE"
            | b"PUBLISH"
            | b"MULTI"
            | b"EXEC"
            | b"DISCARD"
            | b"ASKING"
            | b"READONLY"
            | b"READWRITE"
    )
}

fn is_readonly_name(name: &[u8]) -> bool {
    matches!(
        name,
        b"GET" | b"MGET" | b"EXISTS" | b"TTL" | b"PTTL" | b"STRLEN" | b"TYPE" | b"HGET"
            | b"HMGET" | b"HGETALL" | b"HLEN" | b"HEXISTS" | b"SCARD" | b"SMEMBERS"
            | b"SISMEMBER" | b"SRANDMEMBER" | b"ZRANGE" | b"ZRANGEBYSCORE" | b"ZREVRANGE"
            | b"ZRANK" | b"ZREVRANK" | b"ZSCORE" | b"ZCARD" | b"ZCOUNT" | b"LINDEX" | b"LLEN"
            | b"LRANGE" | b"XRANGE" | b"XREVRANGE" | b"XLEN" | b"GETRANGE" | b"BITCOUNT"
            | b"DUMP" | b"KEYS" | b"SCAN" | b"RANDOMKEY"
    )
}

fn is_blocking_command(name: &[u8], tokens: &[Bytes]) -> bool {
    match name {
        b"BLPOP" | b"BRPOP" | b"BRPOPLPUSH" | b"BLMOVE" | b"BLMPOP" | b"BZPOPMIN"
        | b"BZPOPMAX" | b"BZMPOP" | b"WAIT" => true,
        b"XREAD" | b"XREADGROUP" => tokens
            .iter()
            .any(|token| token.eq_ignore_ascii_case(b"BLOCK")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, SubscriptionKind};
    use crate::utils::key_slot;

    #[test]
    fn builder_tracks_slot_of_declared_keys() {
        let cmd = Command::build("GET").key("user:1").build();
        assert_eq!(cmd.slot(), Some(key_slot(b"user:1")));
        assert!(cmd.is_readonly());
        assert!(!cmd.is_blocking());
    }

    #[test]
    fn cross_slot_keys_are_flagged() {
        let same = Command::build("MGET").key("a{tag}").key("b{tag}").build();
        assert!(!same.is_cross_slot());

        let crossed = Command::build("MGET").key("foo").key("bar").build();
        assert!(crossed.is_cross_slot());
    }

    #[test]
    fn cacheable_commands_carry_key_and_fingerprint() {
        let get = Command::build("GET").key("k").cache().unwrap();
        let hget = Command::build("HGET").key("k").arg("f").cache().unwrap();
        assert_eq!(get.cache_key(), hget.cache_key());
        assert_ne!(get.fingerprint(), hget.fingerprint());
    }

    #[test]
    fn cache_requires_a_key() {
        assert!(Command::build("PING").cache().is_err());
    }

    #[test]
    fn blocking_commands_are_detected() {
        let bzpop = Command::new(["BZPOPMIN", "zs", "0"]).unwrap();
        assert!(bzpop.is_blocking());

        let xread = Command::new(["XREAD", "COUNT", "1", "BLOCK", "0", "STREAMS", "s", "$"]);
        assert!(xread.unwrap().is_blocking());

        let plain_xread = Command::new(["XREAD", "COUNT", "1", "STREAMS", "s", "0"]).unwrap();
        assert!(!plain_xread.is_blocking());
    }

    #[test]
    fn subscribe_family_expects_one_ack_per_channel() {
        let sub = Command::new(["SUBSCRIBE", "a", "b", "c"]).unwrap();
        assert_eq!(sub.subscription_kind(), SubscriptionKind::Channel);
        assert_eq!(sub.expected_acks(), 3);
        assert!(sub.is_no_reply());

        let get = Command::new(["GET", "k"]).unwrap();
        assert_eq!(get.expected_acks(), 0);
    }

    #[test]
    fn keyless_commands_have_no_slot() {
        let ping = Command::new(["PING"]).unwrap();
        assert_eq!(ping.slot(), None);
        let publish = Command::new(["PUBLISH", "ch", "msg"]).unwrap();
        assert_eq!(publish.slot(), None);
    }
}
