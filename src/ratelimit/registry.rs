//! Limiter registry: builds limiters from configuration and resolves them
//! for connections.
//!
//! Every limiter is reachable through one or more [`LimiterKey`]s. A single
//! configuration entry can populate all three scopes at once; keys either
//! alias the entry's shared limiter or get an independent one, depending on
//! the entry's `*_independent` flags.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::context::ConnContext;
use super::limiter::RateLimiter;
use crate::config::{parse_bytes, parse_duration, LimiterOptions};
use crate::conn::{LimitedPacket, LimitedStream, PacketConn, StreamConn};
use crate::error::{Result, ShaperError};

/// The dimension a limiter is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Tag referenced by a routing rule
    Tag,
    /// Authenticated user
    User,
    /// Inbound listener
    Inbound,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Tag => write!(f, "tag"),
            Scope::User => write!(f, "user"),
            Scope::Inbound => write!(f, "inbound"),
        }
    }
}

/// Registry key for a limiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    pub scope: Scope,
    pub name: String,
}

impl LimiterKey {
    pub fn new(scope: Scope, name: &str) -> Self {
        Self {
            scope,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// Who a connection belongs to and where it came in.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnMetadata<'a> {
    pub user: Option<&'a str>,
    pub inbound: Option<&'a str>,
}

impl<'a> ConnMetadata<'a> {
    pub fn new(user: Option<&'a str>, inbound: Option<&'a str>) -> Self {
        Self { user, inbound }
    }
}

/// Numeric budget parsed from one [`LimiterOptions`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Budget {
    download: u64,
    upload: u64,
    timeout: Duration,
}

impl Budget {
    fn parse(index: usize, options: &LimiterOptions) -> Result<Self> {
        let invalid = |reason: String| ShaperError::InvalidConfig { index, reason };

        let download = match non_empty(&options.download) {
            Some(s) => parse_bytes(s).map_err(|e| invalid(format!("download: {}", e)))?,
            None => 0,
        };
        let upload = match non_empty(&options.upload) {
            Some(s) => parse_bytes(s).map_err(|e| invalid(format!("upload: {}", e)))?,
            None => 0,
        };
        let timeout = match non_empty(&options.timeout) {
            Some(s) => parse_duration(s).map_err(|e| invalid(format!("timeout: {}", e)))?,
            None => Duration::ZERO,
        };

        if download == 0 && upload == 0 && timeout.is_zero() {
            return Err(invalid(
                "download/upload/timeout, at least one must be set".to_string(),
            ));
        }
        Ok(Self {
            download,
            upload,
            timeout,
        })
    }

    fn build(&self) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(self.download, self.upload, self.timeout))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Owns every configured [`RateLimiter`] and maps keys onto them.
///
/// Read-only once built; share it behind an `Arc`.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: HashMap<LimiterKey, Arc<RateLimiter>>,
}

impl LimiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configuration entries.
    ///
    /// Entries that fail validation are logged and skipped; the rest load.
    pub fn from_options(options: &[LimiterOptions]) -> Self {
        Self::load(options).0
    }

    /// Like [`from_options`](Self::from_options), also handing back the
    /// error of every skipped entry.
    pub fn load(options: &[LimiterOptions]) -> (Self, Vec<ShaperError>) {
        let mut registry = Self::new();
        let mut errors = Vec::new();
        for (index, entry) in options.iter().enumerate() {
            match registry.create_limiter(index, entry) {
                Ok(()) => info!(
                    id = index,
                    tag = entry.tag.as_deref().unwrap_or_default(),
                    users = ?entry.auth_user.0,
                    inbounds = ?entry.inbound.0,
                    download = entry.download.as_deref().unwrap_or_default(),
                    upload = entry.upload.as_deref().unwrap_or_default(),
                    timeout = entry.timeout.as_deref().unwrap_or_default(),
                    "Limiter loaded"
                ),
                Err(e) => {
                    error!(id = index, error = %e, "Limiter skipped");
                    errors.push(e);
                }
            }
        }
        (registry, errors)
    }

    /// Validate one entry and register its limiters.
    ///
    /// Nothing is registered when validation fails. Keys already present are
    /// replaced by later entries.
    pub fn create_limiter(&mut self, index: usize, options: &LimiterOptions) -> Result<()> {
        let budget = Budget::parse(index, options)?;

        let tag = non_empty(&options.tag);
        if tag.is_none() && options.auth_user.is_empty() && options.inbound.is_empty() {
            return Err(ShaperError::InvalidConfig {
                index,
                reason: "tag/user/inbound, at least one must be set".to_string(),
            });
        }

        let shared = (tag.is_some() || !options.auth_user_independent || !options.inbound_independent)
            .then(|| budget.build());
        let pick = |independent: bool| match (&shared, independent) {
            (Some(shared), false) => Arc::clone(shared),
            _ => budget.build(),
        };

        if let Some(tag) = tag {
            self.insert(LimiterKey::new(Scope::Tag, tag), pick(false));
        }
        for user in options.auth_user.iter() {
            self.insert(LimiterKey::new(Scope::User, user), pick(options.auth_user_independent));
        }
        for inbound in options.inbound.iter() {
            self.insert(LimiterKey::new(Scope::Inbound, inbound), pick(options.inbound_independent));
        }
        Ok(())
    }

    fn insert(&mut self, key: LimiterKey, limiter: Arc<RateLimiter>) {
        debug!(key = %key, "Registering limiter");
        self.limiters.insert(key, limiter);
    }

    /// Look up the limiter registered for a key.
    pub fn get(&self, scope: Scope, name: &str) -> Option<&Arc<RateLimiter>> {
        self.limiters.get(&LimiterKey::new(scope, name))
    }

    /// Number of registered keys (not distinct limiters).
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Limiters applying to a connection, in order: rule tags, then user,
    /// then inbound.
    ///
    /// Keys without an entry are skipped. The same limiter reached through
    /// two keys is returned twice and so throttles the connection twice.
    pub fn resolve<I, S>(&self, rule_tags: I, metadata: &ConnMetadata<'_>) -> Vec<Arc<RateLimiter>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags = rule_tags
            .into_iter()
            .filter_map(|tag| self.get(Scope::Tag, tag.as_ref()).cloned());
        let user = metadata.user.and_then(|user| self.get(Scope::User, user)).cloned();
        let inbound = metadata
            .inbound
            .and_then(|inbound| self.get(Scope::Inbound, inbound))
            .cloned();

        tags.chain(user).chain(inbound).collect()
    }

    /// Wrap a stream in every limiter that applies to it.
    ///
    /// The first resolved limiter ends up innermost. With no applicable
    /// limiter the connection is handed back untouched.
    pub fn wrap_stream<I, S>(
        &self,
        ctx: &ConnContext,
        conn: Box<dyn StreamConn>,
        rule_tags: I,
        metadata: &ConnMetadata<'_>,
    ) -> Box<dyn StreamConn>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.resolve(rule_tags, metadata)
            .into_iter()
            .fold(conn, |conn, limiter| -> Box<dyn StreamConn> {
                Box::new(LimitedStream::new(conn, limiter, ctx.clone()))
            })
    }

    /// Wrap a datagram connection in every limiter that applies to it.
    pub fn wrap_packet<I, S>(
        &self,
        ctx: &ConnContext,
        conn: Box<dyn PacketConn>,
        rule_tags: I,
        metadata: &ConnMetadata<'_>,
    ) -> Box<dyn PacketConn>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.resolve(rule_tags, metadata)
            .into_iter()
            .fold(conn, |conn, limiter| -> Box<dyn PacketConn> {
                Box::new(LimitedPacket::new(conn, limiter, ctx.clone()))
            })
    }
}
