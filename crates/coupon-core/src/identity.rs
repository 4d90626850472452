//! Throttling keys derived from request signals.
//!
//! A visitor is identified by up to three independent keys:
//!
//! - [`ThrottleKey::Ip`]: SHA-256 of the salted client IP. Raw addresses never
//!   leave this module.
//! - [`ThrottleKey::Cookie`]: the server-issued UUID stored in the identity
//!   cookie. A missing or malformed cookie is replaced by a fresh id.
//! - [`ThrottleKey::Composite`]: hash of IP, cookie and user-agent. Catches
//!   visitors who clear cookies from a stable device, at the price of false
//!   positives behind shared IPs (NAT, corporate proxies). Off by default.
//!
//! Loopback and unspecified addresses produce no IP key, otherwise every local
//! request would share one.

use std::fmt;
use std::net::IpAddr;

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Identity signals extracted from one inbound request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub ip: Option<IpAddr>,
    /// Raw value of the identity cookie, if the browser sent one.
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
}

/// One throttling key. Each variant carries an already-derived opaque value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ThrottleKey {
    Ip(String),
    Cookie(String),
    Composite(String),
}

impl ThrottleKey {
    /// Prefixed form used as the cooldown ledger key.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Ip(h) => format!("ip:{h}"),
            Self::Cookie(id) => format!("cookie:{id}"),
            Self::Composite(h) => format!("fp:{h}"),
        }
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// The resolved identity of a requester.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Ordered keys: IP (if usable), cookie, composite (if enabled and IP usable).
    pub keys: Vec<ThrottleKey>,
    /// Cookie id the response should carry.
    pub cookie_id: String,
    /// True when `cookie_id` was minted for this request and must be set.
    pub cookie_issued: bool,
}

impl Identity {
    pub fn storage_keys(&self) -> Vec<String> {
        self.keys.iter().map(ThrottleKey::storage_key).collect()
    }

    /// Key recorded as `claimed_by` on allocated codes.
    pub fn primary_key(&self) -> String {
        self.keys
            .first()
            .map(ThrottleKey::storage_key)
            .unwrap_or_else(|| ThrottleKey::Cookie(self.cookie_id.clone()).storage_key())
    }
}

/// Derives [`Identity`] values from [`RequestContext`]s.
#[derive(Clone, Debug)]
pub struct IdentityResolver {
    salt: String,
    composite: bool,
}

impl IdentityResolver {
    pub fn new(salt: impl Into<String>) -> Self {
        Self {
            salt: salt.into(),
            composite: false,
        }
    }

    /// Also derive the IP + cookie + user-agent composite key.
    pub fn with_composite(mut self, enabled: bool) -> Self {
        self.composite = enabled;
        self
    }

    pub fn resolve(&self, ctx: &RequestContext) -> Identity {
        let (cookie_id, cookie_issued) = match ctx.cookie.as_deref().and_then(parse_cookie_id) {
            Some(id) => (id, false),
            None => (Uuid::new_v4().to_string(), true),
        };

        let ip_hash = ctx.ip.filter(|ip| is_trackable(ip)).map(|ip| self.hash_ip(ip));

        let mut keys = Vec::with_capacity(3);
        if let Some(h) = &ip_hash {
            keys.push(ThrottleKey::Ip(h.clone()));
        }
        keys.push(ThrottleKey::Cookie(cookie_id.clone()));
        if self.composite {
            if let Some(h) = &ip_hash {
                let ua = ctx.user_agent.as_deref().unwrap_or("");
                keys.push(ThrottleKey::Composite(self.digest(&[h, &cookie_id, ua])));
            }
        }

        Identity {
            keys,
            cookie_id,
            cookie_issued,
        }
    }

    /// One-way hash of a client address.
    pub fn hash_ip(&self, ip: IpAddr) -> String {
        self.digest(&[&ip.to_canonical().to_string()])
    }

    fn digest(&self, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        for part in parts {
            hasher.update([0u8]);
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Accept only ids this server could have issued, in canonical form.
fn parse_cookie_id(raw: &str) -> Option<String> {
    Uuid::parse_str(raw.trim()).ok().map(|id| id.to_string())
}

fn is_trackable(ip: &IpAddr) -> bool {
    let ip = ip.to_canonical();
    !ip.is_loopback() && !ip.is_unspecified()
}
