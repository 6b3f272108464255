//! High-entropy token normalization.
//!
//! Random-looking substrings (JWTs, UUIDs, hex digests, base64 blobs, ...)
//! change on every event and inflate compressed size without carrying any
//! structural signal. The tokenizer replaces them with fixed sentinels
//! before events reach a detector.
//!
//! Patterns run from most to least specific. A JWT is three base64url
//! segments, so JWTs must be replaced before the base64 pattern gets a
//! chance to match its segments one by one.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detect::{DetectError, Result};

pub const JWT_TOKEN: &[u8] = b"<JWT>";
pub const UUID_TOKEN: &[u8] = b"<UUID>";
pub const HASH_TOKEN: &[u8] = b"<HASH>";
pub const BASE64_TOKEN: &[u8] = b"<B64>";
pub const TIMESTAMP_TOKEN: &[u8] = b"<TS>";
pub const EMAIL_TOKEN: &[u8] = b"<EMAIL>";
pub const IP_TOKEN: &[u8] = b"<IP>";

const JWT_PATTERN: &str = r"eyJ[A-Za-z0-9_-]+\.eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+";
const UUID_PATTERN: &str = r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";
const HASH_PATTERN: &str = r"(?i)\b[0-9a-f]{32,64}\b";
const BASE64_PATTERN: &str = r"[A-Za-z0-9+/]{20,}={0,2}";
const TIMESTAMP_PATTERN: &str =
    r"\b\d{4}-\d{2}-\d{2}[Tt ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?";
const EMAIL_PATTERN: &str = r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}";
const IPV4_PATTERN: &str =
    r"\b(?:(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])\.){3}(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])\b";

/// Which categories to normalize. Hashable so it can key the
/// [`TokenizerCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    pub enable_jwt: bool,
    pub enable_uuid: bool,
    pub enable_hash: bool,
    pub enable_base64: bool,
    pub enable_timestamp: bool,
    pub enable_email: bool,
    pub enable_ip: bool,
    /// Re-serialize JSON objects with sorted keys so field order does not
    /// register as drift.
    pub enable_json_canonicalization: bool,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            enable_jwt: true,
            enable_uuid: true,
            enable_hash: true,
            enable_base64: true,
            enable_timestamp: false,
            enable_email: false,
            enable_ip: false,
            enable_json_canonicalization: false,
        }
    }
}

impl TokenizerConfig {
    pub fn none() -> Self {
        Self {
            enable_jwt: false,
            enable_uuid: false,
            enable_hash: false,
            enable_base64: false,
            enable_timestamp: false,
            enable_email: false,
            enable_ip: false,
            enable_json_canonicalization: false,
        }
    }

    pub fn all() -> Self {
        Self {
            enable_jwt: true,
            enable_uuid: true,
            enable_hash: true,
            enable_base64: true,
            enable_timestamp: true,
            enable_email: true,
            enable_ip: true,
            enable_json_canonicalization: true,
        }
    }

    pub fn has_any_enabled(&self) -> bool {
        *self != Self::none()
    }
}

/// Snapshot of replacement counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenizerStats {
    pub jwt_count: u64,
    pub uuid_count: u64,
    pub hash_count: u64,
    pub base64_count: u64,
    pub timestamp_count: u64,
    pub email_count: u64,
    pub ip_count: u64,
    pub json_canonicalized_count: u64,
    pub bytes_saved: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Jwt,
    Uuid,
    Hash,
    Timestamp,
    Email,
    Ip,
    Base64,
}

struct Rule {
    category: Category,
    regex: Regex,
    token: &'static [u8],
}

#[derive(Default)]
struct Counters {
    jwt: AtomicU64,
    uuid: AtomicU64,
    hash: AtomicU64,
    base64: AtomicU64,
    timestamp: AtomicU64,
    email: AtomicU64,
    ip: AtomicU64,
    json: AtomicU64,
    bytes_saved: AtomicU64,
}

impl Counters {
    fn for_category(&self, category: Category) -> &AtomicU64 {
        match category {
            Category::Jwt => &self.jwt,
            Category::Uuid => &self.uuid,
            Category::Hash => &self.hash,
            Category::Base64 => &self.base64,
            Category::Timestamp => &self.timestamp,
            Category::Email => &self.email,
            Category::Ip => &self.ip,
        }
    }

    fn snapshot(&self) -> TokenizerStats {
        TokenizerStats {
            jwt_count: self.jwt.load(Ordering::Relaxed),
            uuid_count: self.uuid.load(Ordering::Relaxed),
            hash_count: self.hash.load(Ordering::Relaxed),
            base64_count: self.base64.load(Ordering::Relaxed),
            timestamp_count: self.timestamp.load(Ordering::Relaxed),
            email_count: self.email.load(Ordering::Relaxed),
            ip_count: self.ip.load(Ordering::Relaxed),
            json_canonicalized_count: self.json.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for c in [
            &self.jwt,
            &self.uuid,
            &self.hash,
            &self.base64,
            &self.timestamp,
            &self.email,
            &self.ip,
            &self.json,
            &self.bytes_saved,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Replaces high-entropy substrings with sentinel tokens.
///
/// Only the enabled categories are compiled. Counters are atomic, so a
/// shared `Arc<Tokenizer>` can be used from many ingest threads.
pub struct Tokenizer {
    config: TokenizerConfig,
    rules: Vec<Rule>,
    counters: Counters,
}

impl Tokenizer {
    pub fn new(config: TokenizerConfig) -> Result<Self> {
        let wanted = [
            (config.enable_jwt, Category::Jwt, JWT_PATTERN, JWT_TOKEN),
            (config.enable_uuid, Category::Uuid, UUID_PATTERN, UUID_TOKEN),
            (config.enable_hash, Category::Hash, HASH_PATTERN, HASH_TOKEN),
            (
                config.enable_timestamp,
                Category::Timestamp,
                TIMESTAMP_PATTERN,
                TIMESTAMP_TOKEN,
            ),
            (config.enable_email, Category::Email, EMAIL_PATTERN, EMAIL_TOKEN),
            (config.enable_ip, Category::Ip, IPV4_PATTERN, IP_TOKEN),
            (
                config.enable_base64,
                Category::Base64,
                BASE64_PATTERN,
                BASE64_TOKEN,
            ),
        ];

        let mut rules = Vec::new();
        for (enabled, category, pattern, token) in wanted {
            if !enabled {
                continue;
            }
            let regex = Regex::new(pattern).map_err(|e| {
                DetectError::InternalFault(format!("{category:?} pattern failed to compile: {e}"))
            })?;
            rules.push(Rule {
                category,
                regex,
                token,
            });
        }

        Ok(Self {
            config,
            rules,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> TokenizerConfig {
        self.config
    }

    /// Normalize one event.
    pub fn tokenize(&self, data: &[u8]) -> Vec<u8> {
        if !self.config.has_any_enabled() {
            return data.to_vec();
        }

        let mut out = match self.config.enable_json_canonicalization {
            true => match canonicalize_json(data) {
                Some(canonical) => {
                    self.counters.json.fetch_add(1, Ordering::Relaxed);
                    canonical
                }
                None => data.to_vec(),
            },
            false => data.to_vec(),
        };

        for rule in &self.rules {
            let matches = rule.regex.find_iter(&out).count();
            if matches == 0 {
                continue;
            }
            out = rule.regex.replace_all(&out, rule.token).into_owned();
            self.counters
                .for_category(rule.category)
                .fetch_add(matches as u64, Ordering::Relaxed);
        }

        let saved = data.len().saturating_sub(out.len());
        if saved > 0 {
            self.counters
                .bytes_saved
                .fetch_add(saved as u64, Ordering::Relaxed);
        }

        out
    }

    pub fn stats(&self) -> TokenizerStats {
        self.counters.snapshot()
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }
}

/// Sort object keys recursively and re-serialize compactly. `None` if the
/// input is not JSON.
fn canonicalize_json(data: &[u8]) -> Option<Vec<u8>> {
    fn sort(value: serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<String, serde_json::Value> =
                    map.into_iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::Value::Object(sorted.into_iter().collect())
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(sort).collect())
            }
            other => other,
        }
    }

    let value: serde_json::Value = serde_json::from_slice(data).ok()?;
    serde_json::to_vec(&sort(value)).ok()
}

// ---------------------------------------------------------------------------
// TokenizerCache
// ---------------------------------------------------------------------------

/// Compiled tokenizers keyed by configuration.
///
/// Owned by the host and shared by reference; compiling the pattern set is
/// the expensive part, so streams with the same config share one instance.
#[derive(Default)]
pub struct TokenizerCache {
    inner: RwLock<HashMap<TokenizerConfig, Arc<Tokenizer>>>,
}

impl TokenizerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, config: TokenizerConfig) -> Result<Arc<Tokenizer>> {
        if let Some(existing) = self.inner.read().get(&config) {
            return Ok(Arc::clone(existing));
        }

        let mut inner = self.inner.write();
        // Another thread may have inserted while we waited for the lock.
        if let Some(existing) = inner.get(&config) {
            return Ok(Arc::clone(existing));
        }
        let tokenizer = Arc::new(Tokenizer::new(config)?);
        inner.insert(config, Arc::clone(&tokenizer));
        debug!(cached = inner.len(), "compiled tokenizer");
        Ok(tokenizer)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
