//! Proxy repository: durable sources, items, aggregates and forward records.
//!
//! ```text
//! add_source ─→ source ─→ Examiner ─→ source_item/source_entry
//!                                          │
//!                                      Aggregator ─→ aggregate/aggregate_item
//!                                          │
//!                 Forwarder<AggregateKind> / Forwarder<SourceKind>
//!                                          │
//!                                       Cleanup
//! ```
//!
//! Every stage reads its work from the database and announces new work through
//! [`listeners::Listeners`]; nothing is handed between stages in memory.

pub mod aggregator;
pub mod cleanup;
pub mod db;
pub mod destinations;
pub mod error_receiver;
pub mod examiner;
pub mod feed_keys;
pub mod forward_dests;
pub mod forwarder;
pub mod listeners;
pub mod retry;
pub mod sender;
pub mod sources;
#[cfg(test)]
pub(crate) mod test_support;

use std::collections::BTreeMap;

pub use aggregator::{Aggregator, AggregatorConfig};
pub use cleanup::Cleanup;
pub use db::{IdSequence, ProxyDb};
pub use examiner::Examiner;
pub use feed_keys::{FeedKey, FeedKeys};
pub use forward_dests::ForwardDestRegistry;
pub use forwarder::{AggregateKind, Forwarder, ForwarderConfig, SourceKind};
pub use sources::{ForwardingMode, Source, SourceRegistry};

/// Header attributes that travel with forwarded data.
pub type AttributeMap = BTreeMap<String, String>;

pub mod headers {
    pub const FEED: &str = "Feed";
    pub const TYPE: &str = "Type";
    pub const COMPRESSION: &str = "Compression";
    pub const COMPRESSION_ZIP: &str = "ZIP";
    pub const RECEIVED_PATH: &str = "ReceivedPath";
    pub const PROXY_FORWARD_ID: &str = "ProxyForwardId";
    pub const FORWARD_ERROR: &str = "ForwardError";
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Kind of physical part inside a container, in send order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtensionType {
    Meta = 1,
    Context = 2,
    Data = 3,
}

impl ExtensionType {
    /// Classify a part by its extension (including the dot). Unknown
    /// extensions return `None` and are skipped by the examiner.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            ".meta" | ".hdr" | ".mf" => Some(ExtensionType::Meta),
            ".ctx" | ".context" => Some(ExtensionType::Context),
            ".dat" | ".data" => Some(ExtensionType::Data),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Split `001.dat` into (`001`, `.dat`). Names without an extension yield an
/// empty extension.
pub fn split_entry_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// Parse `Key:Value` header lines as written in meta parts.
pub fn parse_attributes(text: &str) -> AttributeMap {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.trim().to_string()))
            }
        })
        .collect()
}

/// Look up an attribute ignoring key case (`feed`, `FEED` and `Feed` match).
pub fn attribute<'a>(attributes: &'a AttributeMap, key: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}
