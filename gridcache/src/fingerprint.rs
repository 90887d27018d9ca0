//! Cache key derivation.
//!
//! A [`Fingerprint`] identifies the result set of a request independent of
//! which tile was asked for: every tile at a zoom level shares the same
//! fingerprint, and zoom becomes a path segment under it.
//!
//! Keys that only affect presentation (`source`, `color`, `width`,
//! `callback`) and the `cache` opt-in flag are dropped before hashing. The
//! remaining pairs are ordered by key and JSON encoded. Filter clauses are
//! encoded with object keys in order and then sorted, so clause order does
//! not matter. The result is hashed with SHA-256 truncated to 128 bits.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::geo;
use crate::request::{DataType, QueryParams, TileRequest, PARAM_CACHE, PARAM_SOURCE};

/// Parameters that never change the result set.
pub const EXCLUDED_KEYS: &[&str] = &[PARAM_SOURCE, "color", "width", "callback", PARAM_CACHE];

/// Grids at or above this geohash precision are never cached.
pub const MAX_CACHEABLE_PRECISION: u8 = 7;

/// Number of digest bytes kept (128 bits).
const DIGEST_BYTES: usize = 16;

/// Canonical digest of a request's cache-relevant parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derives the fingerprint for a request.
    pub fn for_request(request: &TileRequest) -> Self {
        Self::from_parts(request.params(), request.filters())
    }

    /// Derives the fingerprint for a raw parameter set without filters.
    pub fn from_params(params: &QueryParams) -> Self {
        Self::from_parts(params, &[])
    }

    /// Derives the fingerprint for parameters plus filter clauses.
    ///
    /// With no filters the digest matches [`Fingerprint::from_params`].
    pub fn from_parts(params: &QueryParams, filters: &[Value]) -> Self {
        let canonical = cache_params(params);
        // BTreeMap serializes in key order.
        let mut encoded = serde_json::to_string(&canonical).unwrap_or_default();
        if !filters.is_empty() {
            // serde_json maps are key ordered, so each clause encodes canonically.
            let mut clauses: Vec<String> = filters.iter().map(Value::to_string).collect();
            clauses.sort();
            encoded.push('\n');
            encoded.push_str(&clauses.join("\n"));
        }
        let digest = Sha256::digest(encoded.as_bytes());
        let hex = digest[..DIGEST_BYTES]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        Fingerprint(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Partition directory name: the last two hex characters.
    pub fn partition(&self) -> &str {
        &self.0[self.0.len() - 2..]
    }

    /// Key under which a count for this fingerprint is stored.
    pub fn count_key(&self) -> String {
        format!("count:{}", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the parameters that participate in the fingerprint.
pub fn cache_params(params: &QueryParams) -> QueryParams {
    params
        .iter()
        .filter(|(k, _)| !EXCLUDED_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Outcome of the cache eligibility policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// No cache root is configured.
    NotConfigured,
    /// The request did not opt in with `cache=true`.
    NotRequested,
    /// Only grid styles are cached.
    NotGridStyle,
    /// The data type is not bounded by the tile.
    PassthroughData,
    /// The grid at this zoom is too fine to cache.
    TooFine { precision: u8 },
    /// No result-set parameters: the whole index would be cached.
    NoParams,
    /// The request asked for a shorter lifetime than cached data has.
    TtlTooShort { requested: u64 },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eligibility::Eligible => write!(f, "eligible"),
            Eligibility::NotConfigured => write!(f, "no cache directory configured"),
            Eligibility::NotRequested => write!(f, "caching not requested"),
            Eligibility::NotGridStyle => write!(f, "style is not a grid style"),
            Eligibility::PassthroughData => write!(f, "data type is not tile bounded"),
            Eligibility::TooFine { precision } => {
                write!(f, "precision {} is too fine to cache", precision)
            }
            Eligibility::NoParams => write!(f, "no cacheable parameters"),
            Eligibility::TtlTooShort { requested } => {
                write!(f, "requested ttl {}s is shorter than cache ttl", requested)
            }
        }
    }
}

/// Decides whether a request may be served from, and populate, the grid cache.
///
/// # Arguments
///
/// * `request` - The validated request
/// * `cache_configured` - Whether a cache root exists
/// * `data_ttl` - Lifetime of cached data
pub fn eligibility(request: &TileRequest, cache_configured: bool, data_ttl: Duration) -> Eligibility {
    if !cache_configured {
        return Eligibility::NotConfigured;
    }
    if !request.cache_requested() {
        return Eligibility::NotRequested;
    }
    if !request.style().is_grid() {
        return Eligibility::NotGridStyle;
    }
    if request.data_type() != DataType::Search {
        return Eligibility::PassthroughData;
    }
    let precision = geo::precision_for_zoom(request.zoom(), 0);
    if precision >= MAX_CACHEABLE_PRECISION {
        return Eligibility::TooFine { precision };
    }
    if cache_params(request.params()).is_empty() && request.filters().is_empty() {
        return Eligibility::NoParams;
    }
    if let Some(requested) = request.ttl() {
        if requested < data_ttl.as_secs() {
            return Eligibility::TtlTooShort { requested };
        }
    }
    Eligibility::Eligible
}
