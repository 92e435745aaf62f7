//! GeoIP enrichment for alert context
//!
//! Two providers sit behind [`GeoLookup`]: the ip-api.com HTTP service and a
//! local MaxMind GeoLite2-City database. [`GeoIpCache`] fronts either one,
//! answers private ranges without a lookup, caches successes and degrades
//! every failure to [`GeoInfo::unknown`].

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maxminddb::{geoip2, Reader};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::models::GeoInfo;

/// Errors that can occur during geolocation lookups
#[derive(Error, Debug)]
pub enum GeoError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] maxminddb::MaxMindDBError),

    #[error("Database file not found: {0}")]
    FileNotFound(String),

    #[error("IP address not found")]
    NotFound,

    #[error("Lookup rejected: {0}")]
    Rejected(String),
}

/// Source of location data for a public address.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError>;
}

/// Private, loopback, link-local and unspecified ranges.
pub fn is_private_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || v6
                    .to_ipv4_mapped()
                    .map(|v4| is_private_address(&IpAddr::V4(v4)))
                    .unwrap_or(false)
        }
    }
}

// ============================================
// ip-api.com
// ============================================

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    message: Option<String>,
    country: Option<String>,
    city: Option<String>,
    isp: Option<String>,
}

/// Lookup through the free ip-api.com JSON endpoint.
pub struct IpApiLookup {
    client: Client,
    endpoint: String,
}

impl IpApiLookup {
    pub const DEFAULT_ENDPOINT: &'static str = "http://ip-api.com/json";

    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, GeoError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(IpApiLookup {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl GeoLookup for IpApiLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), ip);
        let response: IpApiResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.status != "success" {
            return Err(GeoError::Rejected(
                response.message.unwrap_or(response.status),
            ));
        }

        let or_unknown = |v: Option<String>| v.unwrap_or_else(|| "Unknown".to_string());
        Ok(GeoInfo {
            country: or_unknown(response.country),
            city: or_unknown(response.city),
            isp: or_unknown(response.isp),
        })
    }
}

// ============================================
// MaxMind GeoLite2-City
// ============================================

/// Offline lookup against a MaxMind GeoLite2-City database. The City
/// database carries no ISP, so `isp` is always "Unknown".
pub struct MaxMindLookup {
    reader: Arc<Reader<Vec<u8>>>,
}

impl MaxMindLookup {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, GeoError> {
        let path = db_path.as_ref();
        if !path.exists() {
            return Err(GeoError::FileNotFound(path.display().to_string()));
        }

        let reader = Reader::open_readfile(path)?;
        Ok(MaxMindLookup {
            reader: Arc::new(reader),
        })
    }

    fn lookup_city(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
        let city: geoip2::City = self.reader.lookup(ip).map_err(|e| match e {
            maxminddb::MaxMindDBError::AddressNotFoundError(_) => GeoError::NotFound,
            other => GeoError::Database(other),
        })?;

        Ok(GeoInfo {
            country: english_name(city.country.as_ref().and_then(|c| c.names.as_ref())),
            city: english_name(city.city.as_ref().and_then(|c| c.names.as_ref())),
            isp: "Unknown".to_string(),
        })
    }
}

fn english_name(names: Option<&BTreeMap<&str, &str>>) -> String {
    names
        .and_then(|n| n.get("en"))
        .map(|s| s.to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

#[async_trait]
impl GeoLookup for MaxMindLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
        self.lookup_city(ip)
    }
}

// ============================================
// Cache
// ============================================

/// Cache-first enrichment front end.
///
/// Concurrent misses for one address may both reach the provider; the
/// second result simply overwrites the first.
pub struct GeoIpCache {
    provider: Option<Arc<dyn GeoLookup>>,
    cache: RwLock<HashMap<IpAddr, GeoInfo>>,
    timeout: Duration,
}

impl GeoIpCache {
    pub fn new(provider: Arc<dyn GeoLookup>, timeout: Duration) -> Self {
        GeoIpCache {
            provider: Some(provider),
            cache: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Enrichment turned off: private ranges still get their placeholder,
    /// everything else is "Unknown".
    pub fn disabled() -> Self {
        GeoIpCache {
            provider: None,
            cache: RwLock::new(HashMap::new()),
            timeout: Duration::ZERO,
        }
    }

    pub async fn lookup(&self, address: &str) -> GeoInfo {
        let ip = match address.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) if address.eq_ignore_ascii_case("localhost") => return GeoInfo::private(),
            Err(_) => return GeoInfo::unknown(),
        };

        if is_private_address(&ip) {
            return GeoInfo::private();
        }

        let cached = self.cache.read().get(&ip).cloned();
        if let Some(info) = cached {
            return info;
        }

        let provider = match &self.provider {
            Some(provider) => provider,
            None => return GeoInfo::unknown(),
        };

        match tokio::time::timeout(self.timeout, provider.lookup(ip)).await {
            Ok(Ok(info)) => {
                self.cache.write().insert(ip, info.clone());
                info
            }
            Ok(Err(e)) => {
                log::warn!("GeoIP lookup for {} failed: {}", ip, e);
                GeoInfo::unknown()
            }
            Err(_) => {
                log::warn!(
                    "GeoIP lookup for {} timed out after {}s",
                    ip,
                    self.timeout.as_secs_f32()
                );
                GeoInfo::unknown()
            }
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.read().len()
    }
}
