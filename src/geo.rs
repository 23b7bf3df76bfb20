//! Geographic resolution of peer addresses.
//!
//! The parser only depends on the [`GeoResolver`] trait; the backends here
//! cover the common deployments. [`IpApiResolver`] asks an ip-api.com
//! style HTTP endpoint, [`MmdbResolver`] reads a local MaxMind GeoLite2
//! City database, and [`DisabledResolver`] turns resolution off entirely.
//! Wrap any of them in [`CachedResolver`] so each distinct address is
//! resolved at most once per process.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use log::debug;
use maxminddb::{geoip2, Mmap, Reader};
use rustc_hash::FxHashMap;
use serde::Deserialize;

/// Default base URL of the geolocation endpoint.
pub const DEFAULT_API_URL: &str = "http://ip-api.com";

/// Filename of the MaxMind city database within the database directory.
pub const CITY_DB_FILENAME: &str = "GeoLite2-City.mmdb";

/// Geohash cell size; 12 characters is sub-meter, the encoder's maximum.
const GEOHASH_PRECISION: usize = 12;

/// Geographic context for one resolved address.
///
/// The `Default` value (empty strings, zero coordinates) is what callers
/// fall back to when resolution fails.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Location {
    pub ip: String,
    pub country: String,
    pub region: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub geohash: String,
}

/// Resolves an address to a [`Location`].
///
/// The empty address is a sentinel meaning "the caller's own public
/// address"; only backends with a notion of self can honor it. Failures
/// never abort a scrape, callers degrade to empty geo fields instead.
pub trait GeoResolver: Send + Sync {
    fn resolve(&self, address: &str) -> Result<Location>;
}

fn encode_geohash(latitude: f64, longitude: f64) -> String {
    // Out-of-range coordinates yield no geohash rather than an error.
    geohash::encode(
        geohash::Coord {
            x: longitude,
            y: latitude,
        },
        GEOHASH_PRECISION,
    )
    .unwrap_or_default()
}

/// Memoizes successful resolutions by exact address string for the life of
/// the process. There is no eviction; one exporter run makes a single pass
/// over a bounded set of peers.
pub struct CachedResolver<R> {
    inner: R,
    cache: Mutex<FxHashMap<String, Location>>,
}

impl<R: GeoResolver> CachedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<R: GeoResolver> GeoResolver for CachedResolver<R> {
    fn resolve(&self, address: &str) -> Result<Location> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(address) {
                return Ok(hit.clone());
            }
        }

        debug!("resolving {address:?}");
        let location = self.inner.resolve(address)?;

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(address.to_string(), location.clone());
        Ok(location)
    }
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    query: String,
    #[serde(default)]
    country: String,
    #[serde(rename = "regionName", default)]
    region_name: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lon: f64,
}

/// Resolver backed by an ip-api.com style JSON endpoint.
///
/// Querying with the empty address returns the location of the exporter's
/// own public IP, which is how the server's constant labels get filled in.
pub struct IpApiResolver {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl IpApiResolver {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build geolocation HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

impl GeoResolver for IpApiResolver {
    fn resolve(&self, address: &str) -> Result<Location> {
        let url = format!("{}/json/{}", self.base_url, address);
        let body = self
            .client
            .get(&url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .with_context(|| format!("geolocation request to {url} failed"))?
            .text()
            .context("failed to read geolocation response")?;

        let response: IpApiResponse =
            serde_json::from_str(&body).context("failed to parse geolocation response")?;
        if response.status.as_deref() == Some("fail") {
            bail!(
                "geolocation lookup failed for {address:?}: {}",
                response.message.unwrap_or_else(|| "unknown reason".to_string())
            );
        }

        Ok(Location {
            ip: response.query,
            country: response.country,
            region: response.region_name,
            city: response.city,
            latitude: response.lat,
            longitude: response.lon,
            geohash: encode_geohash(response.lat, response.lon),
        })
    }
}

/// Resolver backed by a local MaxMind GeoLite2 City database.
///
/// Has no notion of "own public address", so the empty sentinel reports an
/// error; pass an explicit public IP when using this backend.
pub struct MmdbResolver {
    reader: Reader<Mmap>,
}

impl MmdbResolver {
    /// Open `GeoLite2-City.mmdb` from the given directory.
    pub fn open(dir: &Utf8Path) -> Result<Self> {
        let path = dir.join(CITY_DB_FILENAME);
        let reader = unsafe { Reader::open_mmap(&path) }
            .with_context(|| format!("failed to open city database at {path}"))?;
        Ok(Self { reader })
    }
}

impl GeoResolver for MmdbResolver {
    fn resolve(&self, address: &str) -> Result<Location> {
        let ip: IpAddr = address
            .parse()
            .with_context(|| format!("not a resolvable address: {address:?}"))?;

        let lookup = self
            .reader
            .lookup(ip)
            .with_context(|| format!("city lookup failed for {address}"))?;
        if !lookup.has_data() {
            bail!("no geolocation data for {address}");
        }
        let record = lookup
            .decode::<geoip2::City>()
            .with_context(|| format!("failed to decode city record for {address}"))?;
        let Some(record) = record else {
            bail!("no geolocation data for {address}");
        };

        let latitude = record.location.latitude.unwrap_or(0.0);
        let longitude = record.location.longitude.unwrap_or(0.0);
        Ok(Location {
            ip: address.to_string(),
            country: record.country.names.english.unwrap_or("").to_string(),
            region: record
                .subdivisions
                .first()
                .and_then(|subdivision| subdivision.names.english)
                .unwrap_or("")
                .to_string(),
            city: record.city.names.english.unwrap_or("").to_string(),
            latitude,
            longitude,
            geohash: encode_geohash(latitude, longitude),
        })
    }
}

/// Resolver used when geolocation is turned off. Every lookup reports an
/// error, so rows keep empty geo fields and distances stay zero.
pub struct DisabledResolver;

impl GeoResolver for DisabledResolver {
    fn resolve(&self, _address: &str) -> Result<Location> {
        bail!("geolocation is disabled")
    }
}
