//! Convert OpenVPN server status files into Prometheus metrics.
//!
//! The [`collector::Exporter`] parses a status snapshot line by line,
//! enriches client rows with geolocation data (country, region, city,
//! geohash, and great-circle distance from the server), and emits labeled
//! measurements into any [`metrics::MetricSink`]. The [`export`] module
//! renders those measurements in the Prometheus text format.
//!
//! # Examples
//!
//! Scraping a status file into a plain vector of tuples:
//!
//! ```rust,no_run
//! use openvpn_exporter::geo::{CachedResolver, IpApiResolver, DEFAULT_API_URL};
//! use openvpn_exporter::{Exporter, MetricTuple};
//!
//! # fn main() -> anyhow::Result<()> {
//! let resolver = CachedResolver::new(IpApiResolver::new(DEFAULT_API_URL)?);
//! let exporter = Exporter::new(Box::new(resolver), "");
//!
//! let status = std::fs::File::open("/run/openvpn/status.log")?;
//! let mut tuples: Vec<MetricTuple> = Vec::new();
//! exporter.collect_from_reader(std::io::BufReader::new(status), &mut tuples)?;
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod distance;
pub mod error;
pub mod export;
pub mod format;
pub mod geo;
pub mod input;
pub mod metrics;
pub mod schema;

pub use crate::collector::Exporter;
pub use crate::error::{Error, Result};
pub use crate::geo::{CachedResolver, GeoResolver, Location};
pub use crate::metrics::{MetricSink, MetricTuple, ValueKind};
