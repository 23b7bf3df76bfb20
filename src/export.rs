//! Prometheus exposition of scraped metric tuples.
//!
//! [`PromSink`] adapts the collector's tuple stream onto a fresh
//! `prometheus` registry; [`scrape_to_text`] runs a whole scrape and
//! renders the text format, folding any snapshot failure into the
//! `openvpn_up` gauge instead of propagating it.

use anyhow::{Context, Result};
use log::warn;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use rustc_hash::FxHashMap;

use crate::collector::Exporter;
use crate::input::FileOrStdin;
use crate::metrics::{MetricSink, MetricTuple, ValueKind};
use crate::schema;

/// Metric sink backed by a `prometheus` registry.
///
/// Every identity the exporter can emit is registered up front, so the
/// exposition carries descriptors even for families with no samples.
pub struct PromSink {
    registry: Registry,
    counters: FxHashMap<&'static str, CounterVec>,
    gauges: FxHashMap<&'static str, GaugeVec>,
}

impl PromSink {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let mut counters = FxHashMap::default();
        let mut gauges = FxHashMap::default();

        for (identity, kind) in schema::all_identities() {
            let opts = Opts::new(identity.name, identity.help);
            match kind {
                ValueKind::Counter => {
                    let vec = CounterVec::new(opts, identity.labels)
                        .with_context(|| format!("failed to build {}", identity.name))?;
                    registry
                        .register(Box::new(vec.clone()))
                        .with_context(|| format!("failed to register {}", identity.name))?;
                    counters.insert(identity.name, vec);
                }
                ValueKind::Gauge => {
                    let vec = GaugeVec::new(opts, identity.labels)
                        .with_context(|| format!("failed to build {}", identity.name))?;
                    registry
                        .register(Box::new(vec.clone()))
                        .with_context(|| format!("failed to register {}", identity.name))?;
                    gauges.insert(identity.name, vec);
                }
            }
        }

        Ok(Self {
            registry,
            counters,
            gauges,
        })
    }

    /// Render everything gathered so far in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics exposition was not UTF-8")
    }
}

impl MetricSink for PromSink {
    fn emit(&mut self, tuple: MetricTuple) {
        let labels: Vec<&str> = tuple.labels.iter().map(String::as_str).collect();
        match tuple.kind {
            ValueKind::Counter => match self.counters.get(tuple.identity.name) {
                Some(vec) => vec.with_label_values(&labels).inc_by(tuple.value),
                None => warn!("no counter registered for {}", tuple.identity.name),
            },
            ValueKind::Gauge => match self.gauges.get(tuple.identity.name) {
                Some(vec) => vec.with_label_values(&labels).set(tuple.value),
                None => warn!("no gauge registered for {}", tuple.identity.name),
            },
        }
    }
}

/// Scrape one status source and render the text exposition.
///
/// Failures opening or parsing the snapshot never propagate; they set
/// `openvpn_up` to zero so the output itself reports scrape health.
/// Only building or rendering the registry can error here.
pub fn scrape_to_text(exporter: &Exporter, source: &FileOrStdin) -> Result<String> {
    let mut sink = PromSink::new()?;
    let up = match collect_into(exporter, source, &mut sink) {
        Ok(()) => 1.0,
        Err(err) => {
            warn!("failed to scrape {source}: {err:#}");
            0.0
        }
    };
    sink.emit(MetricTuple {
        identity: schema::UP,
        kind: ValueKind::Gauge,
        value: up,
        labels: exporter.server_label_values(),
    });
    sink.render()
}

fn collect_into(exporter: &Exporter, source: &FileOrStdin, sink: &mut PromSink) -> Result<()> {
    let reader = source.reader()?;
    exporter.collect_from_reader(reader, sink)?;
    Ok(())
}
