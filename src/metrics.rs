//! The flat measurement model handed to metric sinks.

/// How a metric value accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Monotonically increasing total.
    Counter,
    /// Point-in-time value.
    Gauge,
}

/// Static identity of a metric: its name, help text, and label names.
///
/// Identities are declared once in [`crate::schema`] and shared by every
/// tuple emitted for that metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricIdentity {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
}

/// One labeled measurement produced by a scrape.
///
/// `labels` holds the label values positionally, matching
/// `identity.labels`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricTuple {
    pub identity: MetricIdentity,
    pub kind: ValueKind,
    pub value: f64,
    pub labels: Vec<String>,
}

/// Receiver for the ordered sequence of tuples emitted by a scrape.
pub trait MetricSink {
    fn emit(&mut self, tuple: MetricTuple);
}

/// Collecting tuples into a `Vec` is handy in tests and for callers that
/// post-process measurements themselves.
impl MetricSink for Vec<MetricTuple> {
    fn emit(&mut self, tuple: MetricTuple) {
        self.push(tuple);
    }
}
