//! Static description of the server status record types.
//!
//! Each record type that carries exportable data owns an ordered list of
//! label columns and a list of metric fields. The table is built once when
//! the exporter is constructed and read-only afterwards.

use rustc_hash::FxHashMap;

use crate::metrics::{MetricIdentity, ValueKind};

/// Column naming the client certificate; rows without one are skipped.
pub const COMMON_NAME: &str = "Common Name";
/// Column holding the peer's source address, usually with a `:port` suffix.
pub const REAL_ADDRESS: &str = "Real Address";

// Columns synthesized from geo resolution rather than declared by HEADER.
pub const GEOHASH: &str = "Geohash";
pub const CITY: &str = "City";
pub const COUNTRY: &str = "Country";
pub const REGION: &str = "Region";
pub const DISTANCE_FROM_SERVER: &str = "Distance From Server";

/// Record keyword for connected client rows.
pub const CLIENT_LIST: &str = "CLIENT_LIST";
/// Record keyword for routing table rows.
pub const ROUTING_TABLE: &str = "ROUTING_TABLE";

/// Labels present on every exported metric, describing the exporting
/// server itself. Values may all be empty when self-resolution failed.
pub const SERVER_LABELS: &[&str] = &[
    "server_geohash",
    "server_city",
    "server_country",
    "server_region",
    "server_public_ip",
];

const CLIENT_LABELS: &[&str] = &[
    "server_geohash",
    "server_city",
    "server_country",
    "server_region",
    "server_public_ip",
    "common_name",
    "connection_time",
    "real_address",
    "virtual_address",
    "username",
    "geohash",
    "city",
    "country",
    "region",
];

const ROUTING_LABELS: &[&str] = &[
    "server_geohash",
    "server_city",
    "server_country",
    "server_region",
    "server_public_ip",
    "common_name",
    "real_address",
    "virtual_address",
    "username",
    "geohash",
    "city",
    "country",
    "region",
];

const CLIENT_LABEL_COLUMNS: &[&str] = &[
    "Common Name",
    "Connected Since (time_t)",
    "Real Address",
    "Virtual Address",
    "Username",
    "Geohash",
    "City",
    "Country",
    "Region",
];

const ROUTING_LABEL_COLUMNS: &[&str] = &[
    "Common Name",
    "Real Address",
    "Virtual Address",
    "Username",
    "Geohash",
    "City",
    "Country",
    "Region",
];

/// Whether scraping the status file succeeded.
pub const UP: MetricIdentity = MetricIdentity {
    name: "openvpn_up",
    help: "Whether scraping OpenVPN's metrics was successful.",
    labels: SERVER_LABELS,
};

/// UNIX timestamp from the snapshot's TIME line.
pub const STATUS_UPDATE_TIME: MetricIdentity = MetricIdentity {
    name: "openvpn_status_update_time_seconds",
    help: "UNIX timestamp at which the OpenVPN statistics were updated.",
    labels: SERVER_LABELS,
};

/// Number of client rows seen in the snapshot.
pub const CONNECTED_CLIENTS: MetricIdentity = MetricIdentity {
    name: "openvpn_server_connected_clients",
    help: "Number of clients connected to the server.",
    labels: SERVER_LABELS,
};

const CLIENT_RECEIVED_BYTES: MetricIdentity = MetricIdentity {
    name: "openvpn_server_client_received_bytes_total",
    help: "Amount of data received over a connection on the VPN server, in bytes.",
    labels: CLIENT_LABELS,
};

const CLIENT_SENT_BYTES: MetricIdentity = MetricIdentity {
    name: "openvpn_server_client_sent_bytes_total",
    help: "Amount of data sent over a connection on the VPN server, in bytes.",
    labels: CLIENT_LABELS,
};

const CLIENT_DISTANCE: MetricIdentity = MetricIdentity {
    name: "openvpn_server_client_distance",
    help: "Distance from server to client, in meters.",
    labels: CLIENT_LABELS,
};

const ROUTE_LAST_REFERENCE: MetricIdentity = MetricIdentity {
    name: "openvpn_server_route_last_reference_time_seconds",
    help: "Time at which a route was last referenced, in seconds.",
    labels: ROUTING_LABELS,
};

/// A numeric column exported as its own metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricField {
    /// Column the value is read from.
    pub column: &'static str,
    pub identity: MetricIdentity,
    pub kind: ValueKind,
}

/// Per-record-type export schema: which columns become labels and which
/// become metrics.
#[derive(Debug, Clone)]
pub struct RecordSchema {
    /// Columns whose values become metric labels, in label order after the
    /// five server labels.
    pub label_columns: &'static [&'static str],
    pub metrics: &'static [MetricField],
}

const CLIENT_METRICS: &[MetricField] = &[
    MetricField {
        column: "Bytes Received",
        identity: CLIENT_RECEIVED_BYTES,
        kind: ValueKind::Counter,
    },
    MetricField {
        column: "Bytes Sent",
        identity: CLIENT_SENT_BYTES,
        kind: ValueKind::Counter,
    },
    MetricField {
        column: DISTANCE_FROM_SERVER,
        identity: CLIENT_DISTANCE,
        kind: ValueKind::Gauge,
    },
];

const ROUTING_METRICS: &[MetricField] = &[MetricField {
    column: "Last Ref (time_t)",
    identity: ROUTE_LAST_REFERENCE,
    kind: ValueKind::Gauge,
}];

/// Build the record-type table. Called once per exporter.
pub fn server_schemas() -> FxHashMap<&'static str, RecordSchema> {
    let mut schemas = FxHashMap::default();
    schemas.insert(
        CLIENT_LIST,
        RecordSchema {
            label_columns: CLIENT_LABEL_COLUMNS,
            metrics: CLIENT_METRICS,
        },
    );
    schemas.insert(
        ROUTING_TABLE,
        RecordSchema {
            label_columns: ROUTING_LABEL_COLUMNS,
            metrics: ROUTING_METRICS,
        },
    );
    schemas
}

/// Every metric identity the exporter can emit, with its value kind.
/// Exposition sinks use this to register descriptors up front.
pub fn all_identities() -> Vec<(MetricIdentity, ValueKind)> {
    let mut identities = vec![
        (UP, ValueKind::Gauge),
        (STATUS_UPDATE_TIME, ValueKind::Gauge),
        (CONNECTED_CLIENTS, ValueKind::Gauge),
    ];
    for schema in server_schemas().values() {
        for field in schema.metrics {
            identities.push((field.identity, field.kind));
        }
    }
    identities
}
