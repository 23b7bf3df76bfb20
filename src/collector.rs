//! The status snapshot parser and metric reducer.
//!
//! One [`Exporter`] makes a single synchronous pass over a status stream,
//! classifying each line, resolving geographic context for peer rows, and
//! handing labeled measurements to the caller's [`MetricSink`]. Repeated
//! label combinations within one snapshot are emitted once.

use std::io::BufRead;

use bstr::io::BufReadExt;
use log::warn;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::distance::haversine_meters;
use crate::error::{Error, Result};
use crate::format::{StatusFormat, PEEK_LEN};
use crate::geo::{GeoResolver, Location};
use crate::metrics::{MetricSink, MetricTuple, ValueKind};
use crate::schema::{self, RecordSchema};

/// One status line, classified by its leading keyword.
///
/// Guard conditions mirror the status format itself: a known keyword with
/// the wrong arity is not recognized here and falls through as a
/// `Record`, where it fails as an unsupported key.
enum Directive<'a> {
    /// `END` footer; the scrape ends at stream exhaustion regardless.
    End,
    /// Global server statistics, not exported.
    GlobalStats,
    /// Daemon version banner, not exported.
    Title,
    /// Column declaration for a record type.
    Header {
        record: &'a str,
        columns: &'a [&'a str],
    },
    /// Timestamp at which the daemon wrote the snapshot.
    Time { timestamp: &'a str },
    /// Anything else: a data row for some record type.
    Record { keyword: &'a str },
}

impl<'a> Directive<'a> {
    fn classify(fields: &'a [&'a str]) -> Directive<'a> {
        match fields.first().copied().unwrap_or("") {
            "END" if fields.len() == 1 => Directive::End,
            "GLOBAL_STATS" => Directive::GlobalStats,
            "HEADER" if fields.len() > 2 => Directive::Header {
                record: fields[1],
                columns: &fields[2..],
            },
            "TIME" if fields.len() == 3 => Directive::Time {
                timestamp: fields[2],
            },
            "TITLE" if fields.len() == 2 => Directive::Title,
            keyword => Directive::Record { keyword },
        }
    }
}

/// Per-snapshot parser state.
#[derive(Default)]
struct ScrapeState {
    /// Column order declared by HEADER lines, per record type.
    headers: FxHashMap<String, Vec<String>>,
    /// CLIENT_LIST rows seen, minus the ones without a usable common name.
    connected_clients: u64,
    /// Label vectors already emitted, per metric name.
    seen: FxHashMap<&'static str, FxHashSet<Vec<String>>>,
}

/// Converts OpenVPN server status snapshots into metric tuples.
///
/// Construction resolves the exporting server's own location once; those
/// five values prefix the label vector of every emitted metric. If
/// self-resolution fails the prefix is empty strings and all client
/// distances are reported as zero.
pub struct Exporter {
    schemas: FxHashMap<&'static str, RecordSchema>,
    server: Location,
    resolver: Box<dyn GeoResolver>,
}

impl Exporter {
    /// Build an exporter around a geo resolver.
    ///
    /// `public_address` is handed to the resolver to locate the exporting
    /// server itself; the empty string lets HTTP backends report the
    /// caller's own public address.
    pub fn new(resolver: Box<dyn GeoResolver>, public_address: &str) -> Self {
        let server = match resolver.resolve(public_address) {
            Ok(location) => location,
            Err(err) => {
                warn!("error getting server geo: {err:#}");
                Location::default()
            }
        };
        Self {
            schemas: schema::server_schemas(),
            server,
            resolver,
        }
    }

    /// The server's own resolved location.
    pub fn server_location(&self) -> &Location {
        &self.server
    }

    /// The five server-level label values prefixing every label vector.
    pub fn server_label_values(&self) -> Vec<String> {
        vec![
            self.server.geohash.clone(),
            self.server.city.clone(),
            self.server.country.clone(),
            self.server.region.clone(),
            self.server.ip.clone(),
        ]
    }

    /// Process one status snapshot, emitting metric tuples into `sink`.
    ///
    /// The snapshot dialect is detected from the first bytes of the
    /// stream; client-mode files and unrecognized content fail before any
    /// line is processed.
    pub fn collect_from_reader(
        &self,
        mut reader: impl BufRead,
        sink: &mut dyn MetricSink,
    ) -> Result<()> {
        let format = {
            let prefix = reader.fill_buf()?;
            StatusFormat::detect(&prefix[..prefix.len().min(PEEK_LEN)])?
        };
        self.collect_server_status(reader, format.separator(), sink)
    }

    fn collect_server_status(
        &self,
        reader: impl BufRead,
        separator: char,
        sink: &mut dyn MetricSink,
    ) -> Result<()> {
        let mut state = ScrapeState::default();

        for line in reader.byte_lines() {
            let line = line?;
            let line = String::from_utf8_lossy(&line);
            let fields: Vec<&str> = line.split(separator).collect();

            match Directive::classify(&fields) {
                Directive::End | Directive::GlobalStats | Directive::Title => {}
                Directive::Header { record, columns } => {
                    state.headers.insert(
                        record.to_string(),
                        columns.iter().map(|column| column.to_string()).collect(),
                    );
                }
                Directive::Time { timestamp } => {
                    let value: f64 =
                        timestamp.parse().map_err(|source| Error::InvalidTimestamp {
                            value: timestamp.to_string(),
                            source,
                        })?;
                    sink.emit(MetricTuple {
                        identity: schema::STATUS_UPDATE_TIME,
                        kind: ValueKind::Gauge,
                        value,
                        labels: self.server_label_values(),
                    });
                }
                Directive::Record { keyword } => match self.schemas.get(keyword) {
                    Some(record_schema) => {
                        self.process_row(keyword, record_schema, &fields, &mut state, sink)?;
                    }
                    None => {
                        return Err(Error::UnknownKeyword {
                            keyword: keyword.to_string(),
                        });
                    }
                },
            }
        }

        // The client count closes every scrape, even an empty one.
        sink.emit(MetricTuple {
            identity: schema::CONNECTED_CLIENTS,
            kind: ValueKind::Gauge,
            value: state.connected_clients as f64,
            labels: self.server_label_values(),
        });
        Ok(())
    }

    fn process_row(
        &self,
        keyword: &str,
        record_schema: &RecordSchema,
        fields: &[&str],
        state: &mut ScrapeState,
        sink: &mut dyn MetricSink,
    ) -> Result<()> {
        let columns = state
            .headers
            .get(keyword)
            .ok_or_else(|| Error::MissingHeader {
                record: keyword.to_string(),
            })?;
        if fields.len() != columns.len() + 1 {
            return Err(Error::ColumnMismatch {
                record: keyword.to_string(),
                expected: columns.len(),
                actual: fields.len() - 1,
            });
        }

        // Row values keyed by column name. Label columns default to empty
        // so undeclared ones still contribute a label.
        let mut values: FxHashMap<&str, String> = FxHashMap::default();
        for column in record_schema.label_columns {
            values.insert(*column, String::new());
        }
        for (i, column) in columns.iter().enumerate() {
            values.insert(column.as_str(), fields[i + 1].to_string());
        }

        let common_name = values
            .get(schema::COMMON_NAME)
            .map(String::as_str)
            .unwrap_or("");
        if common_name.is_empty() || common_name == "UNDEF" {
            // Not a usable client entry.
            return Ok(());
        }

        if keyword == schema::CLIENT_LIST {
            state.connected_clients += 1;
        }

        let real_address = values
            .get(schema::REAL_ADDRESS)
            .cloned()
            .unwrap_or_default();
        if !real_address.is_empty() {
            // Strip the ":port" suffix the daemon appends to peer addresses.
            let peer_ip = real_address.split(':').next().unwrap_or_default();
            match self.resolver.resolve(peer_ip) {
                Ok(geo) => {
                    let distance =
                        if self.server.latitude == 0.0 && self.server.longitude == 0.0 {
                            // Self-resolution never succeeded; zero beats a
                            // distance measured from null island.
                            0.0
                        } else {
                            haversine_meters(
                                geo.latitude,
                                geo.longitude,
                                self.server.latitude,
                                self.server.longitude,
                            )
                        };
                    let mut formatted = ryu::Buffer::new();
                    values.insert(
                        schema::DISTANCE_FROM_SERVER,
                        formatted.format(distance).to_string(),
                    );
                    values.insert(schema::GEOHASH, geo.geohash);
                    values.insert(schema::CITY, or_unknown(geo.city));
                    values.insert(schema::REGION, or_unknown(geo.region));
                    values.insert(schema::COUNTRY, or_unknown(geo.country));
                }
                Err(err) => warn!("error resolving geo for {peer_ip:?}: {err:#}"),
            }
        }

        let mut labels = self.server_label_values();
        for column in record_schema.label_columns {
            labels.push(values.get(column).cloned().unwrap_or_default());
        }

        for field in record_schema.metrics {
            let Some(raw) = values.get(field.column) else {
                // Column not declared in this snapshot; nothing to export.
                continue;
            };
            let seen = state.seen.entry(field.identity.name).or_default();
            if seen.contains(&labels) {
                warn!("metric entry with same labels: {}, {:?}", field.column, labels);
                continue;
            }
            let value: f64 = raw.parse().map_err(|source| Error::InvalidValue {
                column: field.column.to_string(),
                value: raw.clone(),
                source,
            })?;
            sink.emit(MetricTuple {
                identity: field.identity,
                kind: field.kind,
                value,
                labels: labels.clone(),
            });
            seen.insert(labels.clone());
        }

        Ok(())
    }
}

fn or_unknown(value: String) -> String {
    if value.is_empty() {
        "Unknown".to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::DisabledResolver;
    use std::io::Cursor;

    /// Resolver serving a fixed table of locations; anything else errors.
    struct TableResolver(FxHashMap<String, Location>);

    impl TableResolver {
        fn new(entries: &[(&str, Location)]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|(address, location)| (address.to_string(), location.clone()))
                    .collect(),
            )
        }
    }

    impl GeoResolver for TableResolver {
        fn resolve(&self, address: &str) -> anyhow::Result<Location> {
            self.0
                .get(address)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown address {address:?}"))
        }
    }

    fn paris() -> Location {
        Location {
            ip: "198.51.100.1".to_string(),
            country: "France".to_string(),
            region: "Ile-de-France".to_string(),
            city: "Paris".to_string(),
            latitude: 48.8566,
            longitude: 2.3522,
            geohash: "u09tvw0f6szy".to_string(),
        }
    }

    fn lisbon() -> Location {
        Location {
            ip: "203.0.113.9".to_string(),
            country: "Portugal".to_string(),
            region: "Lisbon".to_string(),
            city: "Lisbon".to_string(),
            latitude: 38.7223,
            longitude: -9.1393,
            geohash: "eycs0p8ukc7v".to_string(),
        }
    }

    fn offline_exporter() -> Exporter {
        Exporter::new(Box::new(DisabledResolver), "")
    }

    fn collect(exporter: &Exporter, snapshot: &str) -> Result<Vec<MetricTuple>> {
        let mut tuples = Vec::new();
        exporter.collect_from_reader(Cursor::new(snapshot.as_bytes().to_vec()), &mut tuples)?;
        Ok(tuples)
    }

    fn by_name<'t>(tuples: &'t [MetricTuple], name: &str) -> Vec<&'t MetricTuple> {
        tuples
            .iter()
            .filter(|tuple| tuple.identity.name == name)
            .collect()
    }

    #[test]
    fn basic_client_metrics() {
        let exporter = offline_exporter();
        let tuples = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\n\
             TIME,Thu Jun 18 08:12:15 2020,1592467935\n\
             HEADER,CLIENT_LIST,Common Name,Bytes Received,Bytes Sent\n\
             CLIENT_LIST,alice,100,200\n\
             END\n",
        )
        .unwrap();

        let time = by_name(&tuples, "openvpn_status_update_time_seconds");
        assert_eq!(time.len(), 1);
        assert_eq!(time[0].value, 1592467935.0);
        assert_eq!(time[0].labels, vec![""; 5]);

        let received = by_name(&tuples, "openvpn_server_client_received_bytes_total");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].value, 100.0);
        assert_eq!(received[0].kind, ValueKind::Counter);
        assert_eq!(received[0].labels[5], "alice");

        let sent = by_name(&tuples, "openvpn_server_client_sent_bytes_total");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].value, 200.0);

        // No geo resolution, so no distance column and no distance metric.
        assert!(by_name(&tuples, "openvpn_server_client_distance").is_empty());

        let connected = by_name(&tuples, "openvpn_server_connected_clients");
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].value, 1.0);

        // The client count closes the scrape.
        assert_eq!(
            tuples.last().unwrap().identity.name,
            "openvpn_server_connected_clients"
        );
    }

    #[test]
    fn undef_and_anonymous_rows_are_dropped() {
        let exporter = offline_exporter();
        let tuples = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\n\
             HEADER,CLIENT_LIST,Common Name,Bytes Received,Bytes Sent\n\
             CLIENT_LIST,UNDEF,100,200\n\
             CLIENT_LIST,,7,9\n\
             CLIENT_LIST,bob,1,2\n\
             END\n",
        )
        .unwrap();

        assert_eq!(
            by_name(&tuples, "openvpn_server_client_received_bytes_total").len(),
            1
        );
        let connected = by_name(&tuples, "openvpn_server_connected_clients");
        assert_eq!(connected[0].value, 1.0);
    }

    #[test]
    fn missing_header_is_fatal() {
        let exporter = offline_exporter();
        let err = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\nCLIENT_LIST,alice,100,200\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingHeader { .. }));
        assert!(err.to_string().contains("preceded by HEADER"));
    }

    #[test]
    fn column_count_mismatch_is_fatal() {
        let exporter = offline_exporter();
        let err = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\n\
             HEADER,CLIENT_LIST,Common Name,Bytes Received,Bytes Sent\n\
             CLIENT_LIST,alice,100\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ColumnMismatch {
                expected: 3,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn unknown_keyword_is_fatal() {
        let exporter = offline_exporter();
        let err = collect(&exporter, "TITLE,OpenVPN 2.4.4\nFOOBAR,1,2\n").unwrap_err();
        assert!(matches!(err, Error::UnknownKeyword { keyword } if keyword == "FOOBAR"));
    }

    #[test]
    fn malformed_known_keywords_are_fatal_too() {
        let exporter = offline_exporter();
        // TIME with the wrong arity fails its guard and surfaces as an
        // unsupported key.
        let err = collect(&exporter, "TITLE,OpenVPN 2.4.4\nTIME,only one field\n").unwrap_err();
        assert!(matches!(err, Error::UnknownKeyword { keyword } if keyword == "TIME"));
    }

    #[test]
    fn unparsable_timestamp_is_fatal() {
        let exporter = offline_exporter();
        let err = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\nTIME,Thu Jun 18 08:12:15 2020,not-a-number\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidTimestamp { .. }));
    }

    #[test]
    fn unparsable_metric_value_is_fatal() {
        let exporter = offline_exporter();
        let err = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\n\
             HEADER,CLIENT_LIST,Common Name,Bytes Received,Bytes Sent\n\
             CLIENT_LIST,alice,lots,200\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidValue { column, .. } if column == "Bytes Received"));
    }

    #[test]
    fn duplicate_rows_are_emitted_once() {
        let exporter = offline_exporter();
        let tuples = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\n\
             HEADER,CLIENT_LIST,Common Name,Bytes Received,Bytes Sent\n\
             CLIENT_LIST,alice,100,200\n\
             CLIENT_LIST,alice,100,200\n\
             END\n",
        )
        .unwrap();

        assert_eq!(
            by_name(&tuples, "openvpn_server_client_received_bytes_total").len(),
            1
        );
        // Both rows still count as connected clients.
        let connected = by_name(&tuples, "openvpn_server_connected_clients");
        assert_eq!(connected[0].value, 2.0);
    }

    #[test]
    fn swapped_column_values_are_distinct_rows() {
        // The two rows share the same set of label values in different
        // positions; deduplication is by exact label vector, so both emit.
        let exporter = offline_exporter();
        let tuples = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\n\
             HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address,Bytes Received,Bytes Sent\n\
             CLIENT_LIST,alice,a,b,100,200\n\
             CLIENT_LIST,alice,b,a,100,200\n\
             END\n",
        )
        .unwrap();

        assert_eq!(
            by_name(&tuples, "openvpn_server_client_received_bytes_total").len(),
            2
        );
    }

    #[test]
    fn geo_enrichment_fills_labels_and_distance() {
        let resolver = TableResolver::new(&[("", paris()), ("203.0.113.9", lisbon())]);
        let exporter = Exporter::new(Box::new(resolver), "");
        assert_eq!(exporter.server_location().city, "Paris");

        let tuples = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\n\
             HEADER,CLIENT_LIST,Common Name,Real Address,Bytes Received,Bytes Sent\n\
             CLIENT_LIST,alice,203.0.113.9:54321,100,200\n\
             END\n",
        )
        .unwrap();

        let received = by_name(&tuples, "openvpn_server_client_received_bytes_total");
        assert_eq!(received.len(), 1);
        let labels = &received[0].labels;
        // Server prefix.
        assert_eq!(labels[0], "u09tvw0f6szy");
        assert_eq!(labels[1], "Paris");
        assert_eq!(labels[4], "198.51.100.1");
        // Peer columns: the port is kept in the label, stripped for lookup.
        assert_eq!(labels[7], "203.0.113.9:54321");
        assert_eq!(labels[10], "eycs0p8ukc7v");
        assert_eq!(labels[11], "Lisbon");
        assert_eq!(labels[12], "Portugal");
        assert_eq!(labels[13], "Lisbon");

        // Paris to Lisbon, roughly 1450 km.
        let distance = by_name(&tuples, "openvpn_server_client_distance");
        assert_eq!(distance.len(), 1);
        assert!(
            (1_400_000.0..1_500_000.0).contains(&distance[0].value),
            "got {}",
            distance[0].value
        );
    }

    #[test]
    fn empty_geo_fields_become_unknown() {
        let mut nowhere = lisbon();
        nowhere.city = String::new();
        nowhere.region = String::new();
        nowhere.country = String::new();
        let resolver = TableResolver::new(&[("", paris()), ("203.0.113.9", nowhere)]);
        let exporter = Exporter::new(Box::new(resolver), "");

        let tuples = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\n\
             HEADER,CLIENT_LIST,Common Name,Real Address,Bytes Received,Bytes Sent\n\
             CLIENT_LIST,alice,203.0.113.9:54321,100,200\n\
             END\n",
        )
        .unwrap();

        let received = by_name(&tuples, "openvpn_server_client_received_bytes_total");
        assert_eq!(received[0].labels[11], "Unknown");
        assert_eq!(received[0].labels[12], "Unknown");
        assert_eq!(received[0].labels[13], "Unknown");
        // The geohash has no Unknown fallback.
        assert_eq!(received[0].labels[10], "eycs0p8ukc7v");
    }

    #[test]
    fn failed_server_resolution_zeroes_distances() {
        // The resolver knows the peer but not the server's own address.
        let resolver = TableResolver::new(&[("203.0.113.9", lisbon())]);
        let exporter = Exporter::new(Box::new(resolver), "");
        assert_eq!(exporter.server_location(), &Location::default());

        let tuples = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\n\
             HEADER,CLIENT_LIST,Common Name,Real Address,Bytes Received,Bytes Sent\n\
             CLIENT_LIST,alice,203.0.113.9:54321,100,200\n\
             END\n",
        )
        .unwrap();

        let distance = by_name(&tuples, "openvpn_server_client_distance");
        assert_eq!(distance.len(), 1);
        assert_eq!(distance[0].value, 0.0);

        let received = by_name(&tuples, "openvpn_server_client_received_bytes_total");
        assert_eq!(received[0].labels[..5], ["", "", "", "", ""]);
        // Peer geo still resolved.
        assert_eq!(received[0].labels[11], "Lisbon");
    }

    #[test]
    fn failed_peer_resolution_keeps_row_with_empty_geo() {
        let resolver = TableResolver::new(&[("", paris())]);
        let exporter = Exporter::new(Box::new(resolver), "");

        let tuples = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\n\
             HEADER,CLIENT_LIST,Common Name,Real Address,Bytes Received,Bytes Sent\n\
             CLIENT_LIST,alice,203.0.113.9:54321,100,200\n\
             END\n",
        )
        .unwrap();

        let received = by_name(&tuples, "openvpn_server_client_received_bytes_total");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].labels[10], "");
        assert_eq!(received[0].labels[11], "");
        assert!(by_name(&tuples, "openvpn_server_client_distance").is_empty());
    }

    #[test]
    fn routing_table_rows_export_last_reference() {
        let exporter = offline_exporter();
        let tuples = collect(
            &exporter,
            "TITLE,OpenVPN 2.4.4\n\
             HEADER,ROUTING_TABLE,Virtual Address,Common Name,Real Address,Last Ref,Last Ref (time_t)\n\
             ROUTING_TABLE,10.8.0.3,alice,203.0.113.9:54321,Thu Jun 18 08:12:15 2020,1592467935\n\
             END\n",
        )
        .unwrap();

        let last_ref = by_name(
            &tuples,
            "openvpn_server_route_last_reference_time_seconds",
        );
        assert_eq!(last_ref.len(), 1);
        assert_eq!(last_ref[0].value, 1592467935.0);
        assert_eq!(last_ref[0].labels.len(), 13);
        assert_eq!(last_ref[0].labels[5], "alice");

        // Routing rows are not connected clients.
        let connected = by_name(&tuples, "openvpn_server_connected_clients");
        assert_eq!(connected[0].value, 0.0);
    }

    #[test]
    fn empty_snapshot_still_reports_zero_clients() {
        let exporter = offline_exporter();
        let tuples = collect(&exporter, "TITLE,OpenVPN 2.4.4\nEND\n").unwrap();
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].identity.name, "openvpn_server_connected_clients");
        assert_eq!(tuples[0].value, 0.0);
    }

    #[test]
    fn tab_separated_v3_snapshots_parse() {
        let exporter = offline_exporter();
        let tuples = collect(
            &exporter,
            "TITLE\tOpenVPN 2.5.1\n\
             HEADER\tCLIENT_LIST\tCommon Name\tBytes Received\tBytes Sent\n\
             CLIENT_LIST\talice\t100\t200\n\
             END\n",
        )
        .unwrap();

        assert_eq!(
            by_name(&tuples, "openvpn_server_client_received_bytes_total").len(),
            1
        );
    }

    #[test]
    fn client_mode_files_are_rejected() {
        let exporter = offline_exporter();
        let err = collect(&exporter, "OpenVPN STATISTICS\nUpdated,Thu Jun 18\n").unwrap_err();
        assert!(matches!(err, Error::ClientFormat));
        let err = collect(&exporter, "garbage\n").unwrap_err();
        assert!(matches!(err, Error::UnrecognizedFormat { .. }));
    }
}
