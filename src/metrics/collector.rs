//! Prometheus Metrics Collector

use std::time::Duration;

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use tracing::error;

use super::types::{ProxyMetrics, TrafficCounts};

const NAMESPACE: &str = "portmux";

/// A labelled family of monotonic counters.
pub trait CounterFamily {
    fn add(&self, label_values: &[&str], value: u64);
}

impl CounterFamily for IntCounterVec {
    fn add(&self, label_values: &[&str], value: u64) {
        self.with_label_values(label_values).inc_by(value);
    }
}

/// Records `value` only when it is strictly positive.
///
/// A zero delta must not create the series, otherwise every access key and
/// client address would carry a permanently zero series per direction.
pub fn add_if_non_zero<C: CounterFamily + ?Sized>(value: u64, family: &C, label_values: &[&str]) {
    if value > 0 {
        family.add(label_values, value);
    }
}

fn is_found(access_key: &str) -> &'static str {
    if access_key.is_empty() {
        "false"
    } else {
        "true"
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// [`ProxyMetrics`] backed by a Prometheus registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    build_info: IntGaugeVec,
    access_keys: IntGauge,
    ports: IntGauge,
    data_bytes: IntCounterVec,
    time_to_cipher_ms: HistogramVec,

    tcp_probes: HistogramVec,
    tcp_open_connections: IntCounterVec,
    tcp_closed_connections: IntCounterVec,
    tcp_connection_duration_ms: HistogramVec,

    udp_added_nat_entries: IntCounter,
    udp_removed_nat_entries: IntCounter,
}

impl PrometheusMetrics {
    /// Create the collectors and register them with `registry`.
    pub fn new(registry: Registry) -> prometheus::Result<Self> {
        let build_info = IntGaugeVec::new(
            Opts::new("build_info", "Information on the portmux build").namespace(NAMESPACE),
            &["version"],
        )?;
        let access_keys = IntGauge::with_opts(
            Opts::new("keys", "Count of access keys").namespace(NAMESPACE),
        )?;
        let ports = IntGauge::with_opts(
            Opts::new("ports", "Count of open proxy ports").namespace(NAMESPACE),
        )?;
        let tcp_probes = HistogramVec::new(
            HistogramOpts::new(
                "tcp_probes",
                "Histogram of number of bytes from client to proxy, for detecting possible probes",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0, 49.0, 50.0, 51.0, 73.0, 91.0]),
            &["port", "status", "error"],
        )?;
        let tcp_open_connections = IntCounterVec::new(
            Opts::new("connections_opened", "Count of open TCP connections")
                .namespace(NAMESPACE)
                .subsystem("tcp"),
            &["ip"],
        )?;
        let tcp_closed_connections = IntCounterVec::new(
            Opts::new("connections_closed", "Count of closed TCP connections")
                .namespace(NAMESPACE)
                .subsystem("tcp"),
            &["ip", "status", "access_key"],
        )?;
        let tcp_connection_duration_ms = HistogramVec::new(
            HistogramOpts::new("connection_duration_ms", "TCP connection duration distributions.")
                .namespace(NAMESPACE)
                .subsystem("tcp")
                .buckets(vec![
                    100.0,
                    1_000.0,           // second
                    60_000.0,          // minute
                    3_600_000.0,       // hour
                    86_400_000.0,      // day
                    604_800_000.0,     // week
                ]),
            &["status"],
        )?;
        let data_bytes = IntCounterVec::new(
            Opts::new("data_bytes", "Bytes transferred by the proxy, per access key and ip")
                .namespace(NAMESPACE),
            &["dir", "proto", "access_key", "ip"],
        )?;
        let time_to_cipher_ms = HistogramVec::new(
            HistogramOpts::new("time_to_cipher_ms", "Time needed to find the cipher")
                .namespace(NAMESPACE)
                .buckets(vec![0.1, 1.0, 10.0, 100.0, 1000.0]),
            &["proto", "found_key"],
        )?;
        let udp_added_nat_entries = IntCounter::with_opts(
            Opts::new("nat_entries_added", "Entries added to the UDP NAT table")
                .namespace(NAMESPACE)
                .subsystem("udp"),
        )?;
        let udp_removed_nat_entries = IntCounter::with_opts(
            Opts::new("nat_entries_removed", "Entries removed from the UDP NAT table")
                .namespace(NAMESPACE)
                .subsystem("udp"),
        )?;

        registry.register(Box::new(build_info.clone()))?;
        registry.register(Box::new(access_keys.clone()))?;
        registry.register(Box::new(ports.clone()))?;
        registry.register(Box::new(tcp_probes.clone()))?;
        registry.register(Box::new(tcp_open_connections.clone()))?;
        registry.register(Box::new(tcp_closed_connections.clone()))?;
        registry.register(Box::new(tcp_connection_duration_ms.clone()))?;
        registry.register(Box::new(data_bytes.clone()))?;
        registry.register(Box::new(time_to_cipher_ms.clone()))?;
        registry.register(Box::new(udp_added_nat_entries.clone()))?;
        registry.register(Box::new(udp_removed_nat_entries.clone()))?;

        Ok(Self {
            registry,
            build_info,
            access_keys,
            ports,
            data_bytes,
            time_to_cipher_ms,
            tcp_probes,
            tcp_open_connections,
            tcp_closed_connections,
            tcp_connection_duration_ms,
            udp_added_nat_entries,
            udp_removed_nat_entries,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }

    fn observe(histogram: &Histogram, value: f64) {
        histogram.observe(value);
    }
}

impl ProxyMetrics for PrometheusMetrics {
    fn set_build_info(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1);
    }

    fn set_num_access_keys(&self, num_keys: usize, num_ports: usize) {
        self.access_keys.set(num_keys as i64);
        self.ports.set(num_ports as i64);
    }

    fn add_open_tcp_connection(&self, client_ip: &str) {
        self.tcp_open_connections.with_label_values(&[client_ip]).inc();
    }

    fn add_closed_tcp_connection(
        &self,
        client_ip: &str,
        access_key: &str,
        status: &str,
        data: TrafficCounts,
        time_to_cipher: Duration,
        duration: Duration,
    ) {
        self.tcp_closed_connections
            .with_label_values(&[client_ip, status, access_key])
            .inc();
        Self::observe(
            &self.tcp_connection_duration_ms.with_label_values(&[status]),
            millis(duration),
        );
        Self::observe(
            &self.time_to_cipher_ms.with_label_values(&["tcp", is_found(access_key)]),
            millis(time_to_cipher),
        );
        add_if_non_zero(data.client_proxy, &self.data_bytes, &["c>p", "tcp", access_key, client_ip]);
        add_if_non_zero(data.proxy_target, &self.data_bytes, &["p>t", "tcp", access_key, client_ip]);
        add_if_non_zero(data.target_proxy, &self.data_bytes, &["p<t", "tcp", access_key, client_ip]);
        add_if_non_zero(data.proxy_client, &self.data_bytes, &["c<p", "tcp", access_key, client_ip]);
    }

    fn add_tcp_probe(&self, status: &str, drain_result: &str, port: u16, data: TrafficCounts) {
        let port = port.to_string();
        Self::observe(
            &self.tcp_probes.with_label_values(&[port.as_str(), status, drain_result]),
            data.client_proxy as f64,
        );
    }

    fn add_udp_packet_from_client(
        &self,
        client_ip: &str,
        access_key: &str,
        _status: &str,
        client_proxy_bytes: usize,
        proxy_target_bytes: usize,
        time_to_cipher: Duration,
    ) {
        Self::observe(
            &self.time_to_cipher_ms.with_label_values(&["udp", is_found(access_key)]),
            millis(time_to_cipher),
        );
        add_if_non_zero(client_proxy_bytes as u64, &self.data_bytes, &["c>p", "udp", access_key, client_ip]);
        add_if_non_zero(proxy_target_bytes as u64, &self.data_bytes, &["p>t", "udp", access_key, client_ip]);
    }

    fn add_udp_packet_from_target(
        &self,
        client_ip: &str,
        access_key: &str,
        _status: &str,
        target_proxy_bytes: usize,
        proxy_client_bytes: usize,
    ) {
        add_if_non_zero(target_proxy_bytes as u64, &self.data_bytes, &["p<t", "udp", access_key, client_ip]);
        add_if_non_zero(proxy_client_bytes as u64, &self.data_bytes, &["c<p", "udp", access_key, client_ip]);
    }

    fn add_udp_nat_entry(&self) {
        self.udp_added_nat_entries.inc();
    }

    fn remove_udp_nat_entry(&self) {
        self.udp_removed_nat_entries.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingFamily {
        observations: Mutex<Vec<(Vec<String>, u64)>>,
    }

    impl CounterFamily for RecordingFamily {
        fn add(&self, label_values: &[&str], value: u64) {
            self.observations.lock().unwrap().push((
                label_values.iter().map(|v| v.to_string()).collect(),
                value,
            ));
        }
    }

    fn data_bytes_series(metrics: &PrometheusMetrics) -> Vec<prometheus::proto::Metric> {
        metrics
            .registry()
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "portmux_data_bytes")
            .map(|family| family.get_metric().to_vec())
            .unwrap_or_default()
    }

    #[test]
    fn test_add_if_non_zero_sequence() {
        let family = RecordingFamily::default();
        let labels = ["c>p", "tcp", "key-1", "127.0.0.1"];

        for (i, delta) in [0u64, 0, 5, 0, 3].into_iter().enumerate() {
            add_if_non_zero(delta, &family, &labels);
            if i < 2 {
                assert!(family.observations.lock().unwrap().is_empty());
            }
        }

        let observations = family.observations.lock().unwrap();
        let values: Vec<u64> = observations.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![5, 3]);
    }

    #[test]
    fn test_zero_delta_creates_no_series() {
        let metrics = PrometheusMetrics::new(Registry::new()).unwrap();
        let labels = ["c>p", "tcp", "key-1", "127.0.0.1"];

        add_if_non_zero(0, &metrics.data_bytes, &labels);
        add_if_non_zero(0, &metrics.data_bytes, &labels);
        assert!(data_bytes_series(&metrics).is_empty());

        add_if_non_zero(5, &metrics.data_bytes, &labels);
        add_if_non_zero(0, &metrics.data_bytes, &labels);
        add_if_non_zero(3, &metrics.data_bytes, &labels);

        let series = data_bytes_series(&metrics);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].get_counter().get_value(), 8.0);
    }

    #[test]
    fn test_methods_dont_panic() {
        let metrics = PrometheusMetrics::new(Registry::new()).unwrap();
        let data = TrafficCounts {
            client_proxy: 1,
            proxy_target: 2,
            target_proxy: 3,
            proxy_client: 4,
        };
        metrics.set_build_info("dev");
        metrics.set_num_access_keys(20, 2);
        metrics.add_open_tcp_connection("127.0.0.1");
        metrics.add_closed_tcp_connection(
            "127.0.0.1",
            "1",
            "OK",
            data,
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        metrics.add_tcp_probe("ERR_CIPHER", "eof", 443, data);
        metrics.add_udp_packet_from_client("127.0.0.1", "2", "OK", 10, 20, Duration::from_millis(10));
        metrics.add_udp_packet_from_target("127.0.0.1", "3", "OK", 10, 20);
        metrics.add_udp_nat_entry();
        metrics.remove_udp_nat_entry();

        let text = metrics.export();
        assert!(text.contains("portmux_keys 20"));
        assert!(text.contains("portmux_ports 2"));
        assert!(text.contains("portmux_udp_nat_entries_added 1"));
    }

    #[test]
    fn test_closed_connection_skips_zero_directions() {
        let metrics = PrometheusMetrics::new(Registry::new()).unwrap();
        let data = TrafficCounts {
            client_proxy: 12,
            ..Default::default()
        };
        metrics.add_closed_tcp_connection(
            "10.0.0.1",
            "key",
            "OK",
            data,
            Duration::ZERO,
            Duration::ZERO,
        );

        let series = data_bytes_series(&metrics);
        assert_eq!(series.len(), 1);
        let dir = series[0]
            .get_label()
            .iter()
            .find(|label| label.get_name() == "dir")
            .map(|label| label.get_value().to_string());
        assert_eq!(dir.as_deref(), Some("c>p"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        PrometheusMetrics::new(registry.clone()).unwrap();
        assert!(PrometheusMetrics::new(registry).is_err());
    }
}
