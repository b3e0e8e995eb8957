//! Metrics Types
//!
//! The capability set the proxy core reports through. Backends are replaceable;
//! [`NoOpMetrics`] discards everything.

use std::time::Duration;

/// Bytes moved over one proxied connection, per hop and direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounts {
    pub client_proxy: u64,
    pub proxy_target: u64,
    pub target_proxy: u64,
    pub proxy_client: u64,
}

impl TrafficCounts {
    pub fn total(&self) -> u64 {
        self.client_proxy + self.proxy_target + self.target_proxy + self.proxy_client
    }
}

/// Metrics sink for the proxy service.
pub trait ProxyMetrics: Send + Sync {
    fn set_build_info(&self, version: &str);

    fn set_num_access_keys(&self, num_keys: usize, num_ports: usize);

    // TCP metrics
    fn add_open_tcp_connection(&self, client_ip: &str);
    fn add_closed_tcp_connection(
        &self,
        client_ip: &str,
        access_key: &str,
        status: &str,
        data: TrafficCounts,
        time_to_cipher: Duration,
        duration: Duration,
    );
    fn add_tcp_probe(&self, status: &str, drain_result: &str, port: u16, data: TrafficCounts);

    // UDP metrics
    fn add_udp_packet_from_client(
        &self,
        client_ip: &str,
        access_key: &str,
        status: &str,
        client_proxy_bytes: usize,
        proxy_target_bytes: usize,
        time_to_cipher: Duration,
    );
    fn add_udp_packet_from_target(
        &self,
        client_ip: &str,
        access_key: &str,
        status: &str,
        target_proxy_bytes: usize,
        proxy_client_bytes: usize,
    );
    fn add_udp_nat_entry(&self);
    fn remove_udp_nat_entry(&self);
}

/// Discards every observation. Useful in tests or when metrics are not wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl ProxyMetrics for NoOpMetrics {
    fn set_build_info(&self, _version: &str) {}
    fn set_num_access_keys(&self, _num_keys: usize, _num_ports: usize) {}
    fn add_open_tcp_connection(&self, _client_ip: &str) {}
    fn add_closed_tcp_connection(
        &self,
        _client_ip: &str,
        _access_key: &str,
        _status: &str,
        _data: TrafficCounts,
        _time_to_cipher: Duration,
        _duration: Duration,
    ) {
    }
    fn add_tcp_probe(&self, _status: &str, _drain_result: &str, _port: u16, _data: TrafficCounts) {}
    fn add_udp_packet_from_client(
        &self,
        _client_ip: &str,
        _access_key: &str,
        _status: &str,
        _client_proxy_bytes: usize,
        _proxy_target_bytes: usize,
        _time_to_cipher: Duration,
    ) {
    }
    fn add_udp_packet_from_target(
        &self,
        _client_ip: &str,
        _access_key: &str,
        _status: &str,
        _target_proxy_bytes: usize,
        _proxy_client_bytes: usize,
    ) {
    }
    fn add_udp_nat_entry(&self) {}
    fn remove_udp_nat_entry(&self) {}
}
