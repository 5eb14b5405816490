//! Integration tests for metrics recorder installation.

use flowsentry_core::config::MetricsConfig;
use flowsentry_daemon::metrics_server;
use serial_test::serial;

fn config(listen_addr: &str, port: u16, endpoint: &str) -> MetricsConfig {
    MetricsConfig {
        enabled: true,
        listen_addr: listen_addr.to_owned(),
        port,
        endpoint: endpoint.to_owned(),
    }
}

#[test]
#[serial]
fn test_install_metrics_recorder_fails_with_invalid_address() {
    let result = metrics_server::install_metrics_recorder(&config("999.999.999.999", 9100, "/metrics"));
    assert!(result.is_err());
}

#[test]
#[serial]
fn test_install_metrics_recorder_rejects_unsupported_endpoint() {
    let result = metrics_server::install_metrics_recorder(&config("127.0.0.1", 19201, "/custom"));
    let err = result.unwrap_err().to_string();
    assert!(err.contains("unsupported metrics endpoint"), "got: {err}");
}

#[test]
#[serial]
fn test_install_metrics_recorder_succeeds_once() {
    let first = metrics_server::install_metrics_recorder(&config("127.0.0.1", 19202, "/metrics"));
    assert!(first.is_ok(), "first install should succeed: {:?}", first.err());

    let second = metrics_server::install_metrics_recorder(&config("127.0.0.1", 19203, "/metrics"));
    assert!(second.is_err(), "global recorder can only be installed once");
}
