//! Orchestrator lifecycle coverage at the public-API boundary: responsiveness
//! to external shutdown, including while a session is permanently stuck in
//! discovery because the configured network never produces a boiler.

use boiler_proxy::config::load_config_from_str;
use boiler_proxy::orchestrator::Orchestrator;
use boiler_proxy::shutdown::Shutdown;
use tokio::time::{timeout, Duration};

/// An interface name guaranteed not to exist, so every socket bind attempt
/// on it fails fast with `SO_BINDTODEVICE` / ENODEV rather than hanging.
const UNREACHABLE_IFACE_A: &str = "boiler-proxy-test-iface-a";
const UNREACHABLE_IFACE_B: &str = "boiler-proxy-test-iface-b";

fn unreachable_network_config() -> boiler_proxy::config::ProxyConfig {
    let toml = format!(
        r#"
        [network]
        gateway_iface = "{UNREACHABLE_IFACE_A}"
        boiler_iface = "{UNREACHABLE_IFACE_B}"
        "#
    );
    load_config_from_str(&toml).unwrap()
}

#[tokio::test]
async fn external_shutdown_interrupts_a_session_stuck_in_discovery() {
    // Neither relay can ever bind, so no `BL_ADDR` is ever published and
    // `TelnetProxy::discover` would otherwise block forever. Before the fix
    // that merges external shutdown into every component's handle, only a
    // session-local teardown (which never happens here, since the session
    // never finishes starting) could unblock discovery.
    let config = unreachable_network_config();
    let orchestrator = Orchestrator::new(config);
    let (shutdown, handle) = Shutdown::new();

    let run_task = tokio::spawn(async move { orchestrator.run(handle).await });

    // Give the relay tasks time to fail and the session to settle into its
    // blocked discovery wait before asking it to stop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.request();

    timeout(Duration::from_secs(2), run_task)
        .await
        .expect("orchestrator did not exit promptly after external shutdown during discovery")
        .expect("orchestrator task panicked");
}

#[tokio::test]
async fn shutdown_requested_up_front_is_observed_across_repeated_run_calls() {
    let config = unreachable_network_config();
    let orchestrator = Orchestrator::new(config);
    let (shutdown, handle) = Shutdown::new();
    shutdown.request();

    // Every call with a clone of an already-requested handle must return
    // immediately without attempting to stand up a session.
    for _ in 0..2 {
        timeout(Duration::from_secs(1), orchestrator.run(handle.clone()))
            .await
            .expect("run() must return promptly once shutdown was already requested");
    }
}
