//! Outermost session lifecycle: discovery → bind → service → restart.
//!
//! Creates a fresh [`PubSub`] and fresh instances of every other component
//! for each session (§4.6). No component survives a restart — the whole
//! pipeline is torn down and rebuilt, trading a few milliseconds of startup
//! cost for a total absence of stale-state bugs across sessions (§9).

use crate::config::ProxyConfig;
use crate::pubsub::PubSub;
use crate::shutdown::{Shutdown, ShutdownHandle};
use crate::telnet_proxy::TelnetProxy;
use crate::udp_relay::{BoilerRelay, GatewayRelay};
use std::time::Duration;
use tracing::{error, info, warn};

const SYSTEM_CHANNEL: &str = "system";
const RESTART_REQUESTED: &str = "RESTART_REQUESTED";

/// Delay between a clean session end and starting the next one.
const RESTART_DELAY: Duration = Duration::from_millis(500);
/// Longer backoff after a session failed to even start (e.g. bind/connect
/// failure), so a persistently failing environment does not spin tightly.
const SETUP_FAILURE_BACKOFF: Duration = Duration::from_secs(5);
/// Bound on how long teardown waits for each worker task to join.
const WORKER_JOIN_BUDGET: Duration = Duration::from_secs(3);

pub struct Orchestrator {
    config: ProxyConfig,
}

impl Orchestrator {
    pub fn new(config: ProxyConfig) -> Self {
        Orchestrator { config }
    }

    /// Runs sessions back-to-back until `external_shutdown` is requested.
    pub async fn run(&self, mut external_shutdown: ShutdownHandle) {
        loop {
            if external_shutdown.is_requested() {
                info!("orchestrator: external shutdown requested, not starting a new session");
                return;
            }
            match self.run_session(external_shutdown.clone()).await {
                Ok(()) => {
                    tokio::time::sleep(RESTART_DELAY).await;
                }
                Err(e) => {
                    error!(error = %e, "session setup failed, backing off before retry");
                    tokio::time::sleep(SETUP_FAILURE_BACKOFF).await;
                }
            }
        }
    }

    /// Runs one full session: fresh bus, fresh components, until a restart
    /// is requested (by a component or by `external_shutdown`), then tears
    /// everything down. Returns once teardown is complete.
    async fn run_session(&self, mut external_shutdown: ShutdownHandle) -> Result<(), SessionSetupError> {
        let bus = PubSub::new(crate::pubsub::DEFAULT_QUEUE_CAPACITY);
        let (session_shutdown, session_handle) = Shutdown::new();
        // Every component watches the merge of the two signals: an external
        // shutdown must interrupt a component at any phase (including while
        // still discovering peers), and a session-local teardown must stop
        // the relays without tearing down the process.
        let shutdown_handle = Shutdown::merge(external_shutdown.clone(), session_handle);
        let mut system_sub = bus.subscribe(SYSTEM_CHANNEL, "orchestrator");

        // Startup order: boiler-side relay, then gateway-side relay, then
        // TelnetProxy (§4.6) — the boiler side must subscribe to
        // `bootstrap` before the gateway side can possibly publish to it.
        let boiler_relay = BoilerRelay::new(bus.clone(), self.config.network.clone());
        let boiler_handle = shutdown_handle.clone();
        let boiler_task = tokio::spawn(async move { boiler_relay.run(boiler_handle).await });

        let gateway_relay = GatewayRelay::new(bus.clone(), self.config.network.clone());
        let gateway_handle = shutdown_handle.clone();
        let gateway_task = tokio::spawn(async move { gateway_relay.run(gateway_handle).await });

        let telnet_proxy = TelnetProxy::new(
            bus.clone(),
            self.config.network.clone(),
            self.config.analyser.clone(),
        );
        let mut discover_handle = shutdown_handle.clone();
        let Some((boiler_addr, reconnect_sub)) = telnet_proxy.discover(&mut discover_handle).await else {
            info!("telnet proxy discovery aborted by shutdown");
            session_shutdown.request();
            join_all(boiler_task, gateway_task).await;
            return Ok(());
        };

        let mut accept_handle = shutdown_handle.clone();
        let accepted = telnet_proxy
            .bind_listen_accept(&mut accept_handle)
            .await
            .map_err(SessionSetupError::Telnet)?;
        let Some((igw_stream, aux_stream)) = accepted else {
            session_shutdown.request();
            join_all(boiler_task, gateway_task).await;
            return Ok(());
        };

        let boiler_stream = telnet_proxy
            .connect(boiler_addr)
            .await
            .map_err(SessionSetupError::Telnet)?;

        let telnet_handle = shutdown_handle.clone();
        let telnet_task = tokio::spawn(async move {
            telnet_proxy
                .service(igw_stream, aux_stream, boiler_stream, reconnect_sub, telnet_handle)
                .await
        });

        // Wait for either a RESTART_REQUESTED on `system` or the external
        // shutdown signal. A component-detected session end (TelnetProxy
        // exiting its loop) reaches here only via its own RESTART_REQUESTED
        // publication, which happens before the task returns.
        tokio::select! {
            biased;
            () = external_shutdown.requested() => {
                info!("orchestrator: external shutdown during active session");
            }
            msg = system_sub.recv() => {
                match msg {
                    Ok(m) if m == RESTART_REQUESTED => {
                        info!("session ended, restart requested");
                    }
                    Ok(other) => {
                        warn!(message = %other, "unexpected message on system channel");
                    }
                    Err(_) => {
                        warn!("system channel closed unexpectedly");
                    }
                }
            }
        }

        // Teardown order is the exact reverse of startup: TelnetProxy
        // first, then gateway-side relay, then boiler-side relay (§4.6).
        session_shutdown.request();
        join_with_budget("telnet proxy", telnet_task).await;
        join_with_budget("gateway relay", gateway_task).await;
        join_with_budget("boiler relay", boiler_task).await;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum SessionSetupError {
    #[error("telnet proxy setup failed: {0}")]
    Telnet(#[from] crate::telnet_proxy::TelnetProxyError),
}

/// Waits up to [`WORKER_JOIN_BUDGET`] for a worker to join; logs (but does
/// not panic on) a worker that fails to exit within the budget and proceeds
/// regardless, per the teardown protocol in §4.6.
async fn join_with_budget<T: Send + 'static>(name: &str, task: tokio::task::JoinHandle<T>) {
    match tokio::time::timeout(WORKER_JOIN_BUDGET, task).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(worker = name, error = %e, "worker task panicked"),
        Err(_) => warn!(worker = name, "worker did not exit within the teardown budget"),
    }
}

/// Used when discovery/accept is aborted by shutdown before the TelnetProxy
/// task itself was ever spawned — only the two relays need joining.
async fn join_all<A: Send + 'static, B: Send + 'static>(
    a: tokio::task::JoinHandle<A>,
    b: tokio::task::JoinHandle<B>,
) {
    join_with_budget("gateway relay", a).await;
    join_with_budget("boiler relay", b).await;
}
