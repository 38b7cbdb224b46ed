mod agent;
mod async_task;
mod backbone;
mod config;
mod mdns;
mod ncp;
mod sdp_proxy;

use std::ffi::CString;

use anyhow::{bail, Context, Result};
use mdns_sd::ServiceDaemon;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::backbone::MulticastRoutingManager;
use crate::config::Config;
use crate::mdns::MdnsPublisher;
use crate::ncp::ncp_spinel::NcpSpinel;

fn interface_index(name: &str) -> Result<u32> {
    let c_name = CString::new(name).with_context(|| format!("Invalid interface name {:?}", name))?;
    // SAFETY: c_name is a valid NUL-terminated string that outlives the call.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(std::io::Error::last_os_error()).with_context(|| format!("Unknown interface {}", name));
    }
    Ok(index)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("border_agentd=info")),
        )
        .init();

    tracing::info!("Starting border-agentd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/border-agent/agent.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let active_dataset = config.ncp.active_dataset_tlvs()?;
    let thread_ifindex = interface_index(&config.interfaces.thread)?;
    let backbone_ifindex = interface_index(&config.interfaces.backbone)?;

    let cancel = CancellationToken::new();
    // The radio outlives the agent loop so a leave can finish after shutdown starts
    let radio_cancel = CancellationToken::new();

    let radio = ncp::device::open(&config.ncp.device, config.ncp.baudrate, radio_cancel.clone())?;

    // mDNS only runs on the backbone link
    let mdns_daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
    mdns_daemon
        .disable_interface(mdns_sd::IfKind::All)
        .context("Failed to disable default interfaces")?;
    mdns_daemon
        .enable_interface(config.interfaces.backbone.as_str())
        .with_context(|| format!("Failed to enable interface {}", config.interfaces.backbone))?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (publisher, browser_handle) = MdnsPublisher::start(mdns_daemon.clone(), event_tx, cancel.clone());

    let mut ncp = NcpSpinel::new(config.ncp.iid, Box::new(radio.interface));
    ncp.refresh_properties();

    let multicast = config.multicast.enabled.then(|| {
        MulticastRoutingManager::new(
            &config.multicast,
            thread_ifindex,
            backbone_ifindex,
            Box::new(backbone::mrt6::Mrt6Socket::open),
        )
    });

    let mut agent = Agent::new(&config, ncp, publisher, multicast)?;

    if let Some(tlvs) = active_dataset {
        tracing::info!("Joining network with configured active dataset");
        agent.ncp_mut().join(tlvs, |result| match result {
            Ok(()) => tracing::info!("Joined Thread network"),
            Err(e) => tracing::error!("Failed to join Thread network: {}", e),
        });
    }

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
        }
        signal_cancel.cancel();
    });

    // The agent owns non-Send state, so it runs on the main task
    let outcome = agent
        .run(radio.frames, event_rx, config.multicast.expire_interval(), cancel.clone())
        .await;

    cancel.cancel();
    radio_cancel.cancel();

    agent.publisher_mut().shutdown();

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    let _ = browser_handle.await;
    // the radio writer stops once the agent's interface is gone
    drop(agent);
    for task in radio.tasks {
        let _ = task.await;
    }

    match outcome {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            Ok(())
        }
        Err(e) => bail!("Agent stopped: {:#}", e),
    }
}
