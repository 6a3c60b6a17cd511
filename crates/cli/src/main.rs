//! hid-host CLI: runs the HID host against an in-process loopback device.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hid_host_core::dispatch::StateObserver;
use hid_host_core::sim::{Loopback, PeerOptions, UhidCall};
use hid_host_core::{
    ConnectionState, DeviceAddress, HidHostService, HostConfig, OutboundReport, ReportType,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(
    name = "hid-host",
    version,
    about = "Bluetooth HID host connection manager"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Transport {
    Classic,
    Ble,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a loopback keyboard, exchange reports and disconnect.
    Simulate {
        /// Transport the simulated device is paired over.
        #[arg(long, value_enum, default_value = "classic")]
        transport: Transport,
        /// Device address (AA:BB:CC:DD:EE:FF).
        #[arg(long, default_value = "00:1B:DC:00:00:01")]
        address: String,
        /// Name recorded for the device in the paired registry.
        #[arg(long, default_value = "Loopback Keyboard")]
        name: String,
        /// JSON config file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Make the device fail security.
        #[arg(long)]
        reject_security: bool,
        /// Make the device never answer the battery level read.
        #[arg(long)]
        silent_battery: bool,
    },
    /// Print the effective configuration as JSON.
    ShowConfig {
        /// JSON config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Forwards state changes to the CLI task.
struct ChannelObserver(mpsc::UnboundedSender<(DeviceAddress, ConnectionState)>);

impl StateObserver for ChannelObserver {
    fn on_connection_state_changed(&self, address: &DeviceAddress, state: ConnectionState) {
        let _ = self.0.send((address.clone(), state));
    }
}

fn load_config(path: Option<&Path>) -> Result<HostConfig> {
    match path {
        Some(path) => HostConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(HostConfig::default()),
    }
}

/// Print state changes until one of `targets` is reached.
async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<(DeviceAddress, ConnectionState)>,
    targets: &[ConnectionState],
    limit: Duration,
) -> Result<ConnectionState> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let next = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .context("timed out waiting for state change")?;
        let Some((address, state)) = next else {
            bail!("state channel closed");
        };
        println!("  {address}: {state} ({})", state.code());
        if targets.contains(&state) {
            return Ok(state);
        }
    }
}

fn describe(call: &UhidCall) -> String {
    match call {
        UhidCall::Open => "open".to_string(),
        UhidCall::Close => "close".to_string(),
        UhidCall::Destroy => "destroy".to_string(),
        UhidCall::Data(data) => format!("input report {data:02X?}"),
        UhidCall::ControlData(data) => format!("control report {data:02X?}"),
        UhidCall::Handshake(code) => format!("handshake 0x{code:X}"),
        UhidCall::HidInfo { name, pnp, hid } => format!(
            "hid info '{name}' VID=0x{:04X} PID=0x{:04X} version=0x{:04X} descriptor={} bytes",
            pnp.vendor_id,
            pnp.product_id,
            pnp.version,
            hid.descriptor.len()
        ),
    }
}

async fn simulate(
    transport: Transport,
    address: &str,
    name: &str,
    config: HostConfig,
    options: PeerOptions,
) -> Result<()> {
    let address: DeviceAddress = address.parse()?;
    let peer = Loopback::new(options);
    match transport {
        Transport::Classic => peer.paired.add_classic(address.clone(), Some(name)),
        Transport::Ble => peer.paired.add_ble(address.clone(), Some(name)),
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (service, event_loop) =
        HidHostService::new(config.clone(), peer.stack(), Arc::new(ChannelObserver(tx)))?;
    peer.attach(service.poster());
    let task = tokio::spawn(event_loop.run());

    println!("Connecting to {address}");
    service.connect(&address)?;
    let settled = wait_for(
        &mut rx,
        &[ConnectionState::Connected, ConnectionState::Disconnected],
        config.connect_timeout() + Duration::from_secs(1),
    )
    .await?;

    if settled == ConnectionState::Connected {
        service.send_report(&address, OutboundReport::set(ReportType::Output, vec![0x02, 0x01]))?;
        service.send_report(&address, OutboundReport::get(ReportType::Feature, 3))?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        println!("Disconnecting from {address}");
        service.disconnect(&address)?;
        wait_for(
            &mut rx,
            &[ConnectionState::Disconnected],
            config.disconnect_timeout() + Duration::from_secs(1),
        )
        .await?;
    } else {
        println!("Connection to {address} failed");
    }

    service.shutdown();
    task.await?;

    if let Some(sink) = peer.uhid.sink(&address) {
        println!("uhid activity:");
        for call in sink.calls() {
            println!("  {}", describe(&call));
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            transport,
            address,
            name,
            config,
            reject_security,
            silent_battery,
        } => {
            let config = load_config(config.as_deref())?;
            let options = PeerOptions {
                reject_security,
                silent_battery,
            };
            simulate(transport, &address, &name, config, options).await?;
        }
        Commands::ShowConfig { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
