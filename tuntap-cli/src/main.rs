use std::{path::PathBuf, pin::pin, process::ExitCode};

use anyhow::{Context as _, Result};
use clap::Parser;
use futures::future::{Either, select};
use tuntap::{Config, Device, DeviceKind, Event};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Whether to create a `tun` or a `tap` device.
    #[arg(short, long, env = "TUNTAP_KIND", default_value_t = DeviceKind::Tap)]
    kind: DeviceKind,

    /// Name to request for the interface; the kernel picks one if omitted.
    #[arg(short, long, env = "TUNTAP_NAME")]
    name: Option<String>,

    /// How many received packets may be in flight before reading from the device pauses.
    #[arg(long, env = "TUNTAP_MAX_IN_FLIGHT", default_value_t = 100)]
    max_in_flight: usize,

    #[arg(long, hide = true, env = "TUNTAP_DEVICE_PATH", default_value = tuntap::TUN_FILE)]
    device_path: PathBuf,

    /// Log in JSON format.
    #[arg(long, env = "TUNTAP_LOG_JSON", default_value_t = false)]
    log_json: bool,

    /// Log filter directives, e.g. `debug` or `info,tuntap=trace`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_filter: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match try_main(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            #[expect(clippy::print_stderr, reason = "The logger may not have been set up")]
            {
                eprintln!("{e:#}");
            }

            ExitCode::FAILURE
        }
    }
}

fn try_main(cli: Cli) -> Result<()> {
    logging::setup_global_subscriber(&cli.log_filter, cli.log_json)
        .context("Failed to set up logging")?;

    tracing::debug!(?cli);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config {
        kind: cli.kind,
        path: cli.device_path,
        ..Config::default()
    }
    .with_max_in_flight(cli.max_in_flight);
    if let Some(name) = cli.name {
        config = config.with_name(name);
    }

    let (device, mut events) = Device::create(config, tokio::runtime::Handle::current());
    let mut ctrl_c = pin!(tokio::signal::ctrl_c());

    loop {
        match select(pin!(events.next()), ctrl_c.as_mut()).await {
            Either::Left((Some(Event::Open(interface)), _)) => {
                tracing::info!(name = %interface.name, index = %interface.index, "Device is up");
            }
            Either::Left((Some(Event::Packet(packet)), _)) => {
                tracing::info!(len = %packet.len(), "Received packet");
            }
            Either::Left((Some(Event::Error(e)), _)) => {
                let permission_denied = e.is_permission_denied();
                let e = anyhow::Error::new(e).context("Device failed");

                if permission_denied {
                    return Err(e.context("tuntap-cli needs to run as root or with CAP_NET_ADMIN"));
                }

                return Err(e);
            }
            Either::Left((None, _)) => return Ok(()),
            Either::Right((result, _)) => {
                result.context("Failed to listen for Ctrl-C")?;

                tracing::info!("Closing device");
                device.close();

                break;
            }
        }
    }

    // Wait for teardown to complete.
    while events.next().await.is_some() {}

    Ok(())
}
