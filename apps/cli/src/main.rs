use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use scd_core::config::ScdConfig;
use scd_core::relay::{
    BdtReply, ClientSettings, HttpPoller, RelayClient, RelayServer, ServerSettings, TcpAcceptor,
    TcpLink,
};
use scd_core::retry::retry;
use scd_core::session::{SessionController, SessionSettings};
use scd_core::transport::SimulatedSensor;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "SCD sensor relay (edge and collector)", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the collector and ask the edge for something
    Collect {
        #[arg(value_enum)]
        action: Action,

        /// Caller id used for the monitoring / BDT locks
        #[arg(long, default_value = "cli")]
        caller: String,

        /// Number of monitoring samples to request
        #[arg(long, default_value_t = 10)]
        samples: u32,
    },
    /// Run the edge client next to the sensor
    Edge {
        /// Use the built-in simulated device instead of a radio
        #[arg(long)]
        simulate: bool,

        /// Device address
        #[arg(long, default_value = "SCD-SIM")]
        address: String,
    },
    /// Write the default configuration
    Config {
        #[arg(default_value = "scd.toml")]
        output: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Action {
    /// Start monitoring and print samples
    Monitor,
    /// Record a block on the device and fetch it
    Record,
    /// Close the device session on the edge
    Close,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => ScdConfig::load_from_file(path)?,
        None => ScdConfig::default(),
    };

    match args.command {
        Command::Collect {
            action,
            caller,
            samples,
        } => collect(&config, action, &caller, samples),
        Command::Edge { simulate, address } => edge(&config, simulate, &address),
        Command::Config { output } => {
            config.save_to_file(&output)?;
            info!(path = %output.display(), "Configuration written");
            Ok(())
        }
    }
}

fn collect(config: &ScdConfig, action: Action, caller: &str, samples: u32) -> Result<()> {
    let relay = &config.relay;
    let acceptor = TcpAcceptor::bind(&relay.address(), relay.recv_timeout(), relay.packet_max)?;
    let mut server = RelayServer::new(acceptor, ServerSettings::from_config(relay));
    server.accept().context("waiting for the edge")?;

    match action {
        Action::Monitor => {
            for _ in 0..=samples {
                let reply = server.monitor_start(caller);
                if reply.rejected {
                    bail!("monitoring rejected: {}", reply.status.join(" "));
                }
                println!("{}  [{}]", reply.row.join(", "), reply.status.join(" / "));
                thread::sleep(Duration::from_secs(1));
            }
            let reply = server.monitor_stop(caller);
            println!("{}", reply.row[0]);
        }
        Action::Record => {
            expect_done(server.run_bdt(caller))?;
            expect_done(server.fetch_bdt(caller))?;
            if let Some(capture) = server.capture() {
                println!("server time : {}", capture.server_time);
                println!("delay time  : {}", capture.delay);
                println!("ODR         : {}", capture.odr);
                println!("rows        : {}", capture.rows.len());
                println!("samples     : {}", capture.sample_count());
            }
        }
        Action::Close => server.close_device()?,
    }
    Ok(())
}

fn expect_done(reply: BdtReply) -> Result<()> {
    match reply {
        BdtReply::Done(stamp) => {
            info!(at = %stamp, "Done");
            Ok(())
        }
        BdtReply::Rejected(msg) => bail!("{}", msg),
        BdtReply::Failed(msg) => bail!("bulk transfer failed: {}", msg),
    }
}

fn edge(config: &ScdConfig, simulate: bool, address: &str) -> Result<()> {
    if !simulate {
        bail!("no radio backend is built in, run with --simulate");
    }
    let sensor = SimulatedSensor::new(address);
    let mut session = SessionController::new(sensor, SessionSettings::from_config(config)?);
    session.connect()?;
    session.prepare_device()?;

    let relay = config.relay.clone();
    let link = retry(&relay.reconnect_policy(), |attempt| {
        match TcpLink::connect(relay.address(), relay.recv_timeout(), relay.packet_max) {
            Ok(link) => Ok(Some(link)),
            Err(e) => {
                warn!(attempt, error = %e, "Collector not reachable");
                Ok::<_, scd_core::RelayError>(None)
            }
        }
    })?;

    let poller = HttpPoller::new(&relay.host, relay.http_port, relay.recv_timeout())?;
    let connector_cfg = relay.clone();
    let mut client = RelayClient::new(session, link, ClientSettings::from_config(&relay))
        .with_poller(Box::new(poller))
        .with_connector(Box::new(move || {
            TcpLink::connect(
                connector_cfg.address(),
                connector_cfg.recv_timeout(),
                connector_cfg.packet_max,
            )
        }));
    client.run()?;
    Ok(())
}
