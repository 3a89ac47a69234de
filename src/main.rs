use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use holepunch::{
    Buffer, ChannelFactory, Command, ConfigManager, Dispatcher, HandlerConfig, HolePunchConfig,
    HolePunchConfigFile, HolePunchRpc, HolePuncher, Message, MessageType, NetworkSection, PeerAddress,
    PunchContext, ReachablePeers, TokioPunchScheduler, UdpChannelFactory, UdpMessenger, UdpRelay,
};

const DEFAULT_CONFIG_PATH: &str = "holepunch.toml";

#[derive(Parser, Debug)]
#[command(author, version, about = "UDP hole punching through a rendezvous relay", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the standard locations)
    #[arg(short, long, global = true, env = "HOLEPUNCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Punch between two local peers through a local relay and deliver a payload
    Demo {
        /// Channels the initiator binds
        #[arg(long)]
        holes: Option<usize>,
        /// Delay before the responder punches, in milliseconds
        #[arg(long, default_value = "500")]
        retry_delay_ms: u64,
        #[arg(long, default_value = "hello through the hole")]
        payload: String,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration
    Init {
        #[arg(long)]
        force: bool,
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
    },
    /// Print a configuration file, or the defaults when it does not exist
    Show {
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
    },
    /// Check a configuration file
    Validate {
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
    },
    /// Print a sample configuration
    Sample,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { holes, retry_delay_ms, payload } => {
            let file = match &cli.config {
                Some(path) => HolePunchConfigFile::load_from_file(path),
                None => HolePunchConfigFile::load_from_default_locations(),
            }
            .map_err(|e| anyhow!("{}", e))?;

            let mut config = file.to_punch_config();
            if let Some(holes) = holes {
                config.number_of_holes = holes;
            }
            config.retry_delay = Duration::from_millis(retry_delay_ms);
            config.validate()?;

            run_demo(&file.network, config, payload).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { force, path } => {
                ConfigManager::init_config(&path, force).map_err(|e| anyhow!("{}", e))?;
            }
            ConfigAction::Show { path } => {
                if path.exists() {
                    ConfigManager::show_config(&path).map_err(|e| anyhow!("{}", e))?;
                } else {
                    println!("Configuration file not found. Showing default configuration:");
                    println!("{}", ConfigManager::generate_sample());
                }
            }
            ConfigAction::Validate { path } => {
                ConfigManager::validate_config(&path).map_err(|e| anyhow!("{}", e))?;
            }
            ConfigAction::Sample => println!("{}", ConfigManager::generate_sample()),
        },
    }

    Ok(())
}

/// Application handler of the demo responder: acknowledges direct data
struct Acknowledger {
    local: PeerAddress,
}

#[async_trait]
impl Dispatcher for Acknowledger {
    async fn dispatch(&self, mut message: Message, source: SocketAddr) -> Option<Message> {
        if message.command != Command::DIRECT_DATA {
            return None;
        }
        let payload: Vec<u8> = message.buffers.iter_mut().flat_map(|b| b.read_all()).collect();
        println!("bob <- {} bytes from {}: {}", payload.len(), source, String::from_utf8_lossy(&payload));
        Some(message.response(MessageType::Ok, self.local.clone()))
    }
}

/// Both peers bind on `network.bind_ip`; the initiator goes by `network.peer_id`
async fn run_demo(network: &NetworkSection, config: HolePunchConfig, payload: String) -> Result<()> {
    let advertised = network.advertised_ip();
    let relay = UdpRelay::bind(SocketAddr::new(advertised, 0)).await?;
    let relay_task = relay.spawn();
    let scheduler = Arc::new(TokioPunchScheduler::new());

    // bob sits behind the relay and answers offers
    let bob_factory = Arc::new(UdpChannelFactory::new(network.bind_ip));
    let bob_reachable = Arc::new(ReachablePeers::new());
    let mut bob = PeerAddress::new("bob", advertised, 0, 0)
        .change_firewalled_udp(true)
        .change_relayed(true);
    bob.add_relay(relay.socket_address());

    let bob_rpc = HolePunchRpc::new(
        PunchContext {
            local_peer: bob.clone(),
            channel_factory: bob_factory.clone(),
            messenger: Arc::new(UdpMessenger::new(bob_factory.clone())),
            dispatcher: None,
            reachability: bob_reachable.clone(),
            scheduler: scheduler.clone(),
            config: config.clone(),
        },
        Some(Arc::new(Acknowledger { local: bob.clone() })),
    );
    let control = bob_factory
        .bind_channel(false, HandlerConfig::dispatcher(bob_rpc, config.idle_timeout, false), None)
        .await?;
    relay
        .register_peer(bob.peer_id.clone(), SocketAddr::new(advertised, control.local_port()))
        .await;
    info!("bob registered at relay {} from {}", relay.local_addr(), control.local_addr());

    // the initiator
    let alice_id = network.peer_id_or("alice");
    let alice_factory = Arc::new(UdpChannelFactory::new(network.bind_ip));
    let alice = PeerAddress::new(alice_id.clone(), advertised, 0, 0).change_firewalled_udp(true);
    let alice_context = PunchContext {
        local_peer: alice.clone(),
        channel_factory: alice_factory.clone(),
        messenger: Arc::new(UdpMessenger::new(alice_factory.clone())),
        dispatcher: None,
        reachability: Arc::new(ReachablePeers::new()),
        scheduler: scheduler.clone(),
        config: config.clone(),
    };

    let mut message = Message::new(Command::DIRECT_DATA, MessageType::Request1, alice, bob);
    message.push_buffer(Buffer::new(payload.into_bytes()));

    let puncher = HolePuncher::initiator(alice_context, config.number_of_holes, message);
    let outcome = puncher.initiate().await.context("hole punch failed")?;
    for sent in &outcome.report.sent {
        println!(
            "{} -> forwarded from {} to port {}",
            alice_id, sent.local_addr, sent.pair.remote_port
        );
    }
    for failure in &outcome.report.failures {
        println!("{} -> port {} failed: {}", alice_id, failure.pair.remote_port, failure.reason);
    }

    let acknowledged = outcome
        .acknowledgement
        .wait(config.relay_reply_timeout)
        .await
        .context("no acknowledgement")?;
    println!(
        "{} <- acknowledged by {} on local port {}",
        alice_id,
        acknowledged.source,
        acknowledged.local_addr.port()
    );

    tokio::time::sleep(config.retry_delay + Duration::from_millis(200)).await;
    println!("bob sees {} reachable: {}", alice_id, bob_reachable.contains(&alice_id).await);

    scheduler.shutdown();
    alice_factory.shutdown();
    bob_factory.shutdown();
    relay.shutdown();
    relay_task.await?;
    Ok(())
}
