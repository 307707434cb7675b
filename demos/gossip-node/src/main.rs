#[macro_use]
extern crate tracing;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use hearsay::election::{LeaderElector, LeaderElectorExtension};
use hearsay::membership::{
    ConnectionConfig,
    GossipConfig,
    Identity,
    MembershipNode,
    MembershipNodeBuilder,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
Commands:
  members   Show the membership list
  self      Show the identity of this node
  leader    Show the current leader
  stats     Show the live membership statistics
  leave     Leave the group
  join      Join the group again with a new identity
  quit      Leave the group and exit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Args = Args::parse();

    let mut running = Some(Running::start(&args).await?);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        let event = tokio::select! {
            _ = wait_for_stop(running.as_ref()) => Event::Stopped,
            line = lines.next_line() => Event::Input(line?),
        };

        let line = match event {
            Event::Stopped => {
                if let Some(running) = running.take() {
                    running.shutdown().await?;
                }
                bail!("Node stopped unexpectedly.");
            },
            Event::Input(None) => break,
            Event::Input(Some(line)) => line,
        };

        match (line.trim(), running.as_ref()) {
            ("", _) => {},
            ("members", Some(running)) => {
                println!("{}", running.node.membership_list().await);
            },
            ("self", Some(running)) => println!("{}", running.node.me()),
            ("leader", Some(running)) => match running.elector.leader() {
                Some(leader) => println!("{leader}"),
                None => println!("No leader has been elected yet."),
            },
            ("stats", Some(running)) => {
                let stats = running.node.statistics();
                println!(
                    "alive={} failed={} left={} rounds={} merged={}",
                    stats.num_live_members(),
                    stats.num_failed_members(),
                    stats.num_left_members(),
                    stats.num_gossip_rounds(),
                    stats.num_merged_snapshots(),
                );
            },
            ("leave", Some(_)) => {
                if let Some(running) = running.take() {
                    running.shutdown().await?;
                }
                println!("Left the group.");
            },
            ("join", None) => {
                running = Some(Running::start(&args).await?);
            },
            ("join", Some(_)) => println!("Already part of the group."),
            ("quit" | "exit", _) => break,
            ("members" | "self" | "leader" | "stats" | "leave", None) => {
                println!("Not part of the group, use `join` first.");
            },
            _ => println!("{HELP}"),
        }
    }

    if let Some(running) = running.take() {
        running.shutdown().await?;
    }

    Ok(())
}

enum Event {
    Stopped,
    Input(Option<String>),
}

async fn wait_for_stop(running: Option<&Running>) {
    match running {
        Some(running) => running.node.stopped().await,
        None => std::future::pending().await,
    }
}

struct Running {
    node: MembershipNode,
    elector: LeaderElector,
}

impl Running {
    async fn start(args: &Args) -> Result<Self> {
        let connection_cfg = ConnectionConfig::new(
            args.listen_addr,
            args.public_addr.unwrap_or(args.listen_addr),
            args.introducer_addr,
        );

        let node = MembershipNodeBuilder::new(connection_cfg)
            .with_gossip_config(args.gossip_config())
            .connect()
            .await?;

        let elector = node
            .add_extension(
                LeaderElectorExtension::new()
                    .with_settle_delay(Duration::from_millis(args.settle_delay_ms)),
            )
            .await?;

        let self_id = *node.me();
        elector.subscribe(move |leader: &Identity| {
            info!(self_id = %self_id, leader = %leader, "Leader has changed.");
        });

        println!("Joined the group as {}.", node.me());
        Ok(Self { node, elector })
    }

    async fn shutdown(self) -> Result<()> {
        self.elector.shutdown().await;
        self.node.shutdown().await?;
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1:7000")]
    /// The address for the gossip socket to listen on.
    listen_addr: SocketAddr,

    #[arg(long)]
    /// The public address for the node to broadcast to other nodes.
    ///
    /// If not provided the `listen_addr` is used which will only
    /// work when running a group on the same local network.
    public_addr: Option<SocketAddr>,

    #[arg(long, default_value = "127.0.0.1:7000")]
    /// The address of the group's introducer.
    ///
    /// The node whose public address matches this becomes the introducer.
    introducer_addr: SocketAddr,

    #[arg(long, default_value_t = 150)]
    gossip_interval_ms: u64,

    #[arg(long, default_value_t = 2000)]
    introducer_negotiate_interval_ms: u64,

    #[arg(long, default_value_t = 2000)]
    /// How long a member can be silent before it is marked as failed.
    fail_timeout_ms: u64,

    #[arg(long, default_value_t = 5000)]
    /// How long a member can be silent before it is removed.
    cleanup_timeout_ms: u64,

    #[arg(long, default_value_t = 3000)]
    /// How long to wait after joining before electing a leader.
    settle_delay_ms: u64,

    #[arg(long, default_value_t = 1)]
    /// How many members the leave announcement is sent to.
    leave_fanout: usize,

    #[arg(long, default_value_t = 10)]
    leave_heartbeat_margin: u64,
}

impl Args {
    fn gossip_config(&self) -> GossipConfig {
        GossipConfig {
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            introducer_negotiate_interval: Duration::from_millis(
                self.introducer_negotiate_interval_ms,
            ),
            fail_timeout: Duration::from_millis(self.fail_timeout_ms),
            cleanup_timeout: Duration::from_millis(self.cleanup_timeout_ms),
            leave_fanout: self.leave_fanout,
            leave_heartbeat_margin: self.leave_heartbeat_margin,
            ..Default::default()
        }
    }
}
