use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hearsay_election::{LeaderElector, LeaderElectorExtension};
use hearsay_membership::transport::{ChannelTransport, Transport};
use hearsay_membership::{
    ConnectionConfig,
    GossipConfig,
    Identity,
    MembershipNode,
    MembershipNodeBuilder,
};
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(10);
const SETTLE_DELAY: Duration = Duration::from_millis(100);

fn addr(port: u16) -> SocketAddr {
    ([127, 0, 0, 1], port).into()
}

async fn start_node(
    transport: &ChannelTransport,
    port: u16,
    introducer: u16,
) -> Result<MembershipNode> {
    let connection_cfg = ConnectionConfig::new(addr(port), addr(port), addr(introducer));
    let gossip_cfg = GossipConfig {
        gossip_interval: Duration::from_millis(20),
        introducer_negotiate_interval: Duration::from_millis(100),
        fail_timeout: Duration::from_millis(400),
        cleanup_timeout: Duration::from_millis(1000),
        ..Default::default()
    };

    let node = MembershipNodeBuilder::new(connection_cfg)
        .with_gossip_config(gossip_cfg)
        .connect_with_transport(transport)
        .await?;

    // Join times are only unique down to the millisecond.
    tokio::time::sleep(Duration::from_millis(5)).await;
    Ok(node)
}

async fn wait_for_leader(elector: &LeaderElector, expected: Identity) -> Result<()> {
    tokio::time::timeout(WAIT, async {
        while elector.leader() != Some(expected) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_single_node_elects_itself() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = ChannelTransport::default();
    let node = start_node(&transport, 8001, 8001).await?;

    let elector = node
        .add_extension(LeaderElectorExtension::new().with_settle_delay(SETTLE_DELAY))
        .await?;
    assert_eq!(elector.leader(), None, "Nothing is elected before the settle delay.");

    wait_for_leader(&elector, *node.me()).await?;
    assert!(elector.is_leader());

    elector.shutdown().await;
    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_leader_fails_over_to_next_oldest() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = ChannelTransport::default();
    let node1 = start_node(&transport, 8001, 8001).await?;
    let node2 = start_node(&transport, 8002, 8001).await?;
    let node3 = start_node(&transport, 8003, 8001).await?;

    for node in [&node1, &node2, &node3] {
        node.wait_for_members(|members| members.len() == 3, WAIT)
            .await?;
    }

    let extension = || LeaderElectorExtension::new().with_settle_delay(SETTLE_DELAY);
    let elector1 = node1.add_extension(extension()).await?;
    let elector2 = node2.add_extension(extension()).await?;
    let elector3 = node3.add_extension(extension()).await?;

    for elector in [&elector1, &elector2, &elector3] {
        wait_for_leader(elector, *node1.me()).await?;
    }
    assert!(elector1.is_leader());
    assert!(!elector2.is_leader());

    let changes = Arc::new(Mutex::new(Vec::new()));
    let seen = changes.clone();
    elector3.subscribe(move |leader: &Identity| seen.lock().push(*leader));
    assert_eq!(changes.lock().as_slice(), &[*node1.me()], "Current leader is replayed.");

    transport.kill(node1.me().addr());

    for elector in [&elector2, &elector3] {
        wait_for_leader(elector, *node2.me()).await?;
    }
    assert!(elector2.is_leader());
    assert_eq!(changes.lock().as_slice(), &[*node1.me(), *node2.me()]);

    for elector in [elector1, elector2, elector3] {
        elector.shutdown().await;
    }
    let _ = node1.shutdown().await;
    node2.shutdown().await?;
    node3.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_cancels_pending_election() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = ChannelTransport::default();
    let node = start_node(&transport, 8001, 8001).await?;

    let elector = node
        .add_extension(LeaderElectorExtension::new().with_settle_delay(Duration::from_secs(60)))
        .await?;
    let changes = Arc::new(Mutex::new(Vec::new()));
    let seen = changes.clone();
    elector.subscribe(move |leader: &Identity| seen.lock().push(*leader));

    elector.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(changes.lock().is_empty());

    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_stopped_node_rejects_extension() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = ChannelTransport::default();
    let node = start_node(&transport, 8001, 8001).await?;
    let rogue = transport.open(addr(9000)).await?;
    rogue.send(addr(8001), b"garbage").await?;
    tokio::time::timeout(WAIT, node.stopped()).await?;

    let result = node.add_extension(LeaderElectorExtension::new()).await;
    assert!(result.is_err());

    let _ = node.shutdown().await;
    Ok(())
}
