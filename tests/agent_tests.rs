//! End-to-end agent tests: two peers through a full server stack on loopback

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use natpunch::client::{AgentConfig, AgentState, ClientAgent};
use natpunch::coordinator::{CoordinatorConfig, CoordinatorMetrics, CoordinatorService};
use natpunch::directory::{AdvertisedDirectory, DirectoryConfig, EndpointDirectory};
use natpunch::relay::{RelayConfig, RelayMetrics, RelayService};

struct ServerHarness {
    coordinator_port: u16,
    relay_port: u16,
    directory: Arc<EndpointDirectory>,
    advertised: Arc<AdvertisedDirectory>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_server() -> ServerHarness {
    let directory = Arc::new(EndpointDirectory::new(DirectoryConfig::default()));
    let advertised = Arc::new(AdvertisedDirectory::new());

    let coordinator = CoordinatorService::bind(
        CoordinatorConfig {
            listen_port: 0,
            ..CoordinatorConfig::default()
        },
        Arc::clone(&advertised),
        Arc::new(CoordinatorMetrics::new()),
    )
    .await
    .unwrap();

    let relay = RelayService::bind(
        &RelayConfig { listen_port: 0 },
        Arc::clone(&directory),
        Arc::new(RelayMetrics::new()),
    )
    .await
    .unwrap();

    let coordinator_port = coordinator.local_addr().unwrap().port();
    let relay_port = relay.local_addr().unwrap().port();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator_shutdown = shutdown_rx.clone();
    tokio::spawn(async move { coordinator.run(coordinator_shutdown).await });
    tokio::spawn(async move { relay.run(shutdown_rx).await });

    ServerHarness {
        coordinator_port,
        relay_port,
        directory,
        advertised,
        _shutdown_tx: shutdown_tx,
    }
}

fn agent_config(harness: &ServerHarness, client_id: &str) -> AgentConfig {
    AgentConfig {
        coordinator_port: harness.coordinator_port,
        relay_port: harness.relay_port,
        ..AgentConfig::new(client_id, IpAddr::from([127, 0, 0, 1]))
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_lifecycle_states_progress_in_order() {
    let harness = start_server().await;

    let mut agent = ClientAgent::connect(agent_config(&harness, "alice"))
        .await
        .unwrap();
    assert_eq!(agent.state(), AgentState::TcpConnected);

    agent.register_tcp().await.unwrap();
    assert_eq!(agent.state(), AgentState::TcpRegistered);

    agent.register_udp().await.unwrap();
    assert_eq!(agent.state(), AgentState::UdpRegistered);

    let _inbox = agent.start();
    assert_eq!(agent.state(), AgentState::Active);

    agent.close();
    assert_eq!(agent.state(), AgentState::Disconnected);
}

#[tokio::test]
async fn test_tcp_registration_advertises_local_udp_port() {
    let harness = start_server().await;

    let mut agent = ClientAgent::connect(agent_config(&harness, "alice"))
        .await
        .unwrap();
    agent.register_tcp().await.unwrap();

    let advertised = Arc::clone(&harness.advertised);
    wait_for(move || advertised.get("alice").is_some()).await;

    let recorded = harness.advertised.get("alice").unwrap();
    assert_eq!(recorded.port(), agent.local_udp_port());
}

#[tokio::test]
async fn test_udp_registration_lands_in_directory() {
    let harness = start_server().await;

    let mut agent = ClientAgent::connect(agent_config(&harness, "alice"))
        .await
        .unwrap();
    agent.register_udp().await.unwrap();

    let directory = Arc::clone(&harness.directory);
    wait_for(move || directory.lookup("alice").is_some()).await;

    let observed = harness.directory.lookup("alice").unwrap();
    assert_eq!(observed.port(), agent.local_udp_port());
}

#[tokio::test]
async fn test_two_agents_exchange_relayed_messages() {
    let harness = start_server().await;

    let mut alice = ClientAgent::connect(agent_config(&harness, "alice"))
        .await
        .unwrap();
    let mut bob = ClientAgent::connect(agent_config(&harness, "bob"))
        .await
        .unwrap();

    alice.register_tcp().await.unwrap();
    bob.register_tcp().await.unwrap();
    alice.register_udp().await.unwrap();
    bob.register_udp().await.unwrap();

    let directory = Arc::clone(&harness.directory);
    wait_for(move || directory.lookup("alice").is_some() && directory.lookup("bob").is_some())
        .await;

    let mut alice_inbox = alice.start();
    let mut bob_inbox = bob.start();

    alice.send_relay("bob", "hello bob").await.unwrap();

    let received = timeout(Duration::from_secs(5), bob_inbox.recv())
        .await
        .expect("no relayed message")
        .unwrap();
    // the relay forwards the payload verbatim: the id field is the one the
    // frame was addressed with
    assert_eq!(received.sender_id, "bob");
    assert_eq!(received.content, "hello bob");

    bob.send_relay("alice", "hi back").await.unwrap();

    let received = timeout(Duration::from_secs(5), alice_inbox.recv())
        .await
        .expect("no relayed reply")
        .unwrap();
    assert_eq!(received.content, "hi back");
}

#[tokio::test]
async fn test_keepalive_refreshes_mapping() {
    let harness = start_server().await;

    let mut config = agent_config(&harness, "alice");
    config.keepalive_interval = Duration::from_millis(50);

    let mut agent = ClientAgent::connect(config).await.unwrap();
    agent.register_udp().await.unwrap();
    let _inbox = agent.start();

    let directory = Arc::clone(&harness.directory);
    wait_for(move || directory.lookup("alice").is_some()).await;

    // an eviction cutoff set after the initial registration: only keepalive
    // traffic can keep the entry alive past it
    tokio::time::sleep(Duration::from_millis(150)).await;
    let evicted = harness
        .directory
        .evict_older_than(std::time::Instant::now() - Duration::from_millis(100));
    assert_eq!(evicted, 0);
    assert!(harness.directory.lookup("alice").is_some());
}

#[tokio::test]
async fn test_send_to_unregistered_peer_is_best_effort() {
    let harness = start_server().await;

    let mut agent = ClientAgent::connect(agent_config(&harness, "alice"))
        .await
        .unwrap();
    agent.register_udp().await.unwrap();

    // nothing comes back, but the send itself succeeds
    agent.send_relay("ghost", "anyone there?").await.unwrap();
}
