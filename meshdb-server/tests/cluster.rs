//! Multi-node cluster scenarios.
//!
//! Each test spins up real nodes in-process: ephemeral ports, tempdir
//! storage roots, the full stack from sockets to committed table rows.
//! Convergence is asynchronous, so assertions poll with a deadline
//! instead of expecting immediate state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use meshdb_server::ebus::EventTag;
use meshdb_server::{Core, NodeConfig};

/// How long to wait for cluster state to converge.
const CONVERGE: Duration = Duration::from_secs(15);

/// Time to let things settle when asserting that nothing more happens.
const SETTLE: Duration = Duration::from_millis(1_500);

struct TestNode {
    core: Core,
    addr: String,
    _storage: tempfile::TempDir,
}

async fn spawn_node() -> TestNode {
    spawn_node_with(|_| {}).await
}

async fn spawn_node_with(tweak: impl FnOnce(&mut NodeConfig)) -> TestNode {
    let storage = tempfile::tempdir().expect("tempdir");
    let mut config = NodeConfig {
        listen: "127.0.0.1:0".into(),
        storage: storage.path().to_path_buf(),
        // Tight timers keep the tests fast.
        sync_interval_ms: 200,
        send_timeout_ms: 2_000,
        ..NodeConfig::default()
    };
    tweak(&mut config);

    let core = Core::create(config).await.expect("core create");
    let addr = core.listen().await.expect("listen").to_string();
    TestNode { core, addr, _storage: storage }
}

/// Poll until the predicate holds or the deadline passes.
async fn wait_until<F: Fn() -> bool>(predicate: F, desc: &str) {
    let result = tokio::time::timeout(CONVERGE, async {
        loop {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timeout waiting for: {desc}");
}

fn count_events(node: &TestNode, tag: EventTag) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    node.core.ebus().subscribe(tag, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    count
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_builds_the_link_on_both_sides() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    let a_events = count_events(&a, EventTag::TopologyChanged);
    let b_events = count_events(&b, EventTag::TopologyChanged);

    a.core.connect_addr(b.addr.clone());

    wait_until(
        || {
            let ta = a.core.topology();
            let tb = b.core.topology();
            ta.nodes.len() == 2
                && tb.nodes.len() == 2
                && ta.contains_link(a.core.uuid(), b.core.uuid())
                && tb.contains_link(a.core.uuid(), b.core.uuid())
        },
        "both trackers to see the A-B link",
    )
    .await;

    assert_eq!(a.core.topology().links[0].weight, 1);

    // One mutating batch per side: exactly one topology-changed event.
    tokio::time::sleep(SETTLE).await;
    assert_eq!(a_events.load(Ordering::SeqCst), 1);
    assert_eq!(b_events.load(Ordering::SeqCst), 1);

    a.core.shutdown().await;
    b.core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn version_mismatch_never_links() {
    let a = spawn_node().await;
    let c = spawn_node_with(|config| config.version = 2).await;

    a.core.connect_addr(c.addr.clone());

    tokio::time::sleep(SETTLE).await;
    assert_eq!(a.core.topology().nodes.len(), 1, "A must not register C");
    assert_eq!(c.core.topology().nodes.len(), 1, "C must not register A");
    assert!(a.core.topology().links.is_empty());
    assert!(c.core.topology().links.is_empty());

    a.core.shutdown().await;
    c.core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_writes_replicate_and_commit_remotely() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    a.core.create_table("events", &["payload".into()]).unwrap();
    a.core.insert_row("events", &["x".into()]).unwrap();
    a.core.insert_row("events", &["y".into()]).unwrap();

    a.core.connect_addr(b.addr.clone());

    let origin = a.core.uuid();
    wait_until(
        || {
            let Ok(log) = b.core.tablespace().trlog(origin) else { return false };
            log.top() == 3 && log.applied() == 3
        },
        "B to replicate and commit A's log",
    )
    .await;

    wait_until(
        || {
            b.core
                .tablespace()
                .table_rows("events")
                .map(|rows| rows == vec![vec!["x".to_string()], vec!["y".to_string()]])
                .unwrap_or(false)
        },
        "B's table state to contain the applied rows",
    )
    .await;

    // Writes after the link is up converge too.
    a.core.insert_row("events", &["z".into()]).unwrap();
    wait_until(
        || {
            b.core
                .tablespace()
                .table_rows("events")
                .map(|rows| rows.len() == 3)
                .unwrap_or(false)
        },
        "B to pick up the post-connect write",
    )
    .await;

    a.core.shutdown().await;
    b.core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn segment_merge_converges_all_trackers() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let c = spawn_node().await;
    let d = spawn_node().await;

    // Two isolated segments: {A, B} and {C, D}.
    b.core.connect_addr(a.addr.clone());
    d.core.connect_addr(c.addr.clone());
    wait_until(
        || a.core.topology().nodes.len() == 2 && c.core.topology().nodes.len() == 2,
        "both segments to form",
    )
    .await;

    // Bridge the segments.
    a.core.connect_addr(c.addr.clone());

    let nodes = [&a, &b, &c, &d];
    wait_until(
        || nodes.iter().all(|n| n.core.topology().nodes.len() == 4),
        "all four trackers to know all four nodes",
    )
    .await;

    wait_until(
        || {
            nodes.iter().all(|n| {
                let topo = n.core.topology();
                topo.contains_link(a.core.uuid(), b.core.uuid())
                    && topo.contains_link(a.core.uuid(), c.core.uuid())
                    && topo.contains_link(c.core.uuid(), d.core.uuid())
            })
        },
        "all four trackers to hold the merged link set",
    )
    .await;

    for node in nodes {
        assert_eq!(node.core.topology().links.len(), 3);
    }

    a.core.shutdown().await;
    b.core.shutdown().await;
    c.core.shutdown().await;
    d.core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replication_routes_through_intermediate_hops() {
    // Line: A - B - C. C never talks to A directly but still gets A's rows.
    let a = spawn_node().await;
    let b = spawn_node().await;
    let c = spawn_node().await;

    a.core.create_table("chained", &[]).unwrap();
    a.core.insert_row("chained", &["hop".into()]).unwrap();

    b.core.connect_addr(a.addr.clone());
    c.core.connect_addr(b.addr.clone());

    let origin = a.core.uuid();
    wait_until(
        || {
            let Ok(log) = c.core.tablespace().trlog(origin) else { return false };
            log.applied() == 2
        },
        "C to commit A's log pulled via B",
    )
    .await;

    assert_eq!(
        c.core.tablespace().table_rows("chained").unwrap(),
        vec![vec!["hop".to_string()]]
    );

    // C's route for origin A points at its only neighbor, B.
    let routes = c.core.routes();
    let b_local_id = c.core.tracker().local_id_of(b.core.uuid()).unwrap();
    assert_eq!(routes.get(&origin), Some(&b_local_id));

    a.core.shutdown().await;
    b.core.shutdown().await;
    c.core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simultaneous_dials_converge_to_one_session() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    a.core.connect_addr(b.addr.clone());
    b.core.connect_addr(a.addr.clone());

    wait_until(
        || {
            a.core.connected_peers() == 1
                && b.core.connected_peers() == 1
                && a.core.topology().contains_link(a.core.uuid(), b.core.uuid())
        },
        "the duplicate session to be resolved",
    )
    .await;

    // The tie-break is stable: still exactly one session after settling.
    tokio::time::sleep(SETTLE).await;
    assert_eq!(a.core.connected_peers(), 1);
    assert_eq!(b.core.connected_peers(), 1);

    a.core.shutdown().await;
    b.core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_marks_the_link_down() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    a.core.connect_addr(b.addr.clone());
    wait_until(
        || b.core.topology().contains_link(a.core.uuid(), b.core.uuid()),
        "the link to come up",
    )
    .await;

    a.core.shutdown().await;

    wait_until(
        || !b.core.topology().contains_link(a.core.uuid(), b.core.uuid()),
        "B to notice the disconnect",
    )
    .await;

    // The node record survives; only reachability changed.
    assert_eq!(b.core.topology().nodes.len(), 2);

    b.core.shutdown().await;
}
