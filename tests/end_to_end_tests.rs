
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use golem_lite::error::Result;
use golem_lite::master::{BatchRequest, BatchState, MasterRegistry, MasterServer};
use golem_lite::protocol::Message;
use golem_lite::scheduler::{Job, TaskSpec};
use golem_lite::transport::{Connection, DEFAULT_MAILBOX};
use golem_lite::worker::{Worker, WorkerExit};
use test_harness::{args, assert_eventually, test_master_config, test_worker_config};

const WAIT: Duration = Duration::from_secs(10);

struct TestCluster {
    registry: MasterRegistry,
    addr: SocketAddr,
    shutdown: CancellationToken,
    server: JoinHandle<Result<()>>,
}

impl TestCluster {
    async fn start() -> Self {
        let registry = MasterRegistry::new(test_master_config());
        let server = MasterServer::bind(registry.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(server.run(shutdown.clone()));
        Self {
            registry,
            addr,
            shutdown,
            server,
        }
    }

    fn spawn_worker(&self, capacity: usize) -> (JoinHandle<WorkerExit>, CancellationToken) {
        let stop = CancellationToken::new();
        let worker = Worker::new(test_worker_config(self.addr.to_string(), capacity));
        let handle = tokio::spawn(worker.run(stop.clone()));
        (handle, stop)
    }

    async fn wait_for_nodes(&self, count: usize) {
        let registry = self.registry.clone();
        assert_eventually(
            || {
                let registry = registry.clone();
                async move { registry.node_count() == count }
            },
            WAIT,
            "workers did not register",
        )
        .await;
    }

    async fn shutdown(self) {
        self.shutdown.cancel();
        self.server.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_batch_runs_to_completion_on_real_worker() {
    let cluster = TestCluster::start().await;
    let (worker, stop) = cluster.spawn_worker(3);
    cluster.wait_for_nodes(1).await;

    let submission = cluster
        .registry
        .submit(BatchRequest::new(vec![TaskSpec::new(3, args(&["echo", "hi"]))]).with_batch_id("E1"))
        .unwrap();

    let details = tokio::time::timeout(WAIT, submission.wait_complete())
        .await
        .expect("batch did not complete");
    assert_eq!(details.state, BatchState::Complete);
    assert_eq!(details.progress.finished, 3);
    assert_eq!(details.progress.errored, 0);

    assert_eventually(
        || {
            let submission = submission.clone();
            async move { submission.output().await.stdout.len() == 3 }
        },
        WAIT,
        "every job's output should arrive",
    )
    .await;
    let mut lines = submission.output().await.stdout;
    lines.sort();
    assert_eq!(lines, vec!["hi E1 0 0\n", "hi E1 0 1\n", "hi E1 0 2\n"]);

    stop.cancel();
    assert_eq!(worker.await.unwrap(), WorkerExit::Cancelled);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failing_jobs_are_counted_as_errors() {
    let cluster = TestCluster::start().await;
    let (_worker, stop) = cluster.spawn_worker(2);
    cluster.wait_for_nodes(1).await;

    let submission = cluster
        .registry
        .submit(BatchRequest::new(vec![
            TaskSpec::new(2, args(&["sh", "-c", "echo nope >&2; exit 2"])),
            TaskSpec::new(1, args(&["no-such-command-for-golem"])),
            TaskSpec::new(1, args(&["true"])),
        ]))
        .unwrap();

    let details = tokio::time::timeout(WAIT, submission.wait_complete())
        .await
        .expect("batch did not complete");
    assert_eq!(details.progress.finished, 1);
    assert_eq!(details.progress.errored, 3);

    assert_eventually(
        || {
            let submission = submission.clone();
            async move { submission.output().await.stderr.len() == 2 }
        },
        WAIT,
        "stderr lines should arrive",
    )
    .await;
    for line in submission.output().await.stderr {
        assert!(line.ends_with("ERRORED: nope\n"), "{}", line);
    }

    stop.cancel();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_kill_batch_terminates_running_jobs() {
    let cluster = TestCluster::start().await;
    let (_worker, stop) = cluster.spawn_worker(2);
    cluster.wait_for_nodes(1).await;

    let sleeper = args(&["sh", "-c", "exec sleep 30"]);
    let doomed = cluster
        .registry
        .submit(BatchRequest::new(vec![TaskSpec::new(1, sleeper.clone())]).with_batch_id("K1"))
        .unwrap();
    let survivor = cluster
        .registry
        .submit(BatchRequest::new(vec![TaskSpec::new(1, sleeper)]).with_batch_id("K2"))
        .unwrap();

    let registry = cluster.registry.clone();
    assert_eventually(
        || {
            let registry = registry.clone();
            async move { registry.list_nodes().first().map(|n| n.running_jobs) == Some(2) }
        },
        WAIT,
        "both jobs should be dispatched",
    )
    .await;
    // Give the worker a moment to actually spawn both children
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(cluster.registry.kill_batch("K1").await.unwrap());
    assert_eventually(
        || {
            let doomed = doomed.clone();
            async move { doomed.details().progress.errored == 1 }
        },
        WAIT,
        "killed job should be reported as errored",
    )
    .await;
    assert_eq!(doomed.details().state, BatchState::Stopped);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(survivor.is_running());
    assert_eq!(survivor.details().progress.errored, 0);

    cluster.registry.kill_batch("K2").await.unwrap();
    stop.cancel();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_die_stops_worker() {
    let cluster = TestCluster::start().await;
    let (worker, _stop) = cluster.spawn_worker(1);
    cluster.wait_for_nodes(1).await;

    assert_eq!(cluster.registry.shutdown_workers(), 1);
    let exit = tokio::time::timeout(WAIT, worker)
        .await
        .expect("worker did not exit")
        .unwrap();
    assert_eq!(exit, WorkerExit::Shutdown);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_worker_reconnects_after_master_drops_it() {
    let cluster = TestCluster::start().await;
    let (_worker, stop) = cluster.spawn_worker(1);
    cluster.wait_for_nodes(1).await;
    let first_id = cluster.registry.list_nodes()[0].node_id.clone();

    cluster.registry.close_all();
    let registry = cluster.registry.clone();
    assert_eventually(
        || {
            let registry = registry.clone();
            let first_id = first_id.clone();
            async move {
                let nodes = registry.list_nodes();
                nodes.len() == 1 && nodes[0].node_id != first_id
            }
        },
        WAIT,
        "worker should reconnect as a new node",
    )
    .await;

    let submission = cluster
        .registry
        .submit(BatchRequest::new(vec![TaskSpec::new(2, args(&["true"]))]))
        .unwrap();
    let details = tokio::time::timeout(WAIT, submission.wait_complete())
        .await
        .expect("batch did not complete after reconnect");
    assert_eq!(details.progress.finished, 2);

    stop.cancel();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_reports_jobs_whose_outcome_is_still_pending() {
    // A bare first master starts two jobs on a capacity-2 worker, then goes away
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = CancellationToken::new();
    let worker = Worker::new(test_worker_config(addr.to_string(), 2));
    let _worker = tokio::spawn(worker.run(stop.clone()));

    let (stream, peer) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    let (conn, mut inbound) = Connection::spawn(stream, peer.to_string(), DEFAULT_MAILBOX);
    match tokio::time::timeout(WAIT, inbound.recv()).await.unwrap() {
        Some(Message::Hello(info)) => assert_eq!(info.running_jobs, 0),
        other => panic!("expected HELLO, got {:?}", other),
    }
    let short = Job::new("OLD".to_string(), 0, 0, args(&["sh", "-c", "sleep 0.4"]));
    let long = Job::new("OLD".to_string(), 0, 1, args(&["sh", "-c", "sleep 4"]));
    conn.send(Message::Start(short)).await.unwrap();
    conn.send(Message::Start(long)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    conn.close();
    drop(inbound);
    drop(listener);

    // The short job finishes while no master is reachable
    tokio::time::sleep(Duration::from_millis(800)).await;

    let mut config = test_master_config();
    config.listen_addr = addr;
    let registry = MasterRegistry::new(config);
    let server = MasterServer::bind(registry.clone()).await.unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(server.run(shutdown.clone()));

    let running = || {
        let registry = registry.clone();
        async move { registry.list_nodes().first().map(|n| n.running_jobs) == Some(1) }
    };
    assert_eventually(running, WAIT, "only the long job should count as running").await;
    // Nothing else may free the long job's slot
    tokio::time::sleep(Duration::from_millis(300)).await;
    let node = registry.list_nodes().remove(0);
    assert_eq!(node.running_jobs, 1, "{:?}", node);
    assert_eq!(node.max_jobs, 2);

    let submission = registry
        .submit(BatchRequest::new(vec![TaskSpec::new(3, args(&["sh", "-c", "sleep 0.1"]))]).with_batch_id("N1"))
        .unwrap();
    let handle = registry.get_node(&node.node_id).unwrap();
    let done = tokio::time::timeout(WAIT, async {
        while submission.is_running() {
            // The long job still holds one of the two slots
            assert!(handle.in_flight().len() <= 1, "{:?}", handle.in_flight());
            assert!(handle.running() <= handle.capacity());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        submission.details()
    })
    .await
    .expect("batch did not complete after reconnect");
    assert_eq!(done.progress.finished, 3);
    assert_eq!(registry.list_nodes()[0].running_jobs, 1);

    stop.cancel();
    shutdown.cancel();
    server.await.unwrap().unwrap();
}
