
use std::collections::VecDeque;
use std::time::Duration;

use golem_lite::error::GolemError;
use golem_lite::master::{BatchRequest, BatchState, MasterRegistry};
use golem_lite::protocol::Message;
use golem_lite::scheduler::TaskSpec;
use test_harness::{args, assert_eventually, job, test_master_config, FakeWorker};

const WAIT: Duration = Duration::from_secs(2);

fn batch(batch_id: &str, count: usize) -> BatchRequest {
    BatchRequest::new(vec![TaskSpec::new(count, args(&["true"]))]).with_batch_id(batch_id)
}

#[tokio::test]
async fn test_non_hello_first_message_drops_connection() {
    let registry = MasterRegistry::new(test_master_config());
    let worker = FakeWorker::attach(&registry);
    worker.send(Message::Checkin).await;

    let result = tokio::time::timeout(WAIT, worker.served).await.unwrap().unwrap();
    assert!(matches!(result, Err(GolemError::Protocol(_))));
    assert_eq!(registry.node_count(), 0);
}

#[tokio::test]
async fn test_silent_connection_times_out_handshake() {
    let registry = MasterRegistry::new(test_master_config());
    let worker = FakeWorker::attach(&registry);

    let result = tokio::time::timeout(WAIT, worker.served).await.unwrap().unwrap();
    assert!(matches!(result, Err(GolemError::HandshakeTimeout(500))));
    assert_eq!(registry.node_count(), 0);
}

#[tokio::test]
async fn test_handshake_seeds_capacity_and_running() {
    let registry = MasterRegistry::new(test_master_config());
    let _worker = FakeWorker::connect(&registry, 4, 1).await;

    let nodes = registry.list_nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].max_jobs, 4);
    assert_eq!(nodes[0].running_jobs, 1);
    assert!(nodes[0].running);
    assert_eq!(nodes[0].uri, format!("/nodes/{}", nodes[0].node_id));
}

#[tokio::test]
async fn test_capacity_one_withholds_second_job_until_first_finishes() {
    let registry = MasterRegistry::new(test_master_config());
    let mut worker = FakeWorker::connect(&registry, 1, 0).await;
    registry.submit(batch("B1", 2)).unwrap();

    let first = worker.expect_start(WAIT).await;
    assert_eq!(first.task_id, 0);
    worker.expect_silence(Duration::from_millis(250)).await;

    worker.finish(first).await;
    let second = worker.expect_start(WAIT).await;
    assert_eq!(second.task_id, 1);
}

#[tokio::test]
async fn test_running_never_exceeds_capacity() {
    let registry = MasterRegistry::new(test_master_config());
    let mut worker = FakeWorker::connect(&registry, 2, 0).await;
    let submission = registry.submit(batch("B1", 6)).unwrap();

    let mut outstanding = VecDeque::new();
    let mut received = 0;
    let mut finished = 0;
    while finished < 6 {
        while outstanding.len() < 2 && received < 6 {
            outstanding.push_back(worker.expect_start(WAIT).await);
            received += 1;
        }
        let node = registry.list_nodes().remove(0);
        assert!(node.running_jobs <= node.max_jobs, "{:?}", node);
        if outstanding.len() == 2 {
            worker.expect_silence(Duration::from_millis(100)).await;
        }

        let job = outstanding.pop_front().unwrap();
        worker.finish(job).await;
        finished += 1;
    }

    let details = tokio::time::timeout(WAIT, submission.wait_complete())
        .await
        .unwrap();
    assert_eq!(details.state, BatchState::Complete);
    assert_eq!(details.progress.finished, 6);
}

#[tokio::test]
async fn test_resize_opens_more_slots() {
    let registry = MasterRegistry::new(test_master_config());
    let mut worker = FakeWorker::connect(&registry, 1, 0).await;
    registry.submit(batch("B1", 2)).unwrap();

    worker.expect_start(WAIT).await;
    worker.expect_silence(Duration::from_millis(150)).await;

    let node_id = registry.list_nodes()[0].node_id.clone();
    registry.resize_node(&node_id, 2).unwrap();
    assert_eq!(worker.expect_start(WAIT).await.task_id, 1);

    let node = registry.get_node(&node_id).unwrap();
    assert!(node.is_alive());
    assert_eq!(node.capacity(), 2);
    assert_eq!(node.running(), 2);
    let in_flight: Vec<u64> = node.in_flight().iter().map(|j| j.task_id).collect();
    assert_eq!(in_flight, vec![0, 1]);

    assert!(matches!(
        registry.resize_node("missing", 3),
        Err(GolemError::NodeNotFound(_))
    ));
}

#[tokio::test]
async fn test_reported_running_jobs_are_trusted() {
    let registry = MasterRegistry::new(test_master_config());
    let mut worker = FakeWorker::connect(&registry, 2, 2).await;
    registry.submit(batch("B1", 1)).unwrap();

    // Full from the handshake alone
    worker.expect_silence(Duration::from_millis(200)).await;

    // A job from before the reconnect finishes; its batch is unknown here
    worker.finish(job("OLD", 0)).await;
    let started = worker.expect_start(WAIT).await;
    assert_eq!(started.batch_id, "B1");
}

#[tokio::test]
async fn test_output_is_routed_to_batch_in_order() {
    let registry = MasterRegistry::new(test_master_config());
    let mut worker = FakeWorker::connect(&registry, 1, 0).await;
    let submission = registry.submit(batch("B1", 1)).unwrap();

    let started = worker.expect_start(WAIT).await;
    worker.stdout("B1", "a\n").await;
    worker.stdout("B1", "b\n").await;
    worker
        .send(Message::Stderr {
            batch_id: "B1".to_string(),
            line: "warn\n".to_string(),
        })
        .await;
    worker.stdout("UNKNOWN", "dropped\n").await;
    worker.finish(started).await;

    tokio::time::timeout(WAIT, submission.wait_complete())
        .await
        .unwrap();
    assert_eventually(
        || {
            let submission = submission.clone();
            async move {
                let out = submission.output().await;
                out.stdout == vec!["a\n".to_string(), "b\n".to_string()]
                    && out.stderr == vec!["warn\n".to_string()]
            }
        },
        WAIT,
        "output should reach the batch in order",
    )
    .await;
}

#[tokio::test]
async fn test_dead_node_is_removed_and_broadcast_still_works() {
    let registry = MasterRegistry::new(test_master_config());
    let worker = FakeWorker::connect(&registry, 1, 0).await;
    assert_eq!(registry.broadcast(Message::Restart), 1);

    worker.close();
    assert_eventually(
        || {
            let registry = registry.clone();
            async move { registry.node_count() == 0 }
        },
        WAIT,
        "dead node should be removed",
    )
    .await;

    assert_eq!(
        registry.broadcast(Message::Kill {
            batch_id: "B1".to_string()
        }),
        0
    );
    assert!(tokio::time::timeout(WAIT, worker.served)
        .await
        .unwrap()
        .unwrap()
        .is_ok());
}

#[tokio::test]
async fn test_dead_node_reports_in_flight_jobs_as_errored() {
    let registry = MasterRegistry::new(test_master_config());
    let mut worker = FakeWorker::connect(&registry, 2, 0).await;
    let submission = registry.submit(batch("B1", 3)).unwrap();

    let first = worker.expect_start(WAIT).await;
    worker.expect_start(WAIT).await;
    worker.finish(first).await;
    worker.expect_start(WAIT).await;
    worker.close();

    let details = tokio::time::timeout(WAIT, submission.wait_complete())
        .await
        .unwrap();
    assert_eq!(details.state, BatchState::Complete);
    assert_eq!(details.progress.finished, 1);
    assert_eq!(details.progress.errored, 2);
}

#[tokio::test]
async fn test_kill_batch_broadcasts_kill() {
    let registry = MasterRegistry::new(test_master_config());
    let mut worker = FakeWorker::connect(&registry, 1, 0).await;
    registry.submit(batch("B1", 1)).unwrap();
    worker.expect_start(WAIT).await;

    assert!(registry.kill_batch("B1").await.unwrap());
    assert_eq!(
        worker.expect_message(WAIT).await,
        Message::Kill {
            batch_id: "B1".to_string()
        }
    );
    assert!(matches!(
        registry.kill_batch("nope").await,
        Err(GolemError::BatchNotFound(_))
    ));
}

#[tokio::test]
async fn test_jobs_spread_across_nodes() {
    let registry = MasterRegistry::new(test_master_config());
    let mut a = FakeWorker::connect(&registry, 1, 0).await;
    let mut b = FakeWorker::connect(&registry, 1, 0).await;
    let submission = registry.submit(batch("B1", 2)).unwrap();

    let ja = a.expect_start(WAIT).await;
    let jb = b.expect_start(WAIT).await;
    assert_ne!(ja.task_id, jb.task_id);

    let stat = registry.cluster_stat();
    assert_eq!(stat.workers_running, 2);
    assert_eq!(stat.workers_available, 0);
    assert_eq!(stat.jobs_running, 1);

    a.finish(ja).await;
    b.fail(jb, "exit code: 1").await;
    let details = tokio::time::timeout(WAIT, submission.wait_complete())
        .await
        .unwrap();
    assert_eq!(details.progress.finished, 1);
    assert_eq!(details.progress.errored, 1);
}
