//! End-to-end tests driving a real dispatcher over UDP with stub peers.


use std::time::Duration;

use tokio::sync::mpsc;
use udp_dispatcher::protocol::Message;
use udp_dispatcher::scheduler::AllocationAlgorithm;

use test_harness::{assert_eventually, test_config, StubPeer, TestDispatcher};

const QUIET: Duration = Duration::from_millis(200);

fn args(msg: &Message) -> String {
    msg.arguments().join(",")
}

#[tokio::test]
async fn test_controller_registration() {
    let dispatcher = TestDispatcher::start(test_config(AllocationAlgorithm::RoundRobin)).await;
    let controller = StubPeer::bind(dispatcher.addr).await;
    let intruder = StubPeer::bind(dispatcher.addr).await;

    controller.register_controller().await;

    intruder
        .send(&format!("REG_CONTROLLER,127.0.0.1,{}", intruder.port()))
        .await;
    assert_eq!(intruder.recv().await.instruction(), "REG_FAILURE");

    // Registering the same endpoint again is accepted
    controller.register_controller().await;

    dispatcher.stop().await.unwrap();
    controller.expect("STOP_CONTROLLER").await;
}

#[tokio::test]
async fn test_controller_defaults_to_sender_address() {
    let dispatcher = TestDispatcher::start(test_config(AllocationAlgorithm::RoundRobin)).await;
    let controller = StubPeer::bind(dispatcher.addr).await;

    controller.send("REG_CONTROLLER").await;
    assert_eq!(controller.recv().await.instruction(), "REG_SUCCESS");

    controller.send("NEW_JOB,3").await;
    let reply = controller.recv().await;
    assert_eq!(reply.instruction(), "NEW_JOB_SUCCESS");
    assert_eq!(args(&reply), "1");

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_capacity_two_with_three_jobs() {
    let dispatcher =
        TestDispatcher::start(test_config(AllocationAlgorithm::WeightedRoundRobin)).await;
    let controller = StubPeer::bind(dispatcher.addr).await;
    let node = StubPeer::bind(dispatcher.addr).await;

    controller.register_controller().await;
    assert_eq!(node.register_node(2).await, 1);

    for expected_id in 1..=3 {
        controller.send("NEW_JOB,5").await;
        let reply = controller.recv().await;
        assert_eq!(reply.instruction(), "NEW_JOB_SUCCESS");
        assert_eq!(args(&reply), expected_id.to_string());
    }

    assert_eq!(args(&node.expect("NEW_JOB").await), "1,5");
    assert_eq!(args(&node.expect("NEW_JOB").await), "2,5");
    node.expect_silence(QUIET).await;
    assert_eq!(dispatcher.ledger.queued_len().await, 1);

    node.send("NEW_JOB_SUCCESS,1").await;
    node.send("FIN_JOB,1").await;

    let forwarded = controller.expect("FIN_JOB").await;
    assert_eq!(args(&forwarded), "1");
    assert_eq!(args(&node.expect("NEW_JOB").await), "3,5");

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_get_info_reports_saturated_node() {
    let dispatcher =
        TestDispatcher::start(test_config(AllocationAlgorithm::WeightedRoundRobin)).await;
    let controller = StubPeer::bind(dispatcher.addr).await;
    let node = StubPeer::bind(dispatcher.addr).await;

    controller.register_controller().await;
    node.register_node(2).await;
    for _ in 0..3 {
        controller.send("NEW_JOB,5").await;
        controller.expect("NEW_JOB_SUCCESS").await;
    }

    let ledger = dispatcher.ledger.clone();
    assert_eventually(
        || {
            let ledger = ledger.clone();
            async move { ledger.allocated_len().await == 2 }
        },
        Duration::from_secs(2),
        "two jobs should be allocated",
    )
    .await;

    controller.send("GET_INFO").await;
    let info = controller.expect("INFO").await;
    assert_eq!(args(&info), "1,1,2,1,2,100.00");

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_new_job_validation() {
    let dispatcher = TestDispatcher::start(test_config(AllocationAlgorithm::RoundRobin)).await;
    let client = StubPeer::bind(dispatcher.addr).await;

    // Without a registered controller replies go to the sender
    for bad in ["NEW_JOB,0", "NEW_JOB,abc", "NEW_JOB", "NEW_JOB,-4"] {
        client.send(bad).await;
        let reply = client.recv().await;
        assert_eq!(reply.instruction(), "NEW_JOB_FAILURE", "for {bad}");
    }
    assert_eq!(dispatcher.ledger.queued_len().await, 0);

    client.send("NEW_JOB, 2 ").await;
    let reply = client.recv().await;
    assert_eq!(reply.instruction(), "NEW_JOB_SUCCESS");
    assert_eq!(args(&reply), "1");

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_node_registration_failures() {
    let dispatcher = TestDispatcher::start(test_config(AllocationAlgorithm::RoundRobin)).await;
    let node = StubPeer::bind(dispatcher.addr).await;

    node.send(&format!("REG_NODE,127.0.0.1,{},0", node.port()))
        .await;
    assert_eq!(node.recv().await.instruction(), "REG_FAILURE");

    node.send("REG_NODE,127.0.0.1").await;
    assert_eq!(node.recv().await.instruction(), "REG_FAILURE");

    node.send(&format!("REG_NODE,not-an-ip,{},2", node.port()))
        .await;
    assert_eq!(node.recv().await.instruction(), "REG_FAILURE");

    assert!(dispatcher.registry.is_empty().await);

    // Identifiers are only consumed by successful registrations
    assert_eq!(node.register_node(1).await, 1);

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_node_acceptance_is_forwarded() {
    let dispatcher = TestDispatcher::start(test_config(AllocationAlgorithm::RoundRobin)).await;
    let controller = StubPeer::bind(dispatcher.addr).await;
    let node = StubPeer::bind(dispatcher.addr).await;

    controller.register_controller().await;
    node.register_node(1).await;
    controller.send("NEW_JOB,4").await;
    let queued = controller.recv().await;
    assert_eq!(queued.instruction(), "NEW_JOB_SUCCESS");
    assert_eq!(args(&queued), "1");

    assert_eq!(args(&node.expect("NEW_JOB").await), "1,4");
    node.send("NEW_JOB_SUCCESS,1").await;

    let forwarded = controller
        .recv_timeout(Duration::from_millis(500))
        .await
        .expect("acceptance was not forwarded");
    assert_eq!(forwarded.instruction(), "NEW_JOB_SUCCESS");
    assert_eq!(args(&forwarded), "1");
    assert_eq!(dispatcher.ledger.node_for_job(1).await, Some(1));

    // Unknown jobs are not forwarded
    node.send("NEW_JOB_SUCCESS,42").await;
    controller.expect_silence(QUIET).await;

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_node_rejection_requeues_job() {
    let dispatcher = TestDispatcher::start(test_config(AllocationAlgorithm::RoundRobin)).await;
    let controller = StubPeer::bind(dispatcher.addr).await;
    let node = StubPeer::bind(dispatcher.addr).await;

    controller.register_controller().await;
    node.register_node(1).await;
    controller.send("NEW_JOB,4").await;
    controller.expect("NEW_JOB_SUCCESS").await;

    assert_eq!(args(&node.expect("NEW_JOB").await), "1,4");
    node.send("NEW_JOB_FAILURE,1,busy").await;

    let forwarded = controller.expect("NEW_JOB_FAILURE").await;
    assert_eq!(args(&forwarded), "1");

    // The job goes back through the queue and is offered again
    assert_eq!(args(&node.expect("NEW_JOB").await), "1,4");

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_and_duplicate_completions_are_ignored() {
    let dispatcher = TestDispatcher::start(test_config(AllocationAlgorithm::RoundRobin)).await;
    let controller = StubPeer::bind(dispatcher.addr).await;
    let node = StubPeer::bind(dispatcher.addr).await;

    controller.register_controller().await;
    node.register_node(1).await;
    controller.send("NEW_JOB,1").await;
    controller.expect("NEW_JOB_SUCCESS").await;
    node.expect("NEW_JOB").await;

    node.send("FIN_JOB,1").await;
    controller.expect("FIN_JOB").await;

    node.send("FIN_JOB,1").await;
    node.send("FIN_JOB,42").await;
    node.send("NEW_JOB_FAILURE,42").await;
    controller.expect_silence(QUIET).await;

    assert_eq!(dispatcher.ledger.queued_len().await, 0);
    assert_eq!(dispatcher.ledger.allocated_len().await, 0);

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_datagrams_are_dropped() {
    let dispatcher = TestDispatcher::start(test_config(AllocationAlgorithm::RoundRobin)).await;
    let client = StubPeer::bind(dispatcher.addr).await;

    client.send("").await;
    client.send("   ").await;
    client.send("HELLO,1,2").await;
    client.send(",1").await;
    client.send("ACK_IS_ALIVE,7").await;
    client.expect_silence(QUIET).await;

    client.send("GET_INFO").await;
    assert_eq!(args(&client.recv().await), "0,0,0");

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_silent_node_is_evicted_and_jobs_move() {
    let config = test_config(AllocationAlgorithm::WeightedRoundRobin)
        .with_heartbeat_interval_ms(100)
        .with_max_warnings(3);
    let dispatcher = TestDispatcher::start(config).await;
    let controller = StubPeer::bind(dispatcher.addr).await;
    let silent = StubPeer::bind(dispatcher.addr).await;
    let healthy = StubPeer::bind(dispatcher.addr).await;

    controller.register_controller().await;
    let silent_id = silent.register_node(1).await;
    controller.send("NEW_JOB,9").await;
    controller.expect("NEW_JOB_SUCCESS").await;
    assert_eq!(args(&silent.expect("NEW_JOB").await), "1,9");

    let healthy_id = healthy.register_node(1).await;
    let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let msg = healthy.recv_timeout(Duration::from_secs(5)).await;
            let Some(msg) = msg else { break };
            match msg.instruction() {
                // Identify by endpoint only
                "IS_ALIVE" => healthy.send("ACK_IS_ALIVE").await,
                "NEW_JOB" => {
                    let _ = jobs_tx.send(args(&msg));
                }
                _ => {}
            }
        }
    });

    let reassigned = tokio::time::timeout(Duration::from_secs(3), jobs_rx.recv())
        .await
        .expect("job was not reassigned")
        .unwrap();
    assert_eq!(reassigned, "1,9");

    assert!(dispatcher.registry.get(silent_id).await.is_none());
    assert!(dispatcher.registry.get(healthy_id).await.is_some());
    assert_eq!(dispatcher.ledger.node_for_job(1).await, Some(healthy_id));

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_system_broadcasts_and_exits() {
    let dispatcher = TestDispatcher::start(test_config(AllocationAlgorithm::RoundRobin)).await;
    let controller = StubPeer::bind(dispatcher.addr).await;
    let first = StubPeer::bind(dispatcher.addr).await;
    let second = StubPeer::bind(dispatcher.addr).await;

    controller.register_controller().await;
    first.register_node(2).await;
    second.register_node(2).await;

    controller.send("STOP_SYSTEM").await;

    first.expect("STOP_NODE").await;
    second.expect("STOP_NODE").await;
    controller.expect("STOP_CONTROLLER").await;

    let registry = dispatcher.registry.clone();
    dispatcher.join(Duration::from_secs(5)).await.unwrap();
    assert!(registry.is_empty().await);

    // The receive task is gone; nothing answers anymore
    controller.send("GET_INFO").await;
    assert!(controller.recv_timeout(QUIET).await.is_none());
}

#[tokio::test]
async fn test_external_shutdown_matches_stop_system() {
    let dispatcher = TestDispatcher::start(test_config(AllocationAlgorithm::RoundRobin)).await;
    let controller = StubPeer::bind(dispatcher.addr).await;
    let node = StubPeer::bind(dispatcher.addr).await;

    controller.register_controller().await;
    node.register_node(1).await;

    dispatcher.stop().await.unwrap();

    node.expect("STOP_NODE").await;
    controller.expect("STOP_CONTROLLER").await;
}
