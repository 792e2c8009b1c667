//! Leader loss, partitions and restarts.

use std::time::Duration;

use moonpool_harness::{ClusterHarness, Command, ConsensusNode, HarnessError};

use super::raft::RaftFactory;
use super::{fast_config, init_tracing};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_leader_after_disconnect() {
    init_tracing();
    let cluster = ClusterHarness::build(fast_config(3), RaftFactory).expect("build");

    cluster
        .submit_and_confirm(Command::from("a"), 3, false)
        .await
        .expect("agreement");
    let old_leader = cluster.check_one_leader().await.expect("one leader");
    let old_term = cluster.node(old_leader).expect("live").state().0;

    cluster.disconnect(old_leader).expect("disconnect");
    cluster
        .submit_and_confirm(Command::from("b"), 2, true)
        .await
        .expect("agreement with a majority");

    let new_leader = cluster.check_one_leader().await.expect("one leader");
    assert_ne!(new_leader, old_leader);
    let new_term = cluster.node(new_leader).expect("live").state().0;
    assert!(new_term > old_term);

    // The old leader rejoins and catches up.
    cluster.connect(old_leader).expect("connect");
    let index = cluster
        .submit_and_confirm(Command::from("c"), 3, true)
        .await
        .expect("agreement with everyone");
    assert_eq!(
        cluster.count_committed(index),
        Ok((3, Some(Command::from("c"))))
    );
    cluster.cleanup().expect("cleanup");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_agreement_without_quorum() {
    init_tracing();
    let cluster = ClusterHarness::build(
        fast_config(3).with_agreement_budget(Duration::from_secs(3), Duration::from_millis(500)),
        RaftFactory,
    )
    .expect("build");

    let leader = cluster.check_one_leader().await.expect("one leader");
    for i in (0..3).filter(|&i| i != leader) {
        cluster.disconnect(i).expect("disconnect");
    }

    let err = cluster
        .submit_and_confirm(Command::from("lost"), 2, false)
        .await
        .expect_err("a lone leader cannot commit");
    assert_eq!(
        err,
        HarnessError::AgreementFailed {
            command: Command::from("lost"),
        }
    );
    cluster.cleanup().expect("cleanup");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crashed_follower_catches_up_after_restart() {
    init_tracing();
    let cluster = ClusterHarness::build(fast_config(3), RaftFactory).expect("build");

    cluster
        .submit_and_confirm(Command::from(1u64), 3, true)
        .await
        .expect("agreement");
    let leader = cluster.check_one_leader().await.expect("one leader");
    let follower = (leader + 1) % 3;

    cluster.crash(follower).expect("crash");
    assert!(cluster.node(follower).is_none());
    assert!(!cluster.is_connected(follower));
    for value in 2..=4u64 {
        cluster
            .submit_and_confirm(Command::from(value), 2, true)
            .await
            .expect("agreement with a majority");
    }

    cluster.start_node(follower).expect("restart");
    cluster.connect(follower).expect("connect");
    let index = cluster
        .submit_and_confirm(Command::from(5u64), 3, true)
        .await
        .expect("agreement with everyone");
    assert_eq!(index, 5);
    assert!(cluster.rpc_count(follower) > 0);
    cluster.cleanup().expect("cleanup");
}
