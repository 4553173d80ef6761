//! Log replication and the client API end to end: entries committed through
//! the leader, failover without losing committed entries, and NOT_LEADER
//! redirects.

mod test_harness;

use std::time::Duration;

use ledger_lite::proto::{
    AppendRequest, GetLastIdRequest, OpenLogRequest, ReadRequest,
};
use test_harness::{assert_eventually, wait_for, TestCluster};

#[tokio::test]
async fn test_replicated_entry_reaches_all_nodes() {
    let cluster = TestCluster::new(3, 52100).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("cluster should elect a leader");

    let leader = cluster.get_node(leader_id).unwrap();
    let entry_id = leader
        .consensus
        .replicate(b"x".to_vec())
        .await
        .expect("leader accepts the entry");

    assert!(
        cluster
            .wait_for_commit_on_all(entry_id, Duration::from_secs(5))
            .await,
        "entry should commit everywhere"
    );

    for node in cluster.nodes.values() {
        let entries = node.log_entries().await;
        let entry = &entries[(entry_id - 1) as usize];
        assert_eq!(entry.data, b"x");
    }
    assert!(cluster.verify_log_consistency().await);
}

#[tokio::test]
async fn test_committed_entries_survive_leader_crash() {
    let mut cluster = TestCluster::new(3, 52110).await;
    let first_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("cluster should elect a leader");

    let entry_id = cluster
        .get_node(first_leader)
        .unwrap()
        .consensus
        .replicate(b"x".to_vec())
        .await
        .expect("leader accepts the entry");
    assert!(
        cluster
            .wait_for_commit_on_all(entry_id, Duration::from_secs(5))
            .await
    );

    assert!(cluster.kill_node(first_leader).await);
    let second_leader = cluster
        .wait_for_new_leader(first_leader, Duration::from_secs(5))
        .await
        .expect("a new leader should emerge");

    // The new leader still has "x" at the same id, and can commit new
    // entries on top of it.
    let new_entry_id = cluster
        .get_node(second_leader)
        .unwrap()
        .consensus
        .replicate(b"y".to_vec())
        .await
        .expect("new leader accepts entries");
    assert!(new_entry_id > entry_id);

    for node in cluster.nodes.values() {
        assert_eventually(
            || async { node.committed_id().await >= new_entry_id },
            Duration::from_secs(5),
            "surviving nodes should commit the new entry",
        )
        .await;
        let entries = node.log_entries().await;
        assert_eq!(entries[(entry_id - 1) as usize].data, b"x");
        assert_eq!(entries[(new_entry_id - 1) as usize].data, b"y");
    }
}

#[tokio::test]
async fn test_client_append_and_read_through_grpc() {
    let cluster = TestCluster::new(3, 52120).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("cluster should elect a leader");

    let mut client = cluster.client(leader_id).await;

    let log_id = client
        .open_log(OpenLogRequest {
            name: "events".to_string(),
        })
        .await
        .expect("open succeeds")
        .into_inner()
        .log_id;
    assert_eq!(log_id, 1);

    // Opening again returns the same log.
    let reopened = client
        .open_log(OpenLogRequest {
            name: "events".to_string(),
        })
        .await
        .unwrap()
        .into_inner()
        .log_id;
    assert_eq!(reopened, log_id);

    let first = client
        .append(AppendRequest {
            log_id,
            data: b"one".to_vec(),
        })
        .await
        .unwrap()
        .into_inner()
        .entry_id;
    let second = client
        .append(AppendRequest {
            log_id,
            data: b"two".to_vec(),
        })
        .await
        .unwrap()
        .into_inner()
        .entry_id;
    assert_eq!(first, 1);
    assert_eq!(second, 2);

    let read = client
        .read(ReadRequest { log_id, from: 1 })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(read.entries, vec![b"one".to_vec(), b"two".to_vec()]);

    let last_id = client
        .get_last_id(GetLastIdRequest { log_id })
        .await
        .unwrap()
        .into_inner()
        .last_id;
    assert_eq!(last_id, 2);
}

#[tokio::test]
async fn test_append_to_unknown_log_is_not_found() {
    let cluster = TestCluster::new(1, 52130).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("single node elects itself");

    let mut client = cluster.client(leader_id).await;
    let err = client
        .append(AppendRequest {
            log_id: 42,
            data: b"x".to_vec(),
        })
        .await
        .expect_err("append to a missing log fails");
    assert_eq!(err.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn test_follower_rejects_writes_with_leader_hint() {
    let cluster = TestCluster::new(3, 52140).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("cluster should elect a leader");

    let follower_id = (1..=3).find(|id| *id != leader_id).unwrap();
    let follower = cluster.get_node(follower_id).unwrap();

    // Wait until the follower has heard from the leader.
    assert!(
        wait_for(
            || async { follower.consensus.leader_hint().await.is_some() },
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await,
        "follower should learn the leader's address"
    );

    let mut client = cluster.client(follower_id).await;
    let err = client
        .open_log(OpenLogRequest {
            name: "events".to_string(),
        })
        .await
        .expect_err("followers reject client writes");
    assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    let leader_port = cluster.get_node(leader_id).unwrap().port;
    assert!(
        err.message().contains(&leader_port.to_string()),
        "error should carry the leader address, got: {}",
        err.message()
    );
}

#[tokio::test]
async fn test_reads_are_consistent_after_failover() {
    let mut cluster = TestCluster::new(3, 52150).await;
    let first_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("cluster should elect a leader");

    {
        let mut client = cluster.client(first_leader).await;
        let log_id = client
            .open_log(OpenLogRequest {
                name: "events".to_string(),
            })
            .await
            .unwrap()
            .into_inner()
            .log_id;
        client
            .append(AppendRequest {
                log_id,
                data: b"durable".to_vec(),
            })
            .await
            .unwrap();
    }

    assert!(cluster.kill_node(first_leader).await);
    let second_leader = cluster
        .wait_for_new_leader(first_leader, Duration::from_secs(5))
        .await
        .expect("a new leader should emerge");

    // The entry accepted before the crash is readable from the new leader.
    let mut client = cluster.client(second_leader).await;
    let read = client
        .read(ReadRequest { log_id: 1, from: 1 })
        .await
        .expect("read from the new leader succeeds")
        .into_inner();
    assert_eq!(read.entries, vec![b"durable".to_vec()]);
}
