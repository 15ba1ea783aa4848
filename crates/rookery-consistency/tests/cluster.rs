// End-to-end tests running full replicas in one process

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use rookery_common::CoordinationError;
use rookery_consistency::{
    ApplyOutcome, CoordinationConfig, EventKind, KeeperNode, KeeperNodeBuilder, KeeperOp, OpResult,
    Router, SessionResponse,
};

const WAIT: Duration = Duration::from_secs(10);

fn test_config(dir: &Path) -> CoordinationConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    CoordinationConfig {
        election_timeout_ms: 300,
        heartbeat_interval_ms: 100,
        session_check_interval_ms: 50,
        data_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

async fn start_single(dir: &Path, router: &Router) -> Arc<KeeperNode> {
    let node = KeeperNodeBuilder::new(1, test_config(dir), router.clone())
        .initial_member(1, "127.0.0.1:7001")
        .build()
        .await
        .unwrap();
    node.wait_init(WAIT).await.unwrap();
    node
}

/// Wait for the reply to a specific request, skipping unrelated
/// queue traffic (watch events for other paths etc.)
async fn recv_reply(rx: &mut UnboundedReceiver<SessionResponse>, request_id: u64) -> ApplyOutcome {
    loop {
        let response = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for reply")
            .expect("response queue closed");
        match response {
            SessionResponse::Reply {
                request_id: rid,
                outcome,
                ..
            } if rid == request_id => return outcome,
            _ => continue,
        }
    }
}

async fn recv_event(rx: &mut UnboundedReceiver<SessionResponse>) -> rookery_consistency::WatchEvent {
    loop {
        let response = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("response queue closed");
        if let SessionResponse::Event { event, .. } = response {
            return event;
        }
    }
}

fn create_op(path: &str, data: &[u8], ephemeral: bool, sequential: bool) -> KeeperOp {
    KeeperOp::Create {
        path: path.to_string(),
        data: data.to_vec(),
        ephemeral,
        sequential,
    }
}

#[tokio::test]
async fn test_single_node_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let router = Router::new();
    let node = start_single(dir.path(), &router).await;
    assert!(node.is_leader().await);

    let session = node.get_session_id(10_000).await.unwrap();
    let mut rx = node.response_queue().subscribe(session);

    node.put_request(session, 1, create_op("/cfg", b"v1", false, false))
        .unwrap();
    assert_eq!(
        recv_reply(&mut rx, 1).await,
        Ok(OpResult::Created {
            path: "/cfg".to_string()
        })
    );

    node.put_request(
        session,
        2,
        KeeperOp::GetData {
            path: "/cfg".to_string(),
            watch: false,
        },
    )
    .unwrap();
    match recv_reply(&mut rx, 2).await {
        Ok(OpResult::Data { data, stat }) => {
            assert_eq!(data, b"v1");
            assert_eq!(stat.version, 0);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    node.put_request(
        session,
        3,
        KeeperOp::SetData {
            path: "/cfg".to_string(),
            data: b"v2".to_vec(),
            version: 0,
        },
    )
    .unwrap();
    match recv_reply(&mut rx, 3).await {
        Ok(OpResult::SetData { stat }) => assert_eq!(stat.version, 1),
        other => panic!("unexpected outcome: {:?}", other),
    }

    node.put_request(session, 4, create_op("/cfg2", b"", false, false))
        .unwrap();
    recv_reply(&mut rx, 4).await.unwrap();
    node.put_request(
        session,
        5,
        KeeperOp::GetChildren {
            path: "/".to_string(),
            watch: false,
        },
    )
    .unwrap();
    assert_eq!(
        recv_reply(&mut rx, 5).await,
        Ok(OpResult::Children {
            children: vec!["cfg".to_string(), "cfg2".to_string()]
        })
    );

    node.put_request(session, 6, KeeperOp::CloseSession).unwrap();
    assert_eq!(recv_reply(&mut rx, 6).await, Ok(OpResult::SessionClosed));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sequential_creates_and_watch_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let router = Router::new();
    let node = start_single(dir.path(), &router).await;

    let s1 = node.get_session_id(10_000).await.unwrap();
    let s2 = node.get_session_id(10_000).await.unwrap();
    let mut rx1 = node.response_queue().subscribe(s1);
    let mut rx2 = node.response_queue().subscribe(s2);

    node.put_request(s1, 1, create_op("/queue", b"", false, false))
        .unwrap();
    recv_reply(&mut rx1, 1).await.unwrap();

    // Sequential suffixes reflect commit order
    node.put_request(s1, 2, create_op("/queue/item-", b"a", false, true))
        .unwrap();
    node.put_request(s2, 1, create_op("/queue/item-", b"b", false, true))
        .unwrap();
    let p1 = match recv_reply(&mut rx1, 2).await {
        Ok(OpResult::Created { path }) => path,
        other => panic!("unexpected outcome: {:?}", other),
    };
    let p2 = match recv_reply(&mut rx2, 1).await {
        Ok(OpResult::Created { path }) => path,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert_ne!(p1, p2);
    assert!(p1.starts_with("/queue/item-"));

    // S2 watches the child list, S1 changes it
    node.put_request(
        s2,
        2,
        KeeperOp::GetChildren {
            path: "/queue".to_string(),
            watch: true,
        },
    )
    .unwrap();
    recv_reply(&mut rx2, 2).await.unwrap();

    node.put_request(s1, 3, create_op("/queue/item-", b"c", false, true))
        .unwrap();
    recv_reply(&mut rx1, 3).await.unwrap();

    let event = recv_event(&mut rx2).await;
    assert_eq!(event.kind, EventKind::ChildrenChanged);
    assert_eq!(event.path, "/queue");

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ephemeral_cleanup_on_close_notifies_watchers() {
    let dir = tempfile::tempdir().unwrap();
    let router = Router::new();
    let node = start_single(dir.path(), &router).await;

    let owner = node.get_session_id(10_000).await.unwrap();
    let observer = node.get_session_id(10_000).await.unwrap();
    let mut owner_rx = node.response_queue().subscribe(owner);
    let mut observer_rx = node.response_queue().subscribe(observer);

    node.put_request(owner, 1, create_op("/lock", b"", true, false))
        .unwrap();
    recv_reply(&mut owner_rx, 1).await.unwrap();

    // A competing create fails while the owner session lives
    node.put_request(observer, 1, create_op("/lock", b"", true, false))
        .unwrap();
    assert_eq!(
        recv_reply(&mut observer_rx, 1).await,
        Err(CoordinationError::NodeExists("/lock".to_string()))
    );

    node.put_request(
        observer,
        2,
        KeeperOp::Exists {
            path: "/lock".to_string(),
            watch: true,
        },
    )
    .unwrap();
    recv_reply(&mut observer_rx, 2).await.unwrap();

    node.put_request(owner, 2, KeeperOp::CloseSession).unwrap();
    assert_eq!(
        recv_reply(&mut owner_rx, 2).await,
        Ok(OpResult::SessionClosed)
    );

    let event = recv_event(&mut observer_rx).await;
    assert_eq!(event.kind, EventKind::Deleted);
    assert_eq!(event.path, "/lock");

    // The retry now succeeds
    node.put_request(observer, 3, create_op("/lock", b"", true, false))
        .unwrap();
    assert_eq!(
        recv_reply(&mut observer_rx, 3).await,
        Ok(OpResult::Created {
            path: "/lock".to_string()
        })
    );

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_session_expires_without_heartbeats() {
    let dir = tempfile::tempdir().unwrap();
    let router = Router::new();
    let node = start_single(dir.path(), &router).await;

    let session = node.get_session_id(1_000).await.unwrap();
    let mut rx = node.response_queue().subscribe(session);

    node.put_request(session, 1, create_op("/e", b"", true, false))
        .unwrap();
    recv_reply(&mut rx, 1).await.unwrap();

    // No pings; the expiry loop proposes a check once the timeout
    // elapses and the ephemeral disappears with the session
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        {
            let state = node.state();
            let state = state.read().await;
            if !state.sessions.contains(session) {
                assert_eq!(state.store.exists("/e").unwrap(), None);
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never expired"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_recovers_namespace_and_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let router = Router::new();

    {
        let node = start_single(dir.path(), &router).await;
        let session = node.get_session_id(10_000).await.unwrap();
        let mut rx = node.response_queue().subscribe(session);

        node.put_request(session, 1, create_op("/durable", b"kept", false, false))
            .unwrap();
        recv_reply(&mut rx, 1).await.unwrap();
        node.put_request(session, 2, create_op("/gone", b"", true, false))
            .unwrap();
        recv_reply(&mut rx, 2).await.unwrap();
        node.put_request(session, 3, KeeperOp::CloseSession).unwrap();
        recv_reply(&mut rx, 3).await.unwrap();

        node.shutdown().await.unwrap();
    }

    // Same data directory, fresh process state
    let node = start_single(dir.path(), &router).await;
    let session = node.get_session_id(10_000).await.unwrap();
    let mut rx = node.response_queue().subscribe(session);

    node.put_request(
        session,
        1,
        KeeperOp::GetData {
            path: "/durable".to_string(),
            watch: false,
        },
    )
    .unwrap();
    match recv_reply(&mut rx, 1).await {
        Ok(OpResult::Data { data, .. }) => assert_eq!(data, b"kept"),
        other => panic!("unexpected outcome: {:?}", other),
    }

    // The ephemeral died with its session before the restart
    node.put_request(
        session,
        2,
        KeeperOp::Exists {
            path: "/gone".to_string(),
            watch: false,
        },
    )
    .unwrap();
    assert_eq!(
        recv_reply(&mut rx, 2).await,
        Err(CoordinationError::NotFound("/gone".to_string()))
    );

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_put_request_on_non_leader_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let router = Router::new();

    // Never initialized, so no leader exists anywhere
    let node = KeeperNodeBuilder::new(1, test_config(dir.path()), router.clone())
        .build()
        .await
        .unwrap();

    assert_eq!(
        node.put_request(1, 1, KeeperOp::Ping),
        Err(CoordinationError::NotLeader)
    );
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_requests_after_shutdown_fail_fast() {
    let dir = tempfile::tempdir().unwrap();
    let router = Router::new();
    let node = start_single(dir.path(), &router).await;

    node.shutdown().await.unwrap();

    assert_eq!(
        node.put_request(1, 1, KeeperOp::Ping),
        Err(CoordinationError::ShuttingDown)
    );
    assert_eq!(
        node.get_session_id(10_000).await,
        Err(CoordinationError::ShuttingDown)
    );
}

#[tokio::test]
async fn test_shutdown_releases_blocked_session_caller() {
    let dir = tempfile::tempdir().unwrap();
    let router = Router::new();

    let n1 = KeeperNodeBuilder::new(1, test_config(&dir.path().join("n1")), router.clone())
        .initial_member(1, "127.0.0.1:7001")
        .initial_member(2, "127.0.0.1:7002")
        .build()
        .await
        .unwrap();
    let n2 = KeeperNodeBuilder::new(2, test_config(&dir.path().join("n2")), router.clone())
        .initial_member(1, "127.0.0.1:7001")
        .initial_member(2, "127.0.0.1:7002")
        .build()
        .await
        .unwrap();
    n1.wait_init(WAIT).await.unwrap();
    n2.wait_init(WAIT).await.unwrap();

    let (leader, follower) = if n1.is_leader().await {
        (n1, n2)
    } else {
        (n2, n1)
    };

    // With the only other voter gone, proposals can never reach quorum
    follower.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let blocked = {
        let leader = leader.clone();
        tokio::spawn(async move { leader.get_session_id(10_000).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!blocked.is_finished(), "caller should be awaiting commit");

    // Shutdown must release the blocked caller with a typed failure
    leader.shutdown().await.unwrap();
    let outcome = tokio::time::timeout(WAIT, blocked)
        .await
        .expect("blocked caller was never released")
        .unwrap();
    assert_eq!(outcome, Err(CoordinationError::ShuttingDown));
}

#[tokio::test]
async fn test_three_node_replication() {
    let dir = tempfile::tempdir().unwrap();
    let router = Router::new();

    let leader = KeeperNodeBuilder::new(1, test_config(&dir.path().join("n1")), router.clone())
        .initial_member(1, "127.0.0.1:7001")
        .build()
        .await
        .unwrap();
    leader.wait_init(WAIT).await.unwrap();

    let n2 = KeeperNodeBuilder::new(2, test_config(&dir.path().join("n2")), router.clone())
        .build()
        .await
        .unwrap();
    let n3 = KeeperNodeBuilder::new(3, test_config(&dir.path().join("n3")), router.clone())
        .build()
        .await
        .unwrap();

    // One voting replica, one pure learner
    leader.add_server(2, "127.0.0.1:7002", true, 0).await.unwrap();
    leader.add_server(3, "127.0.0.1:7003", false, 0).await.unwrap();
    leader.wait_for_server(2, WAIT).await.unwrap();
    leader.wait_for_server(3, WAIT).await.unwrap();

    assert!(leader.is_leader().await);
    assert!(n2.is_leader_alive().await);

    // The learner is in the membership but never in the voter set
    let membership = leader.metrics().membership_config;
    let voters: std::collections::BTreeSet<_> =
        membership.membership().voter_ids().collect();
    assert!(voters.contains(&2));
    assert!(!voters.contains(&3));
    assert!(membership.membership().nodes().any(|(id, _)| *id == 3));

    let session = leader.get_session_id(10_000).await.unwrap();
    let mut rx = leader.response_queue().subscribe(session);
    leader
        .put_request(session, 1, create_op("/shared", b"x", false, false))
        .unwrap();
    recv_reply(&mut rx, 1).await.unwrap();

    // Followers apply the same entries and converge on the same tree
    let applied = leader
        .metrics()
        .last_applied
        .map(|l| l.index)
        .unwrap_or(0);
    n2.wait_applied(applied, WAIT).await.unwrap();
    n3.wait_applied(applied, WAIT).await.unwrap();

    for follower in [&n2, &n3] {
        let state = follower.state();
        let state = state.read().await;
        let (data, _) = state.store.get("/shared").unwrap();
        assert_eq!(data, b"x");
    }

    leader.shutdown().await.unwrap();
    n2.shutdown().await.unwrap();
    n3.shutdown().await.unwrap();
}
