//! Session manager against a scripted server

mod common;

use common::{init_tracing, MockServer, CLIENT_ID};
use futures::future::join_all;
use nfs4proto::{ArgOp, SeqStatusFlags, NFS4ERR_DELAY, NFS4ERR_STALE_CLIENTID, NFS4_OK};
use proxyclient::{ProxyClient, ProxyError, SessionNeeds, SessionStatus};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn manual_client(server: &MockServer) -> ProxyClient {
    let client = ProxyClient::new(server.config()).unwrap();
    client.spawn_connection();
    client
}

async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_exchange_then_create() {
    init_tracing();
    let server = MockServer::start().await;
    let client = manual_client(&server);
    let manager = client.session_manager();

    manager.step().await.unwrap();
    let state = client.session_state().await;
    assert_eq!(state.client_id, Some(CLIENT_ID));
    assert_eq!(state.client_sequence, 1);
    assert_eq!(
        state.needs,
        SessionNeeds {
            client_identity: false,
            session: true
        }
    );
    assert_eq!(client.session_status(), SessionStatus::Missing);

    manager.step().await.unwrap();
    let state = client.session_state().await;
    assert!(!state.needs.any());
    assert_eq!(state.session_id, server.state.current_session());
    assert_eq!(state.generation, 1);
    assert_eq!(state.client_sequence, 2);
    assert!(matches!(
        client.session_status(),
        SessionStatus::Ready { generation: 1, .. }
    ));

    let calls = server.state.calls();
    let owner = match calls[0].first_op() {
        Some(ArgOp::ExchangeId(args)) => {
            String::from_utf8(args.client_owner.owner_id.to_vec()).unwrap()
        }
        other => panic!("first call was {:?}", other),
    };
    assert!(owner.starts_with("127.0.0.1("), "{}", owner);
    assert!(owner.ends_with(" - nfs4 proxy"), "{}", owner);

    match calls[1].first_op() {
        Some(ArgOp::CreateSession(args)) => {
            assert_eq!(args.client_id, CLIENT_ID);
            assert_eq!(args.sequence_id, 1);
            assert_eq!(args.fore_channel.max_requests, 4);
            assert_eq!(args.back_channel.max_requests, 1);
        }
        other => panic!("second call was {:?}", other),
    }

    client.shutdown().await;
}

#[tokio::test]
async fn test_failed_create_session_retries_only_create() {
    init_tracing();
    let server = MockServer::start().await;
    server
        .state
        .create_session_status
        .store(NFS4ERR_DELAY, Ordering::SeqCst);
    let client = manual_client(&server);
    let manager = client.session_manager();

    manager.step().await.unwrap();
    let err = manager.step().await.unwrap_err();
    assert!(matches!(
        err,
        ProxyError::Nfs {
            op: "CREATE_SESSION",
            status: NFS4ERR_DELAY
        }
    ));
    assert_eq!(
        client.session_state().await.needs,
        SessionNeeds {
            client_identity: false,
            session: true
        }
    );

    server
        .state
        .create_session_status
        .store(NFS4_OK, Ordering::SeqCst);
    manager.step().await.unwrap();
    assert!(!client.session_state().await.needs.any());

    let calls = server.state.calls();
    assert_eq!(calls.iter().filter(|c| c.is_exchange_id()).count(), 1);
    let creates: Vec<_> = calls
        .iter()
        .filter_map(|c| match c.first_op() {
            Some(ArgOp::CreateSession(args)) => Some(args.sequence_id),
            _ => None,
        })
        .collect();
    // A failed attempt does not consume the sequence id.
    assert_eq!(creates, vec![1, 1]);

    client.shutdown().await;
}

#[tokio::test]
async fn test_stale_client_id_goes_back_to_exchange() {
    init_tracing();
    let server = MockServer::start().await;
    server
        .state
        .create_session_status
        .store(NFS4ERR_STALE_CLIENTID, Ordering::SeqCst);
    let client = manual_client(&server);
    let manager = client.session_manager();

    manager.step().await.unwrap();
    assert!(manager.step().await.is_err());
    assert_eq!(client.session_state().await.needs, SessionNeeds::all());

    server
        .state
        .create_session_status
        .store(NFS4_OK, Ordering::SeqCst);
    manager.step().await.unwrap();
    manager.step().await.unwrap();
    assert!(client.session_state().await.session_id.is_some());

    let calls = server.state.calls();
    assert_eq!(calls.iter().filter(|c| c.is_exchange_id()).count(), 2);
    assert_eq!(calls.iter().filter(|c| c.is_create_session()).count(), 2);

    client.shutdown().await;
}

#[tokio::test]
async fn test_renewal_with_status_flags_renegotiates() {
    init_tracing();
    let server = MockServer::start().await;
    // Renewal due a second after the session comes up
    server.state.lease.store(1, Ordering::SeqCst);
    let client = manual_client(&server);
    let manager = client.session_manager();

    manager.step().await.unwrap();
    manager.step().await.unwrap();
    let first = client.session_state().await;
    assert_eq!(first.lease, Duration::from_secs(1));

    server.state.sequence_flags.store(
        SeqStatusFlags::RESTART_RECLAIM_NEEDED.bits(),
        Ordering::SeqCst,
    );
    server
        .state
        .create_session_status
        .store(NFS4ERR_DELAY, Ordering::SeqCst);

    // Renewal sees the flags, drops the session and fails to recreate it.
    assert!(manager.step().await.is_err());
    let state = client.session_state().await;
    assert_eq!(
        state.needs,
        SessionNeeds {
            client_identity: false,
            session: true
        }
    );
    assert!(state.session_missing());
    assert_eq!(client.session_status(), SessionStatus::Missing);

    server.state.sequence_flags.store(0, Ordering::SeqCst);
    server
        .state
        .create_session_status
        .store(NFS4_OK, Ordering::SeqCst);
    manager.step().await.unwrap();
    let state = client.session_state().await;
    assert_eq!(state.generation, 2);
    assert_ne!(state.session_id, first.session_id);
    assert_eq!(server.state.sessions_created(), 2);

    client.shutdown().await;
}

#[tokio::test]
async fn test_quiet_renewal_keeps_session() {
    init_tracing();
    let server = MockServer::start().await;
    server.state.lease.store(1, Ordering::SeqCst);
    let client = manual_client(&server);
    let manager = client.session_manager();

    manager.step().await.unwrap();
    manager.step().await.unwrap();
    let before = client.session_state().await;

    manager.step().await.unwrap();
    let after = client.session_state().await;
    assert_eq!(after.session_id, before.session_id);
    assert_eq!(after.generation, 1);

    let last = server.state.calls().pop().unwrap();
    assert_eq!(last.args.ops.len(), 1);
    assert!(last.slot_and_sequence().is_some());

    client.shutdown().await;
}

#[tokio::test]
async fn test_start_reaches_ready_and_fetches_lease() {
    init_tracing();
    let server = MockServer::start().await;
    server.state.lease.store(30, Ordering::SeqCst);
    let client = ProxyClient::start(server.config()).unwrap();

    let id = client.wait_for_session(Duration::from_secs(5)).await.unwrap();
    assert_eq!(Some(id), server.state.current_session());

    for _ in 0..300 {
        if client.session_state().await.lease == Duration::from_secs(30) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.session_state().await.lease, Duration::from_secs(30));

    let res = client
        .execute(vec![ArgOp::Sequence(Default::default()), ArgOp::PutRootFh])
        .await
        .unwrap();
    assert!(res.is_ok());
    match res.sequence() {
        Some(Ok(seq)) => {
            assert_eq!(seq.session_id, id);
            assert_eq!(seq.highest_slot_id, 3);
        }
        other => panic!("no SEQUENCE result: {:?}", other),
    }

    client.shutdown().await;
}

#[tokio::test]
async fn test_slot_sequence_ids_are_consecutive() {
    init_tracing();
    let server = MockServer::start().await;
    let client = Arc::new(ProxyClient::start(server.config()).unwrap());
    client.wait_for_session(Duration::from_secs(5)).await.unwrap();

    let calls: Vec<_> = (0..32)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .execute(vec![ArgOp::Sequence(Default::default()), ArgOp::PutRootFh])
                    .await
            })
        })
        .collect();
    for res in join_all(calls).await {
        assert!(res.unwrap().unwrap().is_ok());
    }

    let mut per_slot: HashMap<u32, Vec<u32>> = HashMap::new();
    for call in server.state.calls() {
        if let Some((slot, seq)) = call.slot_and_sequence() {
            per_slot.entry(slot).or_default().push(seq);
        }
    }
    assert!(per_slot.keys().all(|slot| *slot < 4));
    for (slot, seqs) in per_slot {
        let expected: Vec<u32> = (1..=seqs.len() as u32).collect();
        assert_eq!(seqs, expected, "slot {}", slot);
    }

    client.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_confirms_session() {
    init_tracing();
    let server = MockServer::start().await;
    let client = ProxyClient::start(server.config()).unwrap();
    let id = client.wait_for_session(Duration::from_secs(5)).await.unwrap();

    server.state.kick();
    wait_until("SEQUENCE on the new connection", || {
        server
            .state
            .calls()
            .iter()
            .any(|c| c.conn == 1 && c.slot_and_sequence().is_some())
    })
    .await;

    // Same session, confirmed rather than recreated
    assert_eq!(client.wait_for_session(Duration::from_secs(5)).await.unwrap(), id);
    assert_eq!(server.state.sessions_created(), 1);
    for _ in 0..300 {
        if client.session_state().await.confirmed_link == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.session_state().await.confirmed_link, 2);

    client.shutdown().await;
}

#[tokio::test]
async fn test_lost_session_is_recreated_after_reconnect() {
    init_tracing();
    let server = MockServer::start().await;
    let client = ProxyClient::start(server.config()).unwrap();
    let first = client.wait_for_session(Duration::from_secs(5)).await.unwrap();

    server.state.forget_session();
    server.state.kick();
    wait_until("a second session", || server.state.sessions_created() == 2).await;

    let second = client.wait_for_session(Duration::from_secs(5)).await.unwrap();
    assert_ne!(first, second);
    let res = client
        .execute(vec![ArgOp::Sequence(Default::default()), ArgOp::PutRootFh])
        .await
        .unwrap();
    assert!(res.is_ok());
    // Only the session was lost; the client id is kept.
    assert_eq!(
        server
            .state
            .calls()
            .iter()
            .filter(|c| c.is_exchange_id())
            .count(),
        1
    );

    client.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_destroys_session() {
    init_tracing();
    let server = MockServer::start().await;
    let client = ProxyClient::start(server.config()).unwrap();
    client.wait_for_session(Duration::from_secs(5)).await.unwrap();

    client.shutdown().await;
    assert_eq!(server.state.current_session(), None);
    assert!(server
        .state
        .calls()
        .iter()
        .any(|c| matches!(c.first_op(), Some(ArgOp::DestroySession(_)))));
    assert_eq!(client.session_status(), SessionStatus::Closed);
    assert!(matches!(
        client.wait_for_session(Duration::from_millis(50)).await,
        Err(ProxyError::ShuttingDown)
    ));
}
