mod common;

use common::{recorder, scripted_server, start_server, Inbox, Seen, APP, PASSWORD};
use serde_json::json;
use ssc_mesh::{Recipient, Session, SessionError, SessionOptions};
use std::time::Duration;

async fn connect(endpoint: &str, id: Option<&str>, name: &str) -> (Session, Inbox) {
    let opts = match id {
        None => SessionOptions::create(endpoint, APP, PASSWORD, name),
        Some(id) => SessionOptions::join(endpoint, APP, id, PASSWORD, name),
    };
    let (handler, inbox) = recorder();
    let session = Session::connect(opts, handler).await.unwrap();
    (session, inbox)
}

#[tokio::test]
async fn create_join_and_wrong_password() {
    let endpoint = start_server().await;
    let (amy, mut amy_inbox) = connect(&endpoint, None, "amy").await;
    assert_eq!(amy.id().len(), 6);
    assert_eq!(amy.users(), vec!["amy"]);

    let (bob, _bob_inbox) = connect(&endpoint, Some(amy.id()), "bob").await;
    assert_eq!(bob.users(), vec!["amy", "bob"]);
    assert_eq!(amy_inbox.next().await, Seen::Join("bob".into()));
    assert_eq!(amy.users(), vec!["amy", "bob"]);

    let err = Session::join(&endpoint, APP, amy.id(), "wrong", "eve")
        .await
        .unwrap_err();
    assert!(
        matches!(&err, SessionError::Rejected(reason) if reason.starts_with("InvalidPassword")),
        "{err:?}"
    );

    let err = Session::join(&endpoint, APP, amy.id(), PASSWORD, "bob")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Rejected(_)));

    let err = Session::join(&endpoint, "other-app", amy.id(), PASSWORD, "eve")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));

    assert!(amy_inbox.settle(Duration::from_millis(100)).await.is_empty());
    assert_eq!(amy.users(), vec!["amy", "bob"]);
}

#[tokio::test]
async fn broadcast_reaches_everyone_once() {
    let endpoint = start_server().await;
    let (amy, mut amy_inbox) = connect(&endpoint, None, "amy").await;
    let (_bob, mut bob_inbox) = connect(&endpoint, Some(amy.id()), "bob").await;
    let (_cid, mut cid_inbox) = connect(&endpoint, Some(amy.id()), "cid").await;
    amy_inbox.expect(|s| *s == Seen::Join("cid".into())).await;
    bob_inbox.expect(|s| *s == Seen::Join("cid".into())).await;

    amy.send(Recipient::Broadcast, json!("hello all")).unwrap();

    let expected = Seen::Reception {
        from: "amy".into(),
        message: json!("hello all"),
    };
    for inbox in [&mut amy_inbox, &mut bob_inbox, &mut cid_inbox] {
        let seen = inbox.settle(Duration::from_millis(200)).await;
        assert_eq!(seen.iter().filter(|s| **s == expected).count(), 1);
    }
}

#[tokio::test]
async fn unicast_to_missing_user_is_silent() {
    let endpoint = start_server().await;
    let (amy, mut amy_inbox) = connect(&endpoint, None, "amy").await;
    let (_bob, mut bob_inbox) = connect(&endpoint, Some(amy.id()), "bob").await;

    amy.send(Recipient::user("ghost"), json!("boo")).unwrap();
    amy.send(Recipient::user("bob"), json!("after")).unwrap();

    assert_eq!(
        bob_inbox.next().await,
        Seen::Reception {
            from: "amy".into(),
            message: json!("after"),
        }
    );
    let seen = amy_inbox.settle(Duration::from_millis(100)).await;
    assert!(!seen.iter().any(|s| matches!(s, Seen::Error(_))), "{seen:?}");
}

#[tokio::test]
async fn concurrent_asks_resolve_by_id() {
    let endpoint = start_server().await;
    let (amy, _amy_inbox) = connect(&endpoint, None, "amy").await;
    let (_bob, _bob_inbox) = connect(&endpoint, Some(amy.id()), "bob").await;

    let slow = amy.ask("bob", json!({"n": 1, "delay_ms": 200}));
    let fast = amy.ask("bob", json!({"n": 2}));
    let (slow, fast) = tokio::join!(slow, fast);

    assert_eq!(slow.unwrap()["echo"]["n"], 1);
    let fast = fast.unwrap();
    assert_eq!(fast["echo"]["n"], 2);
    assert_eq!(fast["from"], "amy");
}

#[tokio::test]
async fn refused_and_unroutable_asks_fail() {
    let endpoint = start_server().await;
    let (amy, _amy_inbox) = connect(&endpoint, None, "amy").await;
    let (_bob, _bob_inbox) = connect(&endpoint, Some(amy.id()), "bob").await;

    let err = amy.ask("bob", json!("fail")).await.unwrap_err();
    assert_eq!(err, SessionError::RemoteRequest("refused".into()));

    let err = amy.ask("ghost", json!(1)).await.unwrap_err();
    assert!(
        matches!(&err, SessionError::RemoteRequest(reason) if reason.contains("ghost")),
        "{err:?}"
    );
}

#[tokio::test]
async fn leave_updates_roster() {
    let endpoint = start_server().await;
    let (amy, mut amy_inbox) = connect(&endpoint, None, "amy").await;
    let (bob, _bob_inbox) = connect(&endpoint, Some(amy.id()), "bob").await;
    amy_inbox.expect(|s| *s == Seen::Join("bob".into())).await;

    bob.close().await;
    assert_eq!(amy_inbox.next().await, Seen::Leave("bob".into()));
    assert_eq!(amy.users(), vec!["amy"]);

    assert_eq!(
        bob.send(Recipient::Broadcast, json!("late")),
        Err(SessionError::Closed)
    );
    assert_eq!(bob.ask("amy", json!(1)).await, Err(SessionError::Closed));
}

#[tokio::test]
async fn failed_join_leaves_roster_unchanged() {
    let endpoint = start_server().await;
    let (amy, mut amy_inbox) = connect(&endpoint, None, "amy").await;
    let (bob, mut bob_inbox) = connect(&endpoint, Some(amy.id()), "bob").await;
    amy_inbox.expect(|s| *s == Seen::Join("bob".into())).await;

    let err = Session::join(&endpoint, APP, amy.id(), "wrong", "eve")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Rejected(_)), "{err:?}");

    assert!(amy_inbox.settle(Duration::from_millis(150)).await.is_empty());
    assert!(bob_inbox.settle(Duration::from_millis(50)).await.is_empty());
    assert_eq!(amy.users(), vec!["amy", "bob"]);
    assert_eq!(bob.users(), vec!["amy", "bob"]);

    let (cid, _cid_inbox) = connect(&endpoint, Some(amy.id()), "cid").await;
    assert_eq!(cid.users(), vec!["amy", "bob", "cid"]);
}

#[tokio::test]
async fn unanswered_ask_times_out() {
    let endpoint = start_server().await;
    let (amy, _amy_inbox) = connect(&endpoint, None, "amy").await;
    let (_bob, _bob_inbox) = connect(&endpoint, Some(amy.id()), "bob").await;

    tokio::time::pause();
    let result = amy.ask("bob", json!({"delay_ms": 3_600_000})).await;
    assert_eq!(result, Err(SessionError::Timeout(1)));
}

#[tokio::test]
async fn reply_to_departed_asker_keeps_own_asks_pending() {
    let endpoint = start_server().await;
    let (amy, mut amy_inbox) = connect(&endpoint, None, "amy").await;
    let (_bob, _bob_inbox) = connect(&endpoint, Some(amy.id()), "bob").await;
    let (cid, _cid_inbox) = connect(&endpoint, Some(amy.id()), "cid").await;
    amy_inbox.expect(|s| *s == Seen::Join("cid".into())).await;

    // у обоих запросов id 1: amy к bob и cid к amy
    let to_bob = tokio::spawn({
        let amy = amy.clone();
        async move { amy.ask("bob", json!({"n": 1, "delay_ms": 400})).await }
    });
    let from_cid = tokio::spawn({
        let cid = cid.clone();
        async move { cid.ask("amy", json!({"delay_ms": 150})).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cid.close().await;
    assert_eq!(from_cid.await.unwrap(), Err(SessionError::Closed));

    amy_inbox.expect(|s| *s == Seen::Leave("cid".into())).await;
    let seen = amy_inbox.expect(|s| matches!(s, Seen::Error(_))).await;
    assert!(
        matches!(&seen, Seen::Error(reason) if reason.contains("'cid'")),
        "{seen:?}"
    );
    assert_eq!(to_bob.await.unwrap().unwrap()["echo"]["n"], 1);
}

#[tokio::test]
async fn lost_rendezvous_connection_is_fatal() {
    let endpoint = scripted_server(vec![json!({"id": "ABCDEF", "users": ["amy"]}).to_string()]).await;
    let (handler, mut inbox) = recorder();
    let session = Session::connect(SessionOptions::create(&endpoint, APP, PASSWORD, "amy"), handler)
        .await
        .unwrap();
    assert_eq!(session.id(), "ABCDEF");

    assert!(matches!(inbox.next().await, Seen::Fatal(_)));
    assert!(session.is_closed());
    assert_eq!(session.ask("amy", json!(1)).await, Err(SessionError::Closed));
}

#[tokio::test]
async fn garbled_handshake_is_a_connection_error() {
    let endpoint = scripted_server(vec!["{not json".to_string()]).await;
    let err = Session::create(&endpoint, APP, PASSWORD, "amy")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Connection(_)), "{err:?}");
}
