mod common;

use common::{mesh_of, Seen};
use serde_json::json;
use ssc_mesh::peer::types::Role;
use ssc_mesh::peer::CONTROL_LABEL;
use ssc_mesh::{MediaStream, MeshError, OutgoingFile, Recipient};
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn one_control_channel_per_pair_opened_by_newcomer() {
    let names = ["amy", "bob", "cid", "dan"];
    let (net, members) = mesh_of(&names).await;

    let position = |name: &str| names.iter().position(|n| *n == name).unwrap();
    let controls: Vec<_> = net
        .channel_log()
        .into_iter()
        .filter(|r| r.label == CONTROL_LABEL)
        .collect();
    assert_eq!(controls.len(), 6);

    let mut pairs = HashSet::new();
    for record in &controls {
        // новички сами дозваниваются до тех, кто уже в сессии
        assert!(position(&record.opener) > position(&record.acceptor), "{record:?}");
        assert!(pairs.insert((record.opener.clone(), record.acceptor.clone())));
    }

    for member in &members {
        assert_eq!(member.mesh.users(), names);
        assert_eq!(member.mesh.peers().len(), 3);
    }
    for peer in members[0].mesh.peers() {
        assert_eq!(peer.role, Role::Polite);
        assert!(!peer.initiator);
        assert!(peer.connected_at.is_some());
    }
    for peer in members[3].mesh.peers() {
        assert_eq!(peer.role, Role::Impolite);
        assert!(peer.candidates.host >= 1);
    }
}

#[tokio::test]
async fn broadcast_delivered_once_including_sender() {
    let (_net, mut members) = mesh_of(&["amy", "bob", "cid"]).await;
    members[1]
        .mesh
        .send(Recipient::Broadcast, json!({"chat": "hi"}))
        .await
        .unwrap();

    let expected = Seen::Reception {
        from: "bob".into(),
        message: json!({"chat": "hi"}),
    };
    for member in members.iter_mut() {
        let seen = member.inbox.settle(Duration::from_millis(200)).await;
        assert_eq!(seen.iter().filter(|s| **s == expected).count(), 1, "{}", member.name);
    }
}

#[tokio::test]
async fn unicast_to_missing_user_is_silent() {
    let (_net, mut members) = mesh_of(&["amy", "bob"]).await;
    members[0]
        .mesh
        .send(Recipient::user("ghost"), json!("boo"))
        .await
        .unwrap();
    members[0]
        .mesh
        .send(Recipient::user("bob"), json!("after"))
        .await
        .unwrap();
    assert_eq!(
        members[1].inbox.next().await,
        Seen::Reception {
            from: "amy".into(),
            message: json!("after"),
        }
    );
}

#[tokio::test]
async fn asks_over_control_channel() {
    let (_net, members) = mesh_of(&["amy", "bob"]).await;
    let amy = &members[0].mesh;

    let slow = amy.ask("bob", json!({"n": 1, "delay_ms": 150}));
    let fast = amy.ask("bob", json!({"n": 2}));
    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(slow.unwrap()["echo"]["n"], 1);
    assert_eq!(fast.unwrap()["echo"]["n"], 2);

    assert_eq!(
        amy.ask("bob", json!("fail")).await,
        Err(MeshError::RemoteRequest("refused".into()))
    );
    assert_eq!(
        amy.ask("ghost", json!(1)).await,
        Err(MeshError::UnknownPeer("ghost".into()))
    );
    let own = amy.ask("amy", json!({"n": 3})).await.unwrap();
    assert_eq!(own["from"], "amy");
}

#[tokio::test]
async fn file_of_40000_bytes_arrives_intact() {
    let (_net, mut members) = mesh_of(&["amy", "bob"]).await;
    let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();

    let ids = members[0]
        .mesh
        .send_file(
            Recipient::user("bob"),
            OutgoingFile::new("blob.bin", "application/octet-stream", data.clone()),
            json!({"upload": 7}),
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let seen = members[1]
        .inbox
        .expect(|s| matches!(s, Seen::File { .. }))
        .await;
    assert_eq!(
        seen,
        Seen::File {
            from: "amy".into(),
            name: "blob.bin".into(),
            mime: "application/octet-stream".into(),
            data,
            correlation: json!({"upload": 7}),
        }
    );
}

#[tokio::test]
async fn broadcast_file_reaches_sender_too() {
    let (_net, mut members) = mesh_of(&["amy", "bob"]).await;
    let ids = members[1]
        .mesh
        .send_file(
            Recipient::Broadcast,
            OutgoingFile::new("empty.txt", "text/plain", Vec::new()),
            json!(null),
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    for member in members.iter_mut() {
        let seen = member.inbox.expect(|s| matches!(s, Seen::File { .. })).await;
        assert!(
            matches!(&seen, Seen::File { from, data, .. } if from == "bob" && data.is_empty()),
            "{seen:?}"
        );
    }
}

#[tokio::test]
async fn streams_begin_and_end() {
    let (_net, mut members) = mesh_of(&["amy", "bob"]).await;
    let amy = members[0].mesh.clone();

    amy.begin_stream(Recipient::user("bob"), MediaStream::new("cam"))
        .await
        .unwrap();
    assert_eq!(
        members[1].inbox.next().await,
        Seen::StreamBegin {
            from: "amy".into(),
            id: "cam".into(),
        }
    );
    assert_eq!(members[1].mesh.peers()[0].streams, vec!["cam"]);

    // неизвестный поток: ничего не происходит
    amy.end_stream(Recipient::user("bob"), "nope").await.unwrap();
    amy.end_stream(Recipient::user("bob"), "cam").await.unwrap();
    assert_eq!(
        members[1].inbox.next().await,
        Seen::StreamEnd {
            from: "amy".into(),
            id: "cam".into(),
        }
    );

    amy.begin_stream(Recipient::user("amy"), MediaStream::new("preview"))
        .await
        .unwrap();
    assert_eq!(
        members[0].inbox.next().await,
        Seen::StreamBegin {
            from: "amy".into(),
            id: "preview".into(),
        }
    );
    amy.end_stream(Recipient::user("amy"), "preview").await.unwrap();
    amy.end_stream(Recipient::user("amy"), "preview").await.unwrap();
    assert_eq!(
        members[0].inbox.next().await,
        Seen::StreamEnd {
            from: "amy".into(),
            id: "preview".into(),
        }
    );
    assert!(members[0]
        .inbox
        .settle(Duration::from_millis(100))
        .await
        .is_empty());
}

#[tokio::test]
async fn leaving_member_tears_down_streams() {
    let (_net, mut members) = mesh_of(&["amy", "bob", "cid"]).await;
    members[0]
        .mesh
        .begin_stream(Recipient::user("bob"), MediaStream::new("cam"))
        .await
        .unwrap();
    members[1]
        .inbox
        .expect(|s| matches!(s, Seen::StreamBegin { .. }))
        .await;

    members[0].mesh.close().await;

    let bob = &mut members[1];
    assert_eq!(
        bob.inbox.expect(|s| !matches!(s, Seen::Error(_))).await,
        Seen::StreamEnd {
            from: "amy".into(),
            id: "cam".into(),
        }
    );
    assert_eq!(bob.inbox.next().await, Seen::Leave("amy".into()));
    assert_eq!(bob.mesh.users(), vec!["bob", "cid"]);

    let leaves = bob
        .inbox
        .settle(Duration::from_millis(200))
        .await
        .into_iter()
        .filter(|s| matches!(s, Seen::Leave(_)))
        .count();
    assert_eq!(leaves, 0);

    members[2]
        .inbox
        .expect(|s| *s == Seen::Leave("amy".into()))
        .await;
    assert_eq!(
        members[0].mesh.send(Recipient::Broadcast, json!(1)).await,
        Err(MeshError::Closed)
    );
}
