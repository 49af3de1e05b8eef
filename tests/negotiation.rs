mod common;

use common::{mesh_of, Seen};
use serde_json::json;
use ssc_mesh::peer::negotiation::{Negotiator, OfferDecision, OfferGuard};
use ssc_mesh::peer::types::{LinkState, Role, SignalingState};
use ssc_mesh::peer::{ConnectionFactory, DirectConnection, MockNetwork, CONTROL_LABEL};
use ssc_mesh::{MediaStream, Recipient};
use std::sync::Arc;

#[tokio::test]
async fn crossing_offers_converge_with_polite_side_yielding() {
    let net = MockNetwork::new();
    let amy_link = net.endpoint("amy").connect("bob").await.unwrap();
    let bob_link = net.endpoint("bob").connect("amy").await.unwrap();
    let (amy_conn, bob_conn) = (amy_link.connection, bob_link.connection);

    let amy = Negotiator::shared(Role::for_initiator(true));
    let bob = Negotiator::shared(Role::for_initiator(false));

    let _control = amy_conn.create_channel(CONTROL_LABEL).await.unwrap();
    let _extra = bob_conn.create_channel("extra").await.unwrap();

    let amy_offering = OfferGuard::begin(&amy);
    let amy_offer = amy_conn.create_offer().await.unwrap();
    let bob_offering = OfferGuard::begin(&bob);
    let _bob_offer = bob_conn.create_offer().await.unwrap();

    // amy получает offer bob'а, bob получает offer amy
    let amy_decision = amy.lock().on_remote_offer(amy_conn.signaling_state());
    let bob_decision = bob.lock().on_remote_offer(bob_conn.signaling_state());
    assert_eq!(amy_decision, OfferDecision::Ignore);
    assert_eq!(bob_decision, OfferDecision::Accept);

    let answer = bob_conn.apply_remote(amy_offer).await.unwrap().unwrap();
    assert_eq!(bob_conn.signaling_state(), SignalingState::Stable);
    drop(bob_offering);

    assert_eq!(amy_conn.apply_remote(answer).await.unwrap(), None);
    drop(amy_offering);

    assert_eq!(amy_conn.signaling_state(), SignalingState::Stable);
    assert!(!amy.lock().is_making_offer());
    assert!(!bob.lock().is_making_offer());
    assert_eq!(amy.lock().ignored_offers(), 1);
    assert_eq!(bob.lock().ignored_offers(), 0);

    assert!(net.connection("amy", "bob").unwrap().is_connected());
    assert!(net.connection("bob", "amy").unwrap().is_connected());
    let labels: Vec<String> = net.channel_log().into_iter().map(|r| r.label).collect();
    assert_eq!(labels.len(), 2);
    assert!(labels.contains(&CONTROL_LABEL.to_string()));
    assert!(labels.contains(&"extra".to_string()));
}

#[tokio::test]
async fn simultaneous_streams_collide_and_polite_member_rolls_back() {
    let (net, mut members) = mesh_of(&["amy", "bob"]).await;
    let amy_link = net.connection("amy", "bob").unwrap();
    let bob_link = net.connection("bob", "amy").unwrap();
    let amy = members[0].mesh.clone();
    let bob = members[1].mesh.clone();

    // оба offer'а уходят через rendezvous до того, как пришёл встречный
    let (a, b) = tokio::join!(
        amy.begin_stream(Recipient::user("bob"), MediaStream::new("amy-cam")),
        bob.begin_stream(Recipient::user("amy"), MediaStream::new("bob-cam")),
    );
    a.unwrap();
    b.unwrap();

    let seen = members[0]
        .inbox
        .expect(|s| matches!(s, Seen::StreamBegin { .. }))
        .await;
    assert_eq!(
        seen,
        Seen::StreamBegin {
            from: "bob".into(),
            id: "bob-cam".into(),
        }
    );
    let seen = members[1]
        .inbox
        .expect(|s| matches!(s, Seen::StreamBegin { .. }))
        .await;
    assert_eq!(
        seen,
        Seen::StreamBegin {
            from: "amy".into(),
            id: "amy-cam".into(),
        }
    );

    let amy_view = &amy.peers()[0];
    assert_eq!(amy_view.role, Role::Polite);
    assert_eq!(amy_view.yielded_offers, 1);
    assert_eq!(amy_view.ignored_offers, 0);
    assert_eq!(amy_view.state, LinkState::Open);
    let bob_view = &bob.peers()[0];
    assert_eq!(bob_view.role, Role::Impolite);
    assert_eq!(bob_view.ignored_offers, 1);
    assert_eq!(bob_view.yielded_offers, 0);
    assert_eq!(bob_view.state, LinkState::Open);

    assert_eq!(amy_link.rollbacks(), 1);
    assert_eq!(bob_link.rollbacks(), 0);
    assert!(Arc::ptr_eq(&amy_link, &net.connection("amy", "bob").unwrap()));
    assert!(Arc::ptr_eq(&bob_link, &net.connection("bob", "amy").unwrap()));
    assert_eq!(amy_link.signaling_state(), SignalingState::Stable);
    assert_eq!(bob_link.signaling_state(), SignalingState::Stable);

    amy.send(Recipient::user("bob"), json!("still here"))
        .await
        .unwrap();
    assert_eq!(
        members[1]
            .inbox
            .expect(|s| matches!(s, Seen::Reception { .. }))
            .await,
        Seen::Reception {
            from: "amy".into(),
            message: json!("still here"),
        }
    );
    let controls = net
        .channel_log()
        .into_iter()
        .filter(|r| r.label == CONTROL_LABEL)
        .count();
    assert_eq!(controls, 1);
}
