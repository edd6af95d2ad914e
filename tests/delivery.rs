mod common;

use common::{recv, recv_kind, send, try_recv, Fleet};
use imcore::net::wire::{
    AckStatus, BatchMsgIdsReq, BatchMsgIdsResp, C2cAckReq, C2cMsgPush, C2cSendReq, GroupMsgPush,
    GroupSendAck, GroupSendReq, MsgType, WithdrawMsgReq, WithdrawNotification, WithdrawResponse,
};
use imcore::net::wire::code;
use std::time::Duration;

fn text(client_msg_id: &str, to: &str, content: &str) -> C2cSendReq {
    C2cSendReq {
        client_msg_id: client_msg_id.into(),
        to: to.into(),
        content: content.into(),
        ..Default::default()
    }
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn direct_message_crosses_servers_and_ack_stops_retry() {
    let mut fleet = Fleet::new();
    let s1 = fleet.start_named("s1").await;
    let s2 = fleet.start_named("s2").await;
    let mut alice = fleet.connect(s1, "alice").await;
    let mut bob = fleet.connect(s2, "bob").await;

    send(&mut alice, MsgType::C2cSend, &text("c-1", "bob", "hello bob")).await;

    let ack: C2cAckReq = recv_kind(&mut alice, MsgType::C2cAck)
        .await
        .payload_as()
        .unwrap();
    assert_eq!(ack.ack_status(), Some(AckStatus::ServerReceived));
    assert_eq!(ack.client_msg_id, "c-1");
    assert_ne!(ack.msg_id, 0);

    let push: C2cMsgPush = recv_kind(&mut bob, MsgType::C2cMsgPush)
        .await
        .payload_as()
        .unwrap();
    assert_eq!(push.msg_id, ack.msg_id);
    assert_eq!(push.from, "alice");
    assert_eq!(push.content, "hello bob");
    assert_eq!(push.retry_count, 0);

    let retry = fleet.servers[s2].handle().retry().clone();
    assert_eq!(retry.pending().await.unwrap(), 1);

    send(
        &mut bob,
        MsgType::C2cAck,
        &C2cAckReq {
            msg_id: push.msg_id,
            client_msg_id: push.client_msg_id.clone(),
            to: "alice".into(),
            status: AckStatus::Read as i32,
            ..Default::default()
        },
    )
    .await;

    let relayed: C2cAckReq = recv_kind(&mut alice, MsgType::C2cAck)
        .await
        .payload_as()
        .unwrap();
    assert_eq!(relayed.msg_id, push.msg_id);
    assert_eq!(relayed.from, "bob");
    assert_eq!(relayed.ack_status(), Some(AckStatus::Read));
    wait_for(|| {
        let retry = retry.clone();
        async move { retry.pending().await.unwrap() == 0 }
    })
    .await;

    let entry = fleet.history.get(push.msg_id).unwrap();
    assert_eq!(entry.status, Some(AckStatus::Read));
    fleet.shutdown().await;
}

#[tokio::test]
async fn offline_recipient_gets_message_on_connect() {
    let mut fleet = Fleet::new();
    let s1 = fleet.start_named("s1").await;
    let s2 = fleet.start_named("s2").await;
    let mut alice = fleet.connect(s1, "alice").await;

    send(&mut alice, MsgType::C2cSend, &text("c-1", "carol", "are you there")).await;
    let received: C2cAckReq = recv(&mut alice).await.payload_as().unwrap();
    assert_eq!(received.ack_status(), Some(AckStatus::ServerReceived));
    let unread: C2cAckReq = recv(&mut alice).await.payload_as().unwrap();
    assert_eq!(unread.ack_status(), Some(AckStatus::OfflineUnread));
    assert_eq!(fleet.offline.message_count("carol"), 1);

    let mut carol = fleet.connect(s2, "carol").await;
    let push: C2cMsgPush = recv_kind(&mut carol, MsgType::C2cMsgPush)
        .await
        .payload_as()
        .unwrap();
    assert_eq!(push.msg_id, received.msg_id);
    assert_eq!(push.content, "are you there");
    let offline = fleet.offline.clone();
    wait_for(|| {
        let offline = offline.clone();
        async move { offline.message_count("carol") == 0 }
    })
    .await;
    fleet.shutdown().await;
}

#[tokio::test]
async fn invalid_send_is_rejected_with_param_error() {
    let mut fleet = Fleet::new();
    let s1 = fleet.start_named("s1").await;
    let mut alice = fleet.connect(s1, "alice").await;

    send(&mut alice, MsgType::C2cSend, &text("c-1", "bob", "")).await;
    let response = recv(&mut alice).await;
    assert_eq!(response.kind(), MsgType::C2cSend);
    assert_eq!(response.code, code::PARAM_ERROR);

    send(
        &mut alice,
        MsgType::FriendRequest,
        &C2cSendReq::default(),
    )
    .await;
    let response = recv(&mut alice).await;
    assert_eq!(response.code, code::FORBIDDEN);
    fleet.shutdown().await;
}

#[tokio::test]
async fn withdraw_notifies_recipient_within_window() {
    let mut fleet = Fleet::new();
    let s1 = fleet.start_named("s1").await;
    let s2 = fleet.start_named("s2").await;
    let mut alice = fleet.connect(s1, "alice").await;
    let mut bob = fleet.connect(s2, "bob").await;

    send(&mut alice, MsgType::C2cSend, &text("c-1", "bob", "oops")).await;
    let push: C2cMsgPush = recv_kind(&mut bob, MsgType::C2cMsgPush)
        .await
        .payload_as()
        .unwrap();

    fleet.clock.advance(Duration::from_secs(30));
    send(
        &mut alice,
        MsgType::WithdrawMsgSend,
        &WithdrawMsgReq {
            msg_id: push.msg_id,
            client_msg_id: push.client_msg_id.clone(),
            to: "bob".into(),
            msg_time: push.time,
            ..Default::default()
        },
    )
    .await;
    let response: WithdrawResponse = recv_kind(&mut alice, MsgType::WithdrawMsgResponse)
        .await
        .payload_as()
        .unwrap();
    assert!(response.success);
    let notice: WithdrawNotification = recv_kind(&mut bob, MsgType::MsgWithdrawNotification)
        .await
        .payload_as()
        .unwrap();
    assert_eq!(notice.msg_id, push.msg_id);
    assert_eq!(notice.from, "alice");

    fleet.clock.advance(Duration::from_secs(600));
    send(
        &mut alice,
        MsgType::WithdrawMsgSend,
        &WithdrawMsgReq {
            msg_id: push.msg_id,
            client_msg_id: push.client_msg_id,
            to: "bob".into(),
            msg_time: push.time,
            ..Default::default()
        },
    )
    .await;
    let late: WithdrawResponse = recv_kind(&mut alice, MsgType::WithdrawMsgResponse)
        .await
        .payload_as()
        .unwrap();
    assert!(!late.success);
    fleet.shutdown().await;
}

#[tokio::test]
async fn group_message_reaches_members_on_every_server() {
    let mut fleet = Fleet::new();
    for user in ["alice", "bob", "carol"] {
        fleet.membership.set_groups(user, ["g1"]);
    }
    fleet.membership.set_groups("dave", ["g2"]);
    let s1 = fleet.start_named("s1").await;
    let s2 = fleet.start_named("s2").await;
    let mut alice = fleet.connect(s1, "alice").await;
    let mut bob = fleet.connect(s1, "bob").await;
    let mut carol = fleet.connect(s2, "carol").await;
    let mut dave = fleet.connect(s2, "dave").await;

    for (server, member) in [(s1, "bob"), (s2, "carol")] {
        let shards = fleet.servers[server].handle().shards().clone();
        wait_for(|| {
            let shards = shards.clone();
            async move {
                shards
                    .local_members_of("g1")
                    .await
                    .map(|members| members.iter().any(|m| m == member))
                    .unwrap_or(false)
            }
        })
        .await;
    }
    let shards = fleet.servers[s1].handle().shards().clone();
    wait_for(|| {
        let shards = shards.clone();
        async move {
            shards
                .local_members_of("g1")
                .await
                .map(|members| members.iter().any(|m| m == "alice"))
                .unwrap_or(false)
        }
    })
    .await;

    send(
        &mut alice,
        MsgType::GroupSend,
        &GroupSendReq {
            client_msg_id: "g-1".into(),
            group_id: "g1".into(),
            content: "hi all".into(),
            ..Default::default()
        },
    )
    .await;
    let ack: GroupSendAck = recv_kind(&mut alice, MsgType::GroupSend)
        .await
        .payload_as()
        .unwrap();

    for member in [&mut bob, &mut carol] {
        let push: GroupMsgPush = recv_kind(member, MsgType::GroupMsgPush)
            .await
            .payload_as()
            .unwrap();
        assert_eq!(push.msg_id, ack.msg_id);
        assert_eq!(push.from, "alice");
    }
    assert!(try_recv(&mut dave, Duration::from_millis(200)).await.is_none());
    assert!(try_recv(&mut alice, Duration::from_millis(200)).await.is_none());
    fleet.shutdown().await;
}

#[tokio::test]
async fn batch_ids_are_unique_and_ordered() {
    let mut fleet = Fleet::new();
    let s1 = fleet.start_named("s1").await;
    let mut alice = fleet.connect(s1, "alice").await;

    send(&mut alice, MsgType::GetBatchMsgIds, &BatchMsgIdsReq { count: 50 }).await;
    let batch: BatchMsgIdsResp = recv_kind(&mut alice, MsgType::PushBatchMsgIds)
        .await
        .payload_as()
        .unwrap();
    assert_eq!(batch.msg_ids.len(), 50);
    assert!(batch.msg_ids.windows(2).all(|w| w[0] < w[1]));
    fleet.shutdown().await;
}
