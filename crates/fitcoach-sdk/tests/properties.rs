mod common;

use std::time::Duration;

use common::*;
use fitcoach_sdk::{BackendGateway, ChangeEvent};

/// 等待此前推送的事件全部被处理：发一条哨兵消息并等它出现
async fn settle(h: &Harness, session: &fitcoach_sdk::InboxSession) {
    let sentinel = h.backend.send_message(CHEN, COACH, "sentinel");
    assert!(wait_until(|| session.store().message(sentinel.id).is_some()).await);
}

#[tokio::test]
async fn concurrent_opens_of_the_same_contact_send_one_command() {
    let h = Harness::new().await;
    let ids = h.send_from(WANG, 4);
    let session = h.sign_in().await;

    h.backend.set_mark_read_delay(Some(Duration::from_millis(50)));
    let (first, second) = tokio::join!(
        session.open_conversation(WANG),
        session.open_conversation(WANG)
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(h.backend.mark_read_calls(), vec![ids]);
    assert_eq!(session.unread_count(WANG), Some(0));
    assert_eq!(session.batcher_stats().commands_sent, 1);
}

#[tokio::test]
async fn read_at_never_goes_back_to_unread() {
    let h = Harness::new().await;
    let ids = h.send_from(WANG, 1);
    let session = h.sign_in().await;
    session.open_conversation(WANG).await.unwrap();
    session.close_conversation();

    let mut stale = h.backend.message(ids[0]).unwrap();
    assert!(stale.read_at.is_some());
    stale.read_at = None;
    h.backend.publish(ChangeEvent::update(stale.clone()));
    h.backend.publish(ChangeEvent::insert(stale));
    settle(&h, &session).await;

    assert!(session.store().message(ids[0]).unwrap().read_at.is_some());
    assert_eq!(session.unread_count(WANG), Some(0));
}

#[tokio::test]
async fn unread_count_is_never_negative() {
    let h = Harness::new().await;
    h.send_from(WANG, 2);
    let session = h.sign_in().await;

    assert_eq!(session.store().set_unread_count(WANG, -5), Some(0));
    assert_eq!(session.unread_count(WANG), Some(0));
    assert_eq!(session.store().set_unread_count(99, 3), None);
}

#[tokio::test]
async fn late_updates_after_optimistic_zero_do_not_eat_new_arrivals() {
    let h = Harness::new().await;
    let old = h.send_from(WANG, 2);
    let session = h.sign_in().await;

    // 乐观清零后收到一条新消息
    session.store().set_unread_count(WANG, 0);
    let fresh = h.backend.send_message(WANG, COACH, "one more set?");
    assert!(wait_until(|| session.unread_count(WANG) == Some(1)).await);

    // 旧消息的已读确认姗姗来迟
    h.backend.mark_read(COACH, &old).await.unwrap();
    settle(&h, &session).await;

    assert_eq!(session.unread_count(WANG), Some(1));
    assert_eq!(session.store().unread_message_ids(WANG), vec![fresh.id]);
}

#[tokio::test]
async fn duplicate_and_reordered_events_converge_after_refresh() {
    let h = Harness::new().await;
    let wang = h.send_from(WANG, 3);
    let zhao = h.send_from(ZHAO, 2);
    let session = h.sign_in().await;

    // 重复插入
    for id in wang.iter().chain(zhao.iter()) {
        h.backend.publish(ChangeEvent::insert(h.backend.message(*id).unwrap()));
    }

    // 先到的更新，对应的插入还没来
    let early = message(900, ZHAO, COACH, fitcoach_sdk::utils::now_utc_millis(), Some(5));
    h.backend.publish(ChangeEvent::update(early.clone()));
    h.backend.insert_message(early.clone());
    h.backend.publish(ChangeEvent::insert(early));

    // 本地操作与其他端的已读混在一起
    session.open_conversation(WANG).await.unwrap();
    session.close_conversation();
    h.backend.mark_read(COACH, &zhao[..1]).await.unwrap();
    h.send_from(WANG, 1);
    h.send_from(CHEN, 2);

    settle(&h, &session).await;
    session.refresh().await.unwrap();

    for contact in session.contacts() {
        assert_eq!(
            contact.unread_count as usize,
            h.backend.unread_count_for(COACH, contact.id),
            "contact {} diverged",
            contact.id
        );
    }
    assert_eq!(session.unread_count(WANG), Some(1));
    assert_eq!(session.unread_count(ZHAO), Some(1));
}

#[tokio::test]
async fn insert_during_initial_load_is_counted_once() {
    let backend = backend();
    let gateway = LateArrivalGateway::new(backend.clone());
    gateway.arm(WANG);
    let h = Harness::with_gateway(backend, gateway.clone()).await;

    let session = h.sign_in().await;
    assert!(!gateway.is_armed());
    assert!(wait_until(|| session.unread_count(WANG) == Some(1)).await);

    settle(&h, &session).await;
    assert_eq!(session.unread_count(WANG), Some(1));
    assert_eq!(h.backend.unread_count_for(COACH, WANG), 1);
}

#[tokio::test]
async fn insert_during_refresh_survives_the_older_summary() {
    let backend = backend();
    let gateway = LateArrivalGateway::new(backend.clone());
    let h = Harness::with_gateway(backend, gateway.clone()).await;
    h.send_from(WANG, 1);
    let session = h.sign_in().await;
    assert_eq!(session.unread_count(WANG), Some(1));

    gateway.arm(WANG);
    session.refresh().await.unwrap();
    assert!(!gateway.is_armed());

    settle(&h, &session).await;
    assert_eq!(h.backend.unread_count_for(COACH, WANG), 2);
    assert_eq!(session.unread_count(WANG), Some(2));
    assert_eq!(session.contact(WANG).unwrap().last_message.as_deref(), Some("sent while loading"));

    session.refresh().await.unwrap();
    assert_eq!(session.unread_count(WANG), Some(2));
}
