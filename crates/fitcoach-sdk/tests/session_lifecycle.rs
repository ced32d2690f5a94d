mod common;

use std::time::Duration;

use common::*;
use fitcoach_sdk::{CurrentUser, FitcoachSDK, FitcoachSDKError, ReadMarkCache, Role, ViewContext};

#[tokio::test]
async fn read_marks_survive_sdk_restart() {
    let Harness { dir, backend, sdk } = Harness::new().await;
    let ids: Vec<u64> = (0..2)
        .map(|i| backend.send_message(WANG, COACH, format!("day {} done", i)).id)
        .collect();

    let session = sdk.sign_in(coach()).await.unwrap();
    session.open_conversation(WANG).await.unwrap();
    assert_eq!(backend.mark_read_calls(), vec![ids.clone()]);

    sdk.shutdown().await.unwrap();
    drop(session);
    drop(sdk);

    // 新后端还没同步到已读状态
    let lagging = common::backend();
    for id in &ids {
        let mut stale = backend.message(*id).unwrap();
        stale.read_at = None;
        lagging.insert_message(stale);
    }

    let sdk = FitcoachSDK::initialize(config(&dir), lagging.clone(), lagging.clone())
        .await
        .unwrap();
    let session = sdk.sign_in(coach()).await.unwrap();
    assert_eq!(session.unread_count(WANG), Some(0));

    session.open_conversation(WANG).await.unwrap();
    assert!(lagging.mark_read_calls().is_empty());
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn switching_users_keeps_the_previous_cache() {
    let h = Harness::new().await;
    let ids = h.send_from(WANG, 2);
    let session = h.sign_in().await;
    session.open_conversation(WANG).await.unwrap();

    let student = h.sdk.sign_in(CurrentUser::new(WANG, "Wang Fang", Role::Student)).await.unwrap();
    assert!(!session.is_active());
    assert_eq!(student.contacts().len(), 1);
    assert_eq!(student.contact(COACH).unwrap().name, "Coach Li");

    let cache = ReadMarkCache::open(&h.sdk.kv_store(), COACH).await.unwrap();
    assert_eq!(cache.len(), ids.len());
}

#[tokio::test]
async fn sign_out_clears_cache_and_stops_the_session() {
    let h = Harness::new().await;
    h.send_from(WANG, 2);
    let session = h.sign_in().await;
    session.open_conversation(WANG).await.unwrap();
    assert_eq!(session.read_marks().len(), 2);
    assert!(wait_until(|| h.backend.subscriber_count() == 1).await);

    h.sdk.sign_out().await.unwrap();

    assert!(!session.is_active());
    assert_eq!(session.view(), ViewContext::Hidden);
    assert!(session.contacts().is_empty());
    assert!(wait_until(|| h.backend.subscriber_count() == 0).await);

    let cache = ReadMarkCache::open(&h.sdk.kv_store(), COACH).await.unwrap();
    assert_eq!(cache.len(), 0);

    let err = session.open_conversation(WANG).await.unwrap_err();
    assert!(matches!(err, FitcoachSDKError::ShuttingDown(_)));
    assert!(h.sdk.session().await.is_err());
}

#[tokio::test]
async fn focus_refresh_picks_up_messages_missed_while_blurred() {
    let h = Harness::new().await;
    let session = h.sign_in().await;
    assert_eq!(session.total_unread(), 0);

    h.sdk.on_app_background().await.unwrap();
    h.backend.drop_subscriptions();
    h.send_from(ZHAO, 2);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.unread_count(ZHAO), Some(0));

    h.sdk.on_app_foreground().await.unwrap();
    session.wait_focus_refresh().await;
    assert_eq!(session.unread_count(ZHAO), Some(2));
}

#[tokio::test]
async fn blur_before_settle_cancels_the_focus_refresh() {
    let h = Harness::new().await;
    let session = h.sign_in().await;
    h.backend.drop_subscriptions();
    h.send_from(ZHAO, 1);

    session.on_focus().await.unwrap();
    session.on_blur().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // 刷新被取消，漏掉的消息还没出现
    assert_eq!(session.unread_count(ZHAO), Some(0));

    session.on_focus().await.unwrap();
    session.wait_focus_refresh().await;
    assert_eq!(session.unread_count(ZHAO), Some(1));
}

#[tokio::test]
async fn session_start_fails_when_profiles_cannot_load() {
    let h = Harness::new().await;
    h.backend.set_offline(true);

    let err = h.sdk.sign_in(coach()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(h.sdk.session().await.is_err());
    assert!(wait_until(|| h.backend.subscriber_count() == 0).await);
}

#[tokio::test]
async fn one_failing_summary_degrades_only_that_contact() {
    let h = Harness::new().await;
    h.send_from(WANG, 2);
    h.send_from(ZHAO, 1);
    h.backend.fail_summary_for(ZHAO, true);

    let session = h.sign_in().await;
    assert_eq!(session.contacts().len(), 3);
    assert_eq!(session.unread_count(WANG), Some(2));
    assert_eq!(session.unread_count(ZHAO), Some(0));
    assert_eq!(session.contact(ZHAO).unwrap().last_message, None);

    h.backend.fail_summary_for(ZHAO, false);
    session.refresh().await.unwrap();
    assert_eq!(session.unread_count(ZHAO), Some(1));
}
