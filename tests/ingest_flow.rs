mod common;

use courier::errors::AppError;
use courier::ingest::IngestOutcome;
use courier::storage::MessageQuery;
use courier::types::now_ts;
use std::sync::atomic::Ordering;

use common::{notification, plain_message, TestContext};

#[tokio::test]
async fn notification_ingests_new_messages_and_advances_cursor() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", Some("100")).await;

    ctx.provider.set_history(&["m1", "m2"]);
    ctx.provider.insert_message(plain_message(
        "m1",
        "t1",
        "Standup notes",
        "Alice <alice@example.com>",
        "Notes from today",
        true,
    ));
    ctx.provider.insert_message(plain_message(
        "m2",
        "t2",
        "Lunch?",
        "Bob <bob@example.com>",
        "Are you free at noon?",
        true,
    ));

    let report = ctx
        .engine
        .handle_notification(&notification("u1@example.com", "105"))
        .await
        .expect("notification cycle");

    assert_eq!(report.fetched, 2);
    assert_eq!(report.ingested, 2);
    assert_eq!(report.duplicates, 0);
    assert!(!report.resynced);

    let user = ctx.db.find_user(user.id).await.unwrap().unwrap();
    assert_eq!(user.history_id.as_deref(), Some("105"));

    let (items, total) = ctx
        .db
        .list_messages(
            user.id,
            &MessageQuery {
                is_read: Some(false),
                page: 1,
                limit: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(total, 2);
    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn duplicate_notification_is_a_no_op() {
    let ctx = TestContext::new().await;
    ctx.seed_user("u1@example.com", Some("100")).await;

    let report = ctx
        .engine
        .handle_notification(&notification("u1@example.com", "100"))
        .await
        .expect("duplicate notification");

    assert_eq!(report.fetched, 0);
    assert_eq!(report.ingested, 0);
    assert_eq!(ctx.provider.history_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_ingest_of_same_id_is_a_read_not_a_write() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", Some("100")).await;
    ctx.provider.insert_message(plain_message(
        "m1",
        "t1",
        "Hello",
        "Alice <alice@example.com>",
        "hi",
        true,
    ));

    let first = ctx
        .engine
        .ingest_message(&user, "token-1", "m1")
        .await
        .unwrap();
    let second = ctx
        .engine
        .ingest_message(&user, "token-1", "m1")
        .await
        .unwrap();

    assert_eq!(first, IngestOutcome::Created);
    assert_eq!(second, IngestOutcome::Existing);
    // dedup short-circuits before the provider and the analyzer
    assert_eq!(ctx.provider.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.analyzer.analyze_calls.load(Ordering::SeqCst), 1);

    let (_, total) = ctx
        .db
        .list_messages(
            user.id,
            &MessageQuery {
                page: 1,
                limit: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn analyzer_outage_stores_fallback_annotation() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", Some("100")).await;
    ctx.analyzer.set_failing(true);
    ctx.provider.insert_message(plain_message(
        "m1",
        "t1",
        "Hello",
        "Alice <alice@example.com>",
        "hi",
        true,
    ));

    ctx.engine
        .ingest_message(&user, "token-1", "m1")
        .await
        .unwrap();

    let record = ctx
        .db
        .get_message_by_gmail_id("m1")
        .await
        .unwrap()
        .expect("record persisted despite outage");
    assert!(record.ai_summary.is_none());
    assert!(record.ai_category.is_none());
    assert!(record.ai_priority.is_none());
    assert!(record.ai_sentiment.is_none());
    assert!(record.ai_analyzed_at.is_none());
    assert!(record.ai_action_items.is_empty());
    assert_eq!(record.ai_suggested_replies, courier::ai::default_replies());
    assert_eq!(record.ai_suggested_replies.len(), 3);
}

#[tokio::test]
async fn expired_cursor_triggers_resync_and_rebaselines() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", Some("100")).await;
    ctx.provider.expire_cursor(true);
    ctx.provider.set_recent(&["m9"]);
    ctx.provider.set_profile_history_id("200");
    ctx.provider.insert_message(plain_message(
        "m9",
        "t9",
        "Recent",
        "Carol <carol@example.com>",
        "latest mail",
        true,
    ));

    let report = ctx
        .engine
        .handle_notification(&notification("u1@example.com", "105"))
        .await
        .expect("resync cycle");

    assert!(report.resynced);
    assert_eq!(report.ingested, 1);

    let user = ctx.db.find_user(user.id).await.unwrap().unwrap();
    // re-baselined from the live mailbox position, not the stale notification
    assert_eq!(user.history_id.as_deref(), Some("200"));
}

#[tokio::test]
async fn partial_failure_retains_cursor_until_batch_succeeds() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", Some("100")).await;
    ctx.provider.set_history(&["m1", "m2"]);
    ctx.provider.insert_message(plain_message(
        "m1",
        "t1",
        "First",
        "Alice <alice@example.com>",
        "one",
        true,
    ));
    ctx.provider.insert_message(plain_message(
        "m2",
        "t2",
        "Second",
        "Bob <bob@example.com>",
        "two",
        true,
    ));
    ctx.provider.fail_next_fetch("m2");

    let err = ctx
        .engine
        .handle_notification(&notification("u1@example.com", "105"))
        .await
        .expect_err("batch should fail on the injected error");
    assert!(matches!(err, AppError::ProviderTransient(_)));

    let reloaded = ctx.db.find_user(user.id).await.unwrap().unwrap();
    assert_eq!(reloaded.history_id.as_deref(), Some("100"));

    // the retry re-walks the same range: m1 dedups, m2 ingests, cursor commits
    let report = ctx
        .engine
        .handle_notification(&notification("u1@example.com", "105"))
        .await
        .expect("retry cycle");
    assert_eq!(report.ingested, 1);
    assert_eq!(report.duplicates, 1);

    let reloaded = ctx.db.find_user(user.id).await.unwrap().unwrap();
    assert_eq!(reloaded.history_id.as_deref(), Some("105"));
}

#[tokio::test]
async fn unknown_account_is_user_not_found() {
    let ctx = TestContext::new().await;
    let err = ctx
        .engine
        .handle_notification(&notification("nobody@example.com", "105"))
        .await
        .expect_err("no such user");
    assert!(matches!(err, AppError::UserNotFound));
}

#[tokio::test]
async fn missing_baseline_adopts_notification_cursor_without_fetching() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", None).await;

    let report = ctx
        .engine
        .handle_notification(&notification("u1@example.com", "105"))
        .await
        .expect("baseline adoption");

    assert_eq!(report.fetched, 0);
    assert_eq!(ctx.provider.history_calls.load(Ordering::SeqCst), 0);

    let user = ctx.db.find_user(user.id).await.unwrap().unwrap();
    assert_eq!(user.history_id.as_deref(), Some("105"));
}

#[tokio::test]
async fn watch_registration_records_expiration_and_baseline() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", None).await;

    let info = ctx
        .engine
        .register_watch(&user, "projects/p/topics/t")
        .await
        .expect("watch registration");
    assert!(info.expiration.unwrap() > now_ts() * 1000);

    let user = ctx.db.find_user(user.id).await.unwrap().unwrap();
    assert!(user.watch_expiration.is_some());
    // watch response seeds the cursor only when none was stored
    assert_eq!(user.history_id.as_deref(), Some("1"));
}
