mod common;

use courier::storage::{Database, MessageQuery};
use courier::types::{AiAnnotation, Category, NewMessage, Priority};

use common::TestContext;

fn new_message(user_id: i64, gmail_id: &str, subject: &str, received_at: i64) -> NewMessage {
    NewMessage {
        user_id,
        gmail_id: gmail_id.to_string(),
        thread_id: format!("t-{gmail_id}"),
        subject: subject.to_string(),
        from_addr: "Alice <alice@example.com>".to_string(),
        to_addrs: "me@example.com".to_string(),
        body: format!("body of {subject}"),
        snippet: subject.to_string(),
        received_at,
        is_read: false,
        annotation: AiAnnotation::default(),
    }
}

async fn seed_messages(ctx: &TestContext, user_id: i64, count: usize) {
    for i in 0..count {
        let msg = new_message(user_id, &format!("m{i}"), &format!("Subject {i}"), 1000 + i as i64);
        ctx.db.insert_message_if_absent(&msg).await.unwrap();
    }
}

#[tokio::test]
async fn insert_if_absent_is_atomic_and_idempotent() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", None).await;

    let msg = new_message(user.id, "m1", "Hello", 1000);
    let (first, created) = ctx.db.insert_message_if_absent(&msg).await.unwrap();
    assert!(created);

    let mut again = new_message(user.id, "m1", "Different subject", 2000);
    again.annotation = AiAnnotation {
        category: Some(Category::Spam),
        ..Default::default()
    };
    let (second, created) = ctx.db.insert_message_if_absent(&again).await.unwrap();
    assert!(!created);
    // the original record is untouched
    assert_eq!(second.id, first.id);
    assert_eq!(second.subject, "Hello");
    assert!(second.ai_category.is_none());
}

#[tokio::test]
async fn last_page_returns_the_remainder() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", None).await;
    seed_messages(&ctx, user.id, 5).await;

    let query = MessageQuery {
        page: 3,
        limit: 2,
        ..Default::default()
    };
    let (items, total) = ctx.db.list_messages(user.id, &query).await.unwrap();
    assert_eq!(total, 5);
    assert_eq!(items.len(), 1);

    // page count arithmetic the list endpoint reports
    let total_pages = (total + 2 - 1) / 2;
    assert_eq!(total_pages, 3);
}

#[tokio::test]
async fn exact_multiple_fills_the_last_page() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", None).await;
    seed_messages(&ctx, user.id, 4).await;

    let query = MessageQuery {
        page: 2,
        limit: 2,
        ..Default::default()
    };
    let (items, total) = ctx.db.list_messages(user.id, &query).await.unwrap();
    assert_eq!(total, 4);
    assert_eq!(items.len(), 2);
    assert_eq!((total + 2 - 1) / 2, 2);
}

#[tokio::test]
async fn list_orders_by_receipt_time_descending() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", None).await;
    seed_messages(&ctx, user.id, 3).await;

    let query = MessageQuery {
        page: 1,
        limit: 10,
        ..Default::default()
    };
    let (items, _) = ctx.db.list_messages(user.id, &query).await.unwrap();
    let times: Vec<i64> = items.iter().map(|m| m.received_at).collect();
    assert_eq!(times, vec![1002, 1001, 1000]);
}

#[tokio::test]
async fn search_matches_subject_sender_and_body_case_insensitively() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", None).await;

    let mut msg = new_message(user.id, "m1", "Invoice overdue", 1000);
    msg.from_addr = "billing@vendor.example".to_string();
    ctx.db.insert_message_if_absent(&msg).await.unwrap();
    ctx.db
        .insert_message_if_absent(&new_message(user.id, "m2", "Picnic", 1001))
        .await
        .unwrap();

    for term in ["INVOICE", "billing@", "body of Invoice"] {
        let query = MessageQuery {
            search: Some(term.to_string()),
            page: 1,
            limit: 10,
            ..Default::default()
        };
        let (items, total) = ctx.db.list_messages(user.id, &query).await.unwrap();
        assert_eq!(total, 1, "term {term:?}");
        assert_eq!(items[0].gmail_id, "m1");
    }
}

#[tokio::test]
async fn category_and_priority_filters_use_equality() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", None).await;

    let mut work = new_message(user.id, "m1", "Roadmap", 1000);
    work.annotation = AiAnnotation {
        category: Some(Category::Work),
        priority: Some(Priority::High),
        ..Default::default()
    };
    ctx.db.insert_message_if_absent(&work).await.unwrap();
    ctx.db
        .insert_message_if_absent(&new_message(user.id, "m2", "Unannotated", 1001))
        .await
        .unwrap();

    let query = MessageQuery {
        category: Some(Category::Work),
        page: 1,
        limit: 10,
        ..Default::default()
    };
    let (items, total) = ctx.db.list_messages(user.id, &query).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(items[0].gmail_id, "m1");

    let query = MessageQuery {
        priority: Some(Priority::Low),
        page: 1,
        limit: 10,
        ..Default::default()
    };
    let (_, total) = ctx.db.list_messages(user.id, &query).await.unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn read_state_toggle_is_idempotent_and_delete_reports_absence() {
    let ctx = TestContext::new().await;
    let user = ctx.seed_user("u1@example.com", None).await;
    let (record, _) = ctx
        .db
        .insert_message_if_absent(&new_message(user.id, "m1", "Hello", 1000))
        .await
        .unwrap();

    let updated = ctx.db.set_read_state(record.id, true).await.unwrap().unwrap();
    assert!(updated.is_read);
    let updated = ctx.db.set_read_state(record.id, true).await.unwrap().unwrap();
    assert!(updated.is_read);

    assert_eq!(ctx.db.unread_count(user.id).await.unwrap(), 0);
    let updated = ctx.db.set_read_state(record.id, false).await.unwrap().unwrap();
    assert!(!updated.is_read);
    assert_eq!(ctx.db.unread_count(user.id).await.unwrap(), 1);

    assert!(ctx.db.delete_message(record.id).await.unwrap());
    assert!(!ctx.db.delete_message(record.id).await.unwrap());
    assert!(ctx.db.set_read_state(record.id, true).await.unwrap().is_none());
}

#[tokio::test]
async fn notification_gate_fires_once_per_id() {
    let db = Database::in_memory().await.unwrap();
    assert!(db.try_mark_notification("n-1").await.unwrap());
    assert!(!db.try_mark_notification("n-1").await.unwrap());
    assert!(db.try_mark_notification("n-2").await.unwrap());
}

#[tokio::test]
async fn find_or_create_keeps_existing_refresh_token() {
    let ctx = TestContext::new().await;
    let user = ctx
        .db
        .find_or_create_user("g-1", "u1@example.com", "tok-1", Some("refresh-1"), None)
        .await
        .unwrap();
    assert_eq!(user.refresh_token.as_deref(), Some("refresh-1"));

    // re-auth without a refresh token keeps the stored one
    let user = ctx
        .db
        .find_or_create_user("g-1", "u1@example.com", "tok-2", None, Some(9999999999))
        .await
        .unwrap();
    assert_eq!(user.access_token, "tok-2");
    assert_eq!(user.refresh_token.as_deref(), Some("refresh-1"));
    assert_eq!(user.token_expiry, Some(9999999999));
}
