//! Integration tests for sub-rooms opened on messages.

mod common;

use common::{start_test_server, TestServer};
use serde_json::{json, Value};

async fn group(server: &TestServer, token: &str, participants: Value) -> String {
    let (status, body) = server
        .post(token, "/api/conversations", json!({"type": "group", "title": "Parent", "participants": participants}))
        .await;
    assert_eq!(status, 201, "{}", body);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_open_thread_creates_child_room() {
    let server = start_test_server(None).await;
    let t1 = server.seed_user(1, None, false, false);
    let t2 = server.seed_user(2, Some("+237600000002"), false, false);
    let t3 = server.seed_user(3, None, false, false);
    let parent = group(&server, &t1, json!(["+237600000002"])).await;

    let (status, link) = server
        .post(
            &t2,
            "/api/threads",
            json!({"parent_conversation": parent, "parent_message_key": "msg-1", "title": "Side chat"}),
        )
        .await;
    assert_eq!(status, 201, "{}", link);
    assert_eq!(link["depth"], 1);
    assert!(link["parent_thread"].is_null());
    assert_eq!(link["created_by"], 2);

    let child = link["child_conversation"].as_str().unwrap();
    let (status, detail) = server.get(&t2, &format!("/api/conversations/{}", child)).await;
    assert_eq!(status, 200);
    assert_eq!(detail["type"], "thread");
    assert_eq!(detail["title"], "Side chat");

    // Same message again returns the existing link
    let (status, again) = server
        .post(&t1, "/api/threads", json!({"parent_conversation": parent, "parent_message_key": "msg-1"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(again["id"], link["id"]);

    let (status, listed) = server.get(&t1, &format!("/api/conversations/{}/threads", parent)).await;
    assert_eq!(status, 200);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let link_path = format!("/api/threads/{}", link["id"]);
    let (status, fetched) = server.get(&t1, &link_path).await;
    assert_eq!(status, 200);
    assert_eq!(fetched["parent_message_key"], "msg-1");

    // Outsiders see nothing
    let (status, _) = server.get(&t3, &link_path).await;
    assert_eq!(status, 403);
    let (status, _) = server
        .post(&t3, "/api/threads", json!({"parent_conversation": parent, "parent_message_key": "msg-2"}))
        .await;
    assert_eq!(status, 403);
    let (status, _) = server.get(&t1, "/api/threads/999").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_nested_threads_respect_depth_limit() {
    let server = start_test_server(None).await;
    let t1 = server.seed_user(1, None, false, false);
    let root = group(&server, &t1, json!([])).await;

    server
        .patch(&t1, &format!("/api/conversations/{}/settings", root), json!({"max_subroom_depth": 2}))
        .await;

    let (_, first) = server
        .post(&t1, "/api/threads", json!({"parent_conversation": root, "parent_message_key": "a"}))
        .await;
    let first_child = first["child_conversation"].as_str().unwrap().to_string();

    // Depth is checked against the parent room's own setting
    server
        .patch(&t1, &format!("/api/conversations/{}/settings", first_child), json!({"max_subroom_depth": 2}))
        .await;
    let (status, second) = server
        .post(&t1, "/api/threads", json!({"parent_conversation": first_child, "parent_message_key": "b"}))
        .await;
    assert_eq!(status, 201, "{}", second);
    assert_eq!(second["depth"], 2);
    assert_eq!(second["parent_thread"], first["id"]);

    let second_child = second["child_conversation"].as_str().unwrap().to_string();
    server
        .patch(&t1, &format!("/api/conversations/{}/settings", second_child), json!({"max_subroom_depth": 2}))
        .await;
    let (status, _) = server
        .post(&t1, "/api/threads", json!({"parent_conversation": second_child, "parent_message_key": "c"}))
        .await;
    assert_eq!(status, 400);

    // parent_thread must be the link that created the parent room
    let (status, _) = server
        .post(
            &t1,
            "/api/threads",
            json!({"parent_conversation": first_child, "parent_message_key": "d", "parent_thread": second["id"]}),
        )
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_attach_existing_conversation_and_policy() {
    let server = start_test_server(None).await;
    let t1 = server.seed_user(1, None, false, false);
    let t2 = server.seed_user(2, Some("+237600000002"), false, false);
    let parent = group(&server, &t1, json!(["+237600000002"])).await;
    let side = group(&server, &t1, json!([])).await;

    let (status, link) = server
        .post(
            &t1,
            "/api/threads",
            json!({"parent_conversation": parent, "parent_message_key": "m1", "child_conversation": side}),
        )
        .await;
    assert_eq!(status, 201, "{}", link);
    assert_eq!(link["child_conversation"], side.as_str());

    // A room can only be one thread
    let (status, _) = server
        .post(
            &t1,
            "/api/threads",
            json!({"parent_conversation": parent, "parent_message_key": "m2", "child_conversation": side}),
        )
        .await;
    assert_eq!(status, 400);
    let (status, _) = server
        .post(
            &t1,
            "/api/threads",
            json!({"parent_conversation": parent, "parent_message_key": "m3", "child_conversation": parent}),
        )
        .await;
    assert_eq!(status, 400);

    // admins_only sub-rooms need chat.create_subroom
    server
        .patch(&t1, &format!("/api/conversations/{}/settings", parent), json!({"subroom_policy": "admins_only"}))
        .await;
    let (status, _) = server
        .post(&t2, "/api/threads", json!({"parent_conversation": parent, "parent_message_key": "m4"}))
        .await;
    assert_eq!(status, 403);
    let (status, _) = server
        .post(&t1, "/api/threads", json!({"parent_conversation": parent, "parent_message_key": "m4"}))
        .await;
    assert_eq!(status, 201);

    let (status, _) = server
        .post(&t1, "/api/threads", json!({"parent_conversation": parent, "parent_message_key": "  "}))
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_attach_rejects_cycles_and_subtrees() {
    let server = start_test_server(None).await;
    let t1 = server.seed_user(1, None, false, false);
    let a = group(&server, &t1, json!([])).await;
    let b = group(&server, &t1, json!([])).await;

    let (status, _) = server
        .post(&t1, "/api/threads", json!({"parent_conversation": a, "parent_message_key": "m1", "child_conversation": b}))
        .await;
    assert_eq!(status, 201);

    // a is already above b
    let (status, _) = server
        .post(&t1, "/api/threads", json!({"parent_conversation": b, "parent_message_key": "m1", "child_conversation": a}))
        .await;
    assert_eq!(status, 400);

    // x already has a thread, so attaching it would leave y's depth stale
    let x = group(&server, &t1, json!([])).await;
    let (status, _) = server
        .post(&t1, "/api/threads", json!({"parent_conversation": x, "parent_message_key": "y"}))
        .await;
    assert_eq!(status, 201);
    let (status, _) = server
        .post(&t1, "/api/threads", json!({"parent_conversation": b, "parent_message_key": "m2", "child_conversation": x}))
        .await;
    assert_eq!(status, 400);

    let (_, listed) = server.get(&t1, &format!("/api/conversations/{}/threads", b)).await;
    assert!(listed.as_array().unwrap().is_empty());
}
