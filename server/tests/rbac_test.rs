//! Integration tests for the permission catalog, roles, assignments, ACEs
//! and the authorization check endpoints.

mod common;

use common::{start_test_server, TestServer, INTERNAL_TOKEN};
use serde_json::{json, Value};

async fn create_role(server: &TestServer, staff: &str, body: Value) -> Value {
    let (status, role) = server.post(staff, "/api/roles", body).await;
    assert_eq!(status, 201, "role creation failed: {}", role);
    role
}

async fn create_group_conversation(server: &TestServer, token: &str, participants: Value) -> String {
    let (status, body) = server
        .post(token, "/api/conversations", json!({"type": "group", "title": "Room", "participants": participants}))
        .await;
    assert_eq!(status, 201, "{}", body);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_rbac_admin_requires_staff() {
    let server = start_test_server(None).await;
    let user = server.seed_user(1, None, false, false);

    let (status, _) = server.post(&user, "/api/roles", json!({"name": "Mod"})).await;
    assert_eq!(status, 403);
    let (status, _) = server.get(&user, "/api/aces").await;
    assert_eq!(status, 403);
    let (status, _) = server.post(&user, "/api/permissions", json!({"code": "chat.kick"})).await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_permission_catalog() {
    let server = start_test_server(None).await;
    let staff = server.seed_user(9, None, true, false);

    let (status, listed) = server.get(&staff, "/api/permissions").await;
    assert_eq!(status, 200);
    let codes: Vec<&str> = listed["permissions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["code"].as_str().unwrap())
        .collect();
    assert!(codes.contains(&"chat.send_message"));
    assert!(codes.contains(&"chat.manage_roles"));

    let (status, created) = server
        .post(&staff, "/api/permissions", json!({"code": "events.create", "description": "Create events"}))
        .await;
    assert_eq!(status, 201);
    assert_eq!(created["category"], "events");
    let (status, _) = server.post(&staff, "/api/permissions", json!({"code": "events.create"})).await;
    assert_eq!(status, 400);
    let (status, _) = server.post(&staff, "/api/permissions", json!({"code": "not a code"})).await;
    assert_eq!(status, 400);

    create_role(&server, &staff, json!({"name": "Planner", "permissions": ["events.create"]})).await;
    assert_eq!(server.delete(&staff, "/api/permissions/events.create").await, 400);
    assert_eq!(server.delete(&staff, "/api/permissions/events.unknown").await, 404);
}

#[tokio::test]
async fn test_role_inheritance_and_cycles() {
    let server = start_test_server(None).await;
    let staff = server.seed_user(9, None, true, false);

    let base = create_role(&server, &staff, json!({"name": "Base", "permissions": ["chat.pin_message"]})).await;
    let base_id = base["id"].as_str().unwrap();
    let child = create_role(
        &server,
        &staff,
        json!({"name": "Child", "parent_role": base_id, "permissions": ["chat.archive"]}),
    )
    .await;
    let child_id = child["id"].as_str().unwrap();

    let effective: Vec<&str> = child["effective_permissions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p.as_str().unwrap())
        .collect();
    assert!(effective.contains(&"chat.pin_message"));
    assert!(effective.contains(&"chat.archive"));
    assert_eq!(child["permissions"], json!(["chat.archive"]));

    // Base -> Child would close a loop
    let (status, _) = server
        .put(&staff, &format!("/api/roles/{}", base_id), json!({"parent_role": child_id}))
        .await;
    assert_eq!(status, 400);
    let (status, _) = server
        .put(&staff, &format!("/api/roles/{}", base_id), json!({"parent_role": base_id}))
        .await;
    assert_eq!(status, 400);

    // Same name in the same scope is rejected, another scope is fine
    let (status, _) = server.post(&staff, "/api/roles", json!({"name": "Base"})).await;
    assert_eq!(status, 400);
    let (status, _) = server.post(&staff, "/api/roles", json!({"name": "Base", "scope": "GROUP"})).await;
    assert_eq!(status, 201);

    // Adding to the parent shows up in the child
    let (status, _) = server
        .post(&staff, &format!("/api/roles/{}/permissions", base_id), json!({"permissions": ["chat.edit_info"]}))
        .await;
    assert_eq!(status, 200);
    let (_, child) = server.get(&staff, &format!("/api/roles/{}", child_id)).await;
    assert!(child["effective_permissions"]
        .as_array()
        .unwrap()
        .contains(&json!("chat.edit_info")));

    // Deleting the parent detaches the child
    assert_eq!(server.delete(&staff, &format!("/api/roles/{}", base_id)).await, 204);
    let (_, child) = server.get(&staff, &format!("/api/roles/{}", child_id)).await;
    assert!(child["parent_role"].is_null());
    assert_eq!(child["effective_permissions"], json!(["chat.archive"]));
}

#[tokio::test]
async fn test_channel_moderator_ace() {
    let server = start_test_server(None).await;
    let staff = server.seed_user(9, None, true, false);
    let owner = server.seed_user(1, None, false, false);
    let moderator = server.seed_user(2, None, false, false);
    let bystander = server.seed_user(3, None, false, false);

    let (status, channel) = server.post(&owner, "/api/channels", json!({"name": "Channel X"})).await;
    assert_eq!(status, 201);
    let channel_id = channel["id"].as_str().unwrap();

    let role = create_role(&server, &staff, json!({"name": "Moderator", "scope": "CHANNEL"})).await;
    let role_id = role["id"].as_str().unwrap();

    let (status, assignment) = server
        .post(
            &staff,
            "/api/role-assignments",
            json!({"role_id": role_id, "user_id": 2, "scope_type": "CHANNEL", "scope_id": channel_id}),
        )
        .await;
    assert_eq!(status, 201, "{}", assignment);

    let (status, ace) = server
        .post(
            &staff,
            "/api/aces",
            json!({
                "principal": {"type": "core.Role", "id": role_id},
                "target": {"type": "core.Channel", "id": channel_id},
                "permissions": ["chat.pin_message", "chat.pin_message"],
                "effect": "ALLOW",
            }),
        )
        .await;
    assert_eq!(status, 201, "{}", ace);
    assert_eq!(ace["permissions"], json!(["chat.pin_message"]));

    assert!(server.allowed(&moderator, "chat.pin_message", "core.Channel", channel_id).await);
    assert!(!server.allowed(&bystander, "chat.pin_message", "core.Channel", channel_id).await);

    // Revoking the assignment takes the ACE away from the user
    let assignment_id = assignment["id"].as_str().unwrap();
    assert_eq!(server.delete(&staff, &format!("/api/role-assignments/{}", assignment_id)).await, 204);
    assert!(!server.allowed(&moderator, "chat.pin_message", "core.Channel", channel_id).await);
}

#[tokio::test]
async fn test_deny_overrides_allow() {
    let server = start_test_server(None).await;
    let staff = server.seed_user(9, None, true, false);
    let owner = server.seed_user(1, None, false, false);
    let member = server.seed_user(2, Some("+237600000002"), false, false);
    let conversation = create_group_conversation(&server, &owner, json!(["+237600000002"])).await;

    assert!(!server.allowed(&member, "chat.pin_message", "chat.Conversation", &conversation).await);

    let (status, _) = server
        .post(
            &staff,
            "/api/aces",
            json!({
                "principal": {"type": "accounts.User", "id": 2},
                "target": {"type": "chat.Conversation", "id": conversation},
                "permissions": ["chat.pin_message"],
            }),
        )
        .await;
    assert_eq!(status, 201);
    assert!(server.allowed(&member, "chat.pin_message", "chat.Conversation", &conversation).await);

    // A type-wide PUBLIC deny beats the user's exact allow
    let (status, deny) = server
        .post(
            &staff,
            "/api/aces",
            json!({
                "principal": null,
                "target": {"type": "chat.conversation"},
                "permissions": ["chat.pin_message"],
                "effect": "DENY",
            }),
        )
        .await;
    assert_eq!(status, 201, "{}", deny);
    assert!(deny["principal"].is_null());
    assert!(deny["target"]["id"].is_null());

    let (status, check) = server
        .post(
            &member,
            "/api/authz/check",
            json!({"permission": "chat.pin_message", "target": {"type": "chat.Conversation", "id": conversation}}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(check["allowed"], false);
    assert_eq!(check["reason"], "ace_deny");

    // The owner's base role is decided before ACEs
    assert!(server.allowed(&owner, "chat.pin_message", "chat.Conversation", &conversation).await);
}

#[tokio::test]
async fn test_expired_entries_are_ignored() {
    let server = start_test_server(None).await;
    let staff = server.seed_user(9, None, true, false);
    let owner = server.seed_user(1, None, false, false);
    let member = server.seed_user(2, Some("+237600000002"), false, false);
    let conversation = create_group_conversation(&server, &owner, json!(["+237600000002"])).await;

    let (status, _) = server
        .post(
            &staff,
            "/api/aces",
            json!({
                "principal": {"type": "accounts.User", "id": "2"},
                "target": {"type": "chat.Conversation", "id": conversation},
                "permissions": ["chat.create_subroom"],
                "expires_at": "2000-01-01T00:00:00Z",
            }),
        )
        .await;
    assert_eq!(status, 201);
    assert!(!server.allowed(&member, "chat.create_subroom", "chat.Conversation", &conversation).await);

    let role = create_role(
        &server,
        &staff,
        json!({"name": "Pinner", "scope": "CONVERSATION", "permissions": ["chat.pin_message"]}),
    )
    .await;
    let (status, _) = server
        .post(
            &staff,
            "/api/role-assignments",
            json!({
                "role_id": role["id"],
                "user_id": 2,
                "scope_type": "CONVERSATION",
                "scope_id": conversation,
                "expires_at": "2000-01-01T00:00:00",
            }),
        )
        .await;
    assert_eq!(status, 201);
    assert!(!server.allowed(&member, "chat.pin_message", "chat.Conversation", &conversation).await);
}

#[tokio::test]
async fn test_role_assignment_and_membership_role() {
    let server = start_test_server(None).await;
    let staff = server.seed_user(9, None, true, false);
    let owner = server.seed_user(1, None, false, false);
    let member = server.seed_user(2, Some("+237600000002"), false, false);
    let conversation = create_group_conversation(&server, &owner, json!(["+237600000002"])).await;

    let role = create_role(
        &server,
        &staff,
        json!({"name": "Curator", "scope": "CONVERSATION", "permissions": ["chat.pin_message"]}),
    )
    .await;
    let role_id = role["id"].as_str().unwrap();

    // Attached to the membership row
    let (status, updated) = server
        .patch(
            &owner,
            &format!("/api/conversations/{}/members/2", conversation),
            json!({"role_id": role_id}),
        )
        .await;
    assert_eq!(status, 200, "{}", updated);
    assert_eq!(updated["role_id"], role_id);
    assert!(server.allowed(&member, "chat.pin_message", "chat.Conversation", &conversation).await);
    let (status, _) = server
        .post(
            &member,
            "/api/authz/check",
            json!({"permission": "chat.pin_message", "target": {"type": "chat.Conversation", "id": conversation}}),
        )
        .await;
    assert_eq!(status, 200);

    let (status, _) = server
        .patch(
            &owner,
            &format!("/api/conversations/{}/members/2", conversation),
            json!({"role_id": null}),
        )
        .await;
    assert_eq!(status, 200);
    assert!(!server.allowed(&member, "chat.pin_message", "chat.Conversation", &conversation).await);

    // Global roles cannot sit on a membership
    let global = create_role(&server, &staff, json!({"name": "Everywhere", "permissions": ["chat.pin_message"]})).await;
    let (status, _) = server
        .patch(
            &owner,
            &format!("/api/conversations/{}/members/2", conversation),
            json!({"role_id": global["id"]}),
        )
        .await;
    assert_eq!(status, 400);

    // Assigned at exactly this conversation
    let (status, _) = server
        .post(
            &staff,
            "/api/role-assignments",
            json!({"role_id": role_id, "user_id": 2, "scope_type": "CONVERSATION", "scope_id": conversation}),
        )
        .await;
    assert_eq!(status, 201);
    assert!(server.allowed(&member, "chat.pin_message", "chat.Conversation", &conversation).await);
    let (status, _) = server
        .post(
            &staff,
            "/api/role-assignments",
            json!({"role_id": role_id, "user_id": 2, "scope_type": "CONVERSATION", "scope_id": conversation}),
        )
        .await;
    assert_eq!(status, 400);

    // Wrong scope level for a CONVERSATION role
    let (status, _) = server
        .post(
            &staff,
            "/api/role-assignments",
            json!({"role_id": role_id, "user_id": 2, "scope_type": "GLOBAL"}),
        )
        .await;
    assert_eq!(status, 400);

    let (status, listed) = server.get(&staff, "/api/role-assignments?user_id=2").await;
    assert_eq!(status, 200);
    assert_eq!(listed["assignments"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_default_roles_granted_on_join() {
    let server = start_test_server(None).await;
    let staff = server.seed_user(9, None, true, false);
    let owner = server.seed_user(1, None, false, false);
    let newcomer = server.seed_user(2, None, false, false);

    create_role(
        &server,
        &staff,
        json!({"name": "Regular", "scope": "CONVERSATION", "is_default": true, "permissions": ["chat.pin_message"]}),
    )
    .await;

    let conversation = create_group_conversation(&server, &owner, json!([])).await;
    let (status, _) = server
        .post(&owner, &format!("/api/conversations/{}/members", conversation), json!({"user_id": 2}))
        .await;
    assert_eq!(status, 201);
    assert!(server.allowed(&newcomer, "chat.pin_message", "chat.Conversation", &conversation).await);
}

#[tokio::test]
async fn test_superuser_bypass_and_unknown_targets() {
    let server = start_test_server(None).await;
    let root = server.seed_user(1, None, false, true);
    let owner = server.seed_user(2, None, false, false);
    let conversation = create_group_conversation(&server, &owner, json!([])).await;

    let (status, check) = server
        .post(
            &root,
            "/api/authz/check",
            json!({"permission": "chat.archive", "target": {"type": "chat.Conversation", "id": conversation}}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(check["allowed"], true);
    assert_eq!(check["reason"], "superuser");

    let (status, _) = server
        .post(
            &root,
            "/api/authz/check",
            json!({"permission": "chat.archive", "target": {"type": "chat.Conversation", "id": "missing"}}),
        )
        .await;
    assert_eq!(status, 404);
    let (status, _) = server
        .post(
            &root,
            "/api/authz/check",
            json!({"permission": "chat.archive", "target": {"type": "shop.Product", "id": "1"}}),
        )
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_internal_endpoints_require_token() {
    let server = start_test_server(Some(INTERNAL_TOKEN)).await;
    let owner = server.seed_user(1, None, false, false);
    let conversation = create_group_conversation(&server, &owner, json!([])).await;
    let body = json!({
        "user_id": 1,
        "permission": "chat.set_settings",
        "target": {"type": "chat.Conversation", "id": conversation},
    });

    let resp = server
        .client
        .post(server.url("/internal/authz/check"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .post(server.url("/internal/authz/check"))
        .header("X-Internal-Auth", INTERNAL_TOKEN)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let check: Value = resp.json().await.unwrap();
    assert_eq!(check["allowed"], true);
    assert_eq!(check["reason"], "base_role");

    // Mirror a new account, then introspect a token for it
    let resp = server
        .client
        .put(server.url("/internal/users/5"))
        .header("X-Internal-Auth", INTERNAL_TOKEN)
        .json(&json!({"username": "eve", "phone": "+237600000005"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = server
        .client
        .get(server.url("/internal/introspect"))
        .header("X-Internal-Auth", INTERNAL_TOKEN)
        .bearer_auth(server.token(5))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let me: Value = resp.json().await.unwrap();
    assert_eq!(me["id"], "5");
    assert_eq!(me["username"], "eve");
    assert_eq!(me["display_name"], "eve");

    let resp = server
        .client
        .get(server.url("/internal/introspect"))
        .header("X-Internal-Auth", INTERNAL_TOKEN)
        .bearer_auth("garbage")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_conversation_local_roles() {
    let server = start_test_server(None).await;
    let owner = server.seed_user(1, None, false, false);
    let member = server.seed_user(2, Some("+237600000002"), false, false);
    server.seed_user(3, None, false, false);

    let room = create_group_conversation(&server, &owner, json!(["+237600000002"])).await;
    let roles_path = format!("/api/conversations/{}/roles", room);

    // Managing roles needs chat.set_settings in the room
    let (status, _) = server.get(&member, &roles_path).await;
    assert_eq!(status, 403);
    let (status, _) = server.post(&member, &roles_path, json!({"name": "Pinner"})).await;
    assert_eq!(status, 403);

    let (status, role) = server.post(&owner, &roles_path, json!({"name": "Pinner"})).await;
    assert_eq!(status, 201, "{}", role);
    assert_eq!(role["scope"], "CONVERSATION");
    assert_eq!(role["scope_id"], room.as_str());
    let role_id = role["id"].as_str().unwrap();
    let (status, _) = server.post(&owner, &roles_path, json!({"name": "Pinner"})).await;
    assert_eq!(status, 400);

    let (status, updated) = server
        .post(
            &owner,
            &format!("{}/{}/permissions", roles_path, role_id),
            json!({"permissions": {"chat.pin_message": true}}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(updated["permissions"], json!(["chat.pin_message"]));
    assert!(!server.allowed(&member, "chat.pin_message", "chat.Conversation", &room).await);

    let assign_path = format!("{}/{}/assign", roles_path, role_id);
    let (status, _) = server.post(&owner, &assign_path, json!({"user_id": 3})).await;
    assert_eq!(status, 400);
    let (status, _) = server.post(&owner, &assign_path, json!({"user_id": 99})).await;
    assert_eq!(status, 404);
    let (status, assignment) = server.post(&owner, &assign_path, json!({"user_id": 2})).await;
    assert_eq!(status, 201, "{}", assignment);
    assert_eq!(assignment["scope_type"], "CONVERSATION");
    assert_eq!(assignment["scope_id"], room.as_str());
    let (status, _) = server.post(&owner, &assign_path, json!({"user_id": 2})).await;
    assert_eq!(status, 200);

    let (_, check) = server
        .post(
            &member,
            "/api/authz/check",
            json!({"permission": "chat.pin_message", "target": {"type": "chat.Conversation", "id": room}}),
        )
        .await;
    assert_eq!(check["allowed"], true);
    assert_eq!(check["reason"], "role_assignment");

    // Withdrawing the code takes effect immediately
    server
        .post(
            &owner,
            &format!("{}/{}/permissions", roles_path, role_id),
            json!({"permissions": {"chat.pin_message": false}}),
        )
        .await;
    assert!(!server.allowed(&member, "chat.pin_message", "chat.Conversation", &room).await);

    // Roles of another room are invisible here
    let other = create_group_conversation(&server, &owner, json!([])).await;
    let (_, foreign) = server
        .post(&owner, &format!("/api/conversations/{}/roles", other), json!({"name": "Pinner"}))
        .await;
    let (status, _) = server
        .post(&owner, &format!("{}/{}/assign", roles_path, foreign["id"].as_str().unwrap()), json!({"user_id": 2}))
        .await;
    assert_eq!(status, 404);

    let (status, listed) = server.get(&owner, &roles_path).await;
    assert_eq!(status, 200);
    assert_eq!(listed["roles"].as_array().unwrap().len(), 1);
}
