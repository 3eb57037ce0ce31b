use axum::{
    middleware,
    routing::{get, patch, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::accounts::sync;
use crate::auth::middleware::JwtSecret;
use crate::chat::{conversations, last_message, members, requests, settings, threads};
use crate::rbac::{ace, assignment, catalog, check, conversation_roles, roles};
use crate::scopes::{crud as scope_crud, membership as scope_membership};
use crate::state::AppState;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Static segments (direct, members/me) take priority over {id} captures.
    let conversation_routes = Router::new()
        .route(
            "/api/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route("/api/conversations/direct", post(conversations::create_direct))
        .route(
            "/api/conversations/{id}",
            get(conversations::get_conversation).patch(conversations::update_info),
        )
        .route(
            "/api/conversations/{id}/members",
            get(members::list_members).post(members::add_member),
        )
        .route("/api/conversations/{id}/members/me", patch(members::update_my_preferences))
        .route(
            "/api/conversations/{id}/members/{user_id}",
            patch(members::update_member).delete(members::remove_member),
        )
        .route("/api/conversations/{id}/leave", post(members::leave_conversation))
        .route(
            "/api/conversations/{id}/settings",
            get(settings::get_settings).patch(settings::update_settings),
        )
        .route("/api/conversations/{id}/accept-request", post(requests::accept_request))
        .route("/api/conversations/{id}/reject-request", post(requests::reject_request))
        .route("/api/conversations/{id}/block", post(conversations::block_conversation))
        .route("/api/conversations/{id}/archive", post(conversations::archive_conversation))
        .route("/api/conversations/{id}/threads", get(threads::list_threads))
        .route(
            "/api/conversations/{id}/roles",
            get(conversation_roles::list_conversation_roles).post(conversation_roles::create_conversation_role),
        )
        .route(
            "/api/conversations/{id}/roles/{role_id}/permissions",
            post(conversation_roles::set_conversation_role_permissions),
        )
        .route(
            "/api/conversations/{id}/roles/{role_id}/assign",
            post(conversation_roles::assign_conversation_role),
        )
        .route(
            "/api/conversations/{id}/update-last-message",
            patch(last_message::update_last_message),
        );

    let thread_routes = Router::new()
        .route("/api/threads", post(threads::create_thread))
        .route("/api/threads/{id}", get(threads::get_thread));

    let rbac_routes = Router::new()
        .route(
            "/api/permissions",
            get(catalog::list_permissions).post(catalog::create_permission),
        )
        .route("/api/permissions/{code}", axum::routing::delete(catalog::delete_permission))
        .route("/api/roles", get(roles::list_roles).post(roles::create_role))
        .route(
            "/api/roles/{id}",
            get(roles::get_role).put(roles::update_role).delete(roles::delete_role),
        )
        .route("/api/roles/{id}/permissions", post(roles::add_role_permissions))
        .route(
            "/api/role-assignments",
            get(assignment::list_assignments).post(assignment::assign_role),
        )
        .route("/api/role-assignments/{id}", axum::routing::delete(assignment::revoke_assignment))
        .route("/api/aces", get(ace::list_aces).post(ace::create_ace))
        .route("/api/aces/{id}", axum::routing::delete(ace::delete_ace))
        .route("/api/authz/check", post(check::check_self));

    let scope_routes = Router::new()
        .route("/api/communities", post(scope_crud::create_community))
        .route("/api/communities/{id}", get(scope_crud::get_community))
        .route("/api/communities/{id}/archive", post(scope_crud::archive_community))
        .route("/api/groups", post(scope_crud::create_group))
        .route("/api/groups/{id}", get(scope_crud::get_group))
        .route("/api/groups/{id}/join", post(scope_membership::join))
        .route("/api/groups/{id}/leave", post(scope_membership::leave_group_handler))
        .route("/api/groups/{id}/archive", post(scope_crud::archive_group))
        .route("/api/channels", post(scope_crud::create_channel))
        .route("/api/channels/{id}", get(scope_crud::get_channel))
        .route("/api/channels/{id}/links", post(scope_crud::link_channel))
        .route("/api/channels/{id}/archive", post(scope_crud::archive_channel));

    // Trusted service-to-service calls (X-Internal-Auth when a token is configured)
    let internal_routes = Router::new()
        .route("/internal/users/{id}", put(sync::upsert_user))
        .route("/internal/introspect", get(sync::introspect))
        .route("/internal/authz/check", post(check::check_internal));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(conversation_routes)
        .merge(thread_routes)
        .merge(rbac_routes)
        .merge(scope_routes)
        .merge(internal_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
