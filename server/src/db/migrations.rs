use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking - no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: Accounts mirror and RBAC catalog

CREATE TABLE users (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL DEFAULT '',
    phone TEXT UNIQUE,
    display_name TEXT NOT NULL DEFAULT '',
    is_superuser INTEGER NOT NULL DEFAULT 0,
    is_staff INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE permissions (
    code TEXT PRIMARY KEY,
    description TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE roles (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT 'GLOBAL',
    -- Set for roles owned by one scope instance (a conversation's own roles)
    scope_id TEXT,
    description TEXT NOT NULL DEFAULT '',
    parent_role_id TEXT,
    is_default INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (parent_role_id) REFERENCES roles(id) ON DELETE SET NULL
);

CREATE UNIQUE INDEX idx_roles_name_scope ON roles(name, scope, COALESCE(scope_id, ''));

CREATE INDEX idx_roles_scope_default ON roles(scope, is_default);

CREATE TABLE role_permissions (
    role_id TEXT NOT NULL,
    permission_code TEXT NOT NULL,
    PRIMARY KEY (role_id, permission_code),
    FOREIGN KEY (role_id) REFERENCES roles(id) ON DELETE CASCADE,
    FOREIGN KEY (permission_code) REFERENCES permissions(code)
);

CREATE TABLE role_assignments (
    id TEXT PRIMARY KEY,
    role_id TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    scope_type TEXT NOT NULL,
    scope_id TEXT,
    expires_at TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (role_id) REFERENCES roles(id) ON DELETE CASCADE
);

CREATE INDEX idx_role_assignments_user_scope ON role_assignments(user_id, scope_type, scope_id);
CREATE UNIQUE INDEX idx_role_assignments_unique
    ON role_assignments(role_id, user_id, scope_type, COALESCE(scope_id, ''));

CREATE TABLE aces (
    id TEXT PRIMARY KEY,
    principal_type TEXT,
    principal_id TEXT,
    target_type TEXT,
    target_id TEXT,
    permissions TEXT NOT NULL DEFAULT '[]',
    effect TEXT NOT NULL DEFAULT 'ALLOW',
    expires_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX idx_aces_principal ON aces(principal_type, principal_id);
CREATE INDEX idx_aces_target ON aces(target_type, target_id);

INSERT INTO permissions (code, description, category, created_at) VALUES
    ('chat.send_message', 'Send messages in a conversation', 'chat', '1970-01-01T00:00:00.000000Z'),
    ('chat.add_member', 'Add members to a conversation', 'chat', '1970-01-01T00:00:00.000000Z'),
    ('chat.remove_member', 'Remove members from a conversation', 'chat', '1970-01-01T00:00:00.000000Z'),
    ('chat.create_subroom', 'Create threads and sub-rooms', 'chat', '1970-01-01T00:00:00.000000Z'),
    ('chat.pin_message', 'Pin messages', 'chat', '1970-01-01T00:00:00.000000Z'),
    ('chat.set_settings', 'Change conversation settings', 'chat', '1970-01-01T00:00:00.000000Z'),
    ('chat.edit_info', 'Edit conversation title, description and avatar', 'chat', '1970-01-01T00:00:00.000000Z'),
    ('chat.manage_roles', 'Change member roles', 'chat', '1970-01-01T00:00:00.000000Z'),
    ('chat.archive', 'Archive a conversation', 'chat', '1970-01-01T00:00:00.000000Z');
",
        ),
        M::up(
            "-- Migration 2: Conversations

CREATE TABLE conversations (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL DEFAULT 'direct',
    title TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    avatar_url TEXT NOT NULL DEFAULT '',
    created_by INTEGER NOT NULL,
    request_state TEXT NOT NULL DEFAULT 'none',
    request_initiator INTEGER,
    request_recipient INTEGER,
    request_accepted_at TEXT,
    request_rejected_at TEXT,
    is_archived INTEGER NOT NULL DEFAULT 0,
    is_locked INTEGER NOT NULL DEFAULT 0,
    locked_by INTEGER,
    last_message_at TEXT,
    last_message_preview TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (created_by) REFERENCES users(id)
);

CREATE INDEX idx_conversations_type_created ON conversations(type, created_at);
CREATE INDEX idx_conversations_archived_last ON conversations(is_archived, last_message_at);

CREATE TABLE conversation_members (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    base_role TEXT NOT NULL DEFAULT 'member',
    role_id TEXT,
    display_name TEXT NOT NULL DEFAULT '',
    color TEXT NOT NULL DEFAULT '',
    notification_level TEXT NOT NULL DEFAULT 'all',
    is_muted INTEGER NOT NULL DEFAULT 0,
    is_blocked INTEGER NOT NULL DEFAULT 0,
    joined_at TEXT NOT NULL,
    left_at TEXT,
    UNIQUE(conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id),
    FOREIGN KEY (role_id) REFERENCES roles(id) ON DELETE SET NULL
);

CREATE INDEX idx_conversation_members_user ON conversation_members(user_id, joined_at);
CREATE INDEX idx_conversation_members_role ON conversation_members(conversation_id, base_role);

CREATE TABLE conversation_settings (
    conversation_id TEXT PRIMARY KEY,
    send_policy TEXT NOT NULL DEFAULT 'all_members',
    join_policy TEXT NOT NULL DEFAULT 'invite_only',
    info_edit_policy TEXT NOT NULL DEFAULT 'admins_only',
    subroom_policy TEXT NOT NULL DEFAULT 'all_members',
    max_subroom_depth INTEGER NOT NULL DEFAULT 8,
    message_retention_days INTEGER,
    allow_reactions INTEGER NOT NULL DEFAULT 1,
    allow_stickers INTEGER NOT NULL DEFAULT 1,
    allow_attachments INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE TABLE thread_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_conversation_id TEXT NOT NULL,
    parent_message_key TEXT NOT NULL,
    child_conversation_id TEXT NOT NULL UNIQUE,
    parent_thread_id INTEGER,
    depth INTEGER NOT NULL DEFAULT 1,
    created_by INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(parent_conversation_id, parent_message_key),
    FOREIGN KEY (parent_conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (child_conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (parent_thread_id) REFERENCES thread_links(id) ON DELETE CASCADE
);
",
        ),
        M::up(
            "-- Migration 3: Community, group and channel scopes

CREATE TABLE communities (
    id TEXT PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    owner_id INTEGER NOT NULL,
    is_archived INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE groups (
    id TEXT PRIMARY KEY,
    slug TEXT NOT NULL,
    name TEXT NOT NULL,
    community_id TEXT,
    owner_id INTEGER NOT NULL,
    conversation_id TEXT,
    member_count INTEGER NOT NULL DEFAULT 0,
    is_archived INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(community_id, slug),
    FOREIGN KEY (community_id) REFERENCES communities(id) ON DELETE CASCADE,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);

CREATE TABLE channels (
    id TEXT PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    owner_id INTEGER NOT NULL,
    conversation_id TEXT,
    is_archived INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);

CREATE TABLE channel_groups (
    channel_id TEXT NOT NULL,
    group_id TEXT NOT NULL,
    PRIMARY KEY (channel_id, group_id),
    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE,
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
);

CREATE TABLE channel_communities (
    channel_id TEXT NOT NULL,
    community_id TEXT NOT NULL,
    PRIMARY KEY (channel_id, community_id),
    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE,
    FOREIGN KEY (community_id) REFERENCES communities(id) ON DELETE CASCADE
);

CREATE TABLE group_members (
    group_id TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    role_id TEXT,
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    joined_at TEXT NOT NULL,
    expires_at TEXT,
    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE,
    FOREIGN KEY (role_id) REFERENCES roles(id) ON DELETE SET NULL
);

CREATE INDEX idx_group_members_status ON group_members(group_id, status);
",
        ),
    ])
}
