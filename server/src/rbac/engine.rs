//! Permission evaluation over preloaded facts.
//!
//! `evaluate` has no I/O and no clock of its own: the store loads
//! [`SubjectFacts`] and [`ScopeFacts`], the caller passes `now`.
//!
//! Precedence, first match wins:
//! 1. superuser
//! 2. conversation owner/admin on a coarse conversation action
//! 3. the membership's fine-grained role
//! 4. role assignments on exactly this scope
//! 5. ACEs (deny beats allow)
//! 6. channels only: the same evaluation on each linked group/community
//! 7. deny

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::models::{AceEffect, BaseRole};
use crate::rbac::permissions::CoarseActions;
use crate::rbac::refs::{ObjectKind, ObjectRef, Principal, Target};

/// Role id plus its effective (inherited) permission codes.
#[derive(Debug, Clone, Default)]
pub struct RoleGrant {
    pub role_id: String,
    pub permissions: BTreeSet<String>,
}

impl RoleGrant {
    pub fn grants(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

/// Facts about the caller that do not depend on the target.
#[derive(Debug, Clone, Default)]
pub struct SubjectFacts {
    pub user_id: i64,
    pub is_superuser: bool,
    /// Every role assigned to the user in any scope, with its expiry.
    /// Used to widen ACE principal matching.
    pub assigned_roles: Vec<(String, Option<DateTime<Utc>>)>,
}

impl SubjectFacts {
    fn matches(&self, principal: &Principal, now: DateTime<Utc>) -> bool {
        match principal {
            Principal::Public => true,
            Principal::User(id) => *id == self.user_id,
            Principal::Role(role_id) => self
                .assigned_roles
                .iter()
                .any(|(id, expires)| id == role_id && unexpired(*expires, now)),
        }
    }
}

/// Active membership of the caller in the scope object.
#[derive(Debug, Clone, Default)]
pub struct MembershipFact {
    /// Conversations carry a base role; group memberships do not.
    pub base_role: Option<BaseRole>,
    pub role: Option<RoleGrant>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AssignmentFact {
    pub role: RoleGrant,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AceFact {
    pub principal: Principal,
    pub target: Target,
    pub permissions: Vec<String>,
    pub effect: AceEffect,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Facts about the target object as seen by one caller.
#[derive(Debug, Clone)]
pub struct ScopeFacts {
    pub object: ObjectRef,
    pub membership: Option<MembershipFact>,
    pub assignments: Vec<AssignmentFact>,
    pub aces: Vec<AceFact>,
    /// Groups and communities linked to a channel. Empty for other kinds.
    pub linked: Vec<ScopeFacts>,
}

impl ScopeFacts {
    pub fn new(object: ObjectRef) -> Self {
        ScopeFacts {
            object,
            membership: None,
            assignments: Vec::new(),
            aces: Vec::new(),
            linked: Vec::new(),
        }
    }
}

/// Which rule produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Superuser,
    BaseRole,
    MembershipRole,
    RoleAssignment,
    AceAllow,
    LinkedScope,
    AceDeny,
    /// Conversation send rules, applied by the chat layer on top of the engine
    SendPolicy,
    DefaultDeny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Reason,
}

impl Decision {
    pub fn allow(reason: Reason) -> Self {
        Decision { allowed: true, reason }
    }

    pub fn deny(reason: Reason) -> Self {
        Decision { allowed: false, reason }
    }
}

fn unexpired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map(|at| at > now).unwrap_or(true)
}

pub fn evaluate(
    subject: &SubjectFacts,
    scope: &ScopeFacts,
    permission: &str,
    now: DateTime<Utc>,
) -> Decision {
    if subject.is_superuser {
        return Decision::allow(Reason::Superuser);
    }

    if let Some(decision) = evaluate_scope(subject, scope, permission, now) {
        return decision;
    }

    if scope.object.kind == ObjectKind::Channel {
        let via_link = scope
            .linked
            .iter()
            .any(|linked| matches!(evaluate_scope(subject, linked, permission, now), Some(d) if d.allowed));
        if via_link {
            return Decision::allow(Reason::LinkedScope);
        }
    }

    Decision::deny(Reason::DefaultDeny)
}

/// Steps 2 through 5 for one scope. None means no rule applied.
fn evaluate_scope(
    subject: &SubjectFacts,
    scope: &ScopeFacts,
    permission: &str,
    now: DateTime<Utc>,
) -> Option<Decision> {
    let membership = scope
        .membership
        .as_ref()
        .filter(|m| unexpired(m.expires_at, now));

    if let Some(m) = membership {
        let carried = m.base_role.map(CoarseActions::for_base_role).unwrap_or(CoarseActions::empty());
        let coarse = CoarseActions::from_code(permission);
        if scope.object.kind == ObjectKind::Conversation && coarse.is_some_and(|action| carried.contains(action)) {
            return Some(Decision::allow(Reason::BaseRole));
        }

        if m.role.as_ref().map(|r| r.grants(permission)).unwrap_or(false) {
            return Some(Decision::allow(Reason::MembershipRole));
        }
    }

    let assigned = scope
        .assignments
        .iter()
        .filter(|a| unexpired(a.expires_at, now))
        .any(|a| a.role.grants(permission));
    if assigned {
        return Some(Decision::allow(Reason::RoleAssignment));
    }

    let mut allowed = false;
    for ace in scope.aces.iter().filter(|ace| {
        unexpired(ace.expires_at, now)
            && ace.target.covers(&scope.object)
            && subject.matches(&ace.principal, now)
            && ace.permissions.iter().any(|p| p == permission)
    }) {
        match ace.effect {
            AceEffect::Deny => return Some(Decision::deny(Reason::AceDeny)),
            AceEffect::Allow => allowed = true,
        }
    }
    if allowed {
        return Some(Decision::allow(Reason::AceAllow));
    }

    None
}
