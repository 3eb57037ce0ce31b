//! Role-based access control: permission catalog, roles with inheritance,
//! scoped role assignments, ACEs, and the engine that combines them.

pub mod ace;
pub mod assignment;
pub mod catalog;
pub mod check;
pub mod conversation_roles;
pub mod engine;
pub mod ownable;
pub mod permissions;
pub mod refs;
pub mod roles;
pub mod store;
