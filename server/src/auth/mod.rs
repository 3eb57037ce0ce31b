//! Request authentication: end-user JWT bearer tokens and the shared token
//! guarding internal (service-to-service) endpoints.

pub mod internal;
pub mod jwt;
pub mod middleware;
