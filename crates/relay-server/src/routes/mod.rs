//! HTTP route handlers.

pub mod admin;
