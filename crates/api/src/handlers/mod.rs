//! Request handlers

pub mod accounts;
pub mod admin;
pub mod health;
pub mod operations;
pub mod webhooks;
