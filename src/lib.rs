//! Mail intake: turns inbound support mail into tickets, ticket replies and
//! project tasks.

pub mod admin;
pub mod config;
pub mod error;
pub mod mail;
pub mod pipeline;
pub mod scheduler;
pub mod store;
