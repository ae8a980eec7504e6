pub mod admin;
pub mod auth;
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod memory;
pub mod middleware;
pub mod policy;
pub mod types;
