//! tunnelctl - control plane for an frpc tunnel client
//!
//! This library keeps a set of tunnel definitions and makes a single external
//! frpc process run exactly that set:
//! - Renders definitions plus the session's tunnel token into frpc INI
//! - Starts, stops and reloads frpc as a child process or over its admin API
//! - Stores definitions on a coordination service or in a local TOML file
//! - Caches the login session, optionally mirrored to an owner-only file
//! - Exposes the whole thing as a JSON HTTP API

pub mod api;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod files;
pub mod remote;
pub mod render;
pub mod service;
pub mod session;
pub mod store;
pub mod tunnel;
