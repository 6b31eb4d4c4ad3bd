//! callhub Daemon - Session hub, WebSocket ingress and offline notifications
//!
//! This crate provides the core infrastructure for the callhub relay:
//! - `hub` - Session hub actor owning presence and call state
//! - `server` - axum WebSocket ingress and per-connection tasks
//! - `notify` - Offline notifier trait, push address registry, FCM adapter
//! - `config` - TOML configuration with defaults and validation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      callhubd daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │   RelayServer   │────▶│         HubActor            │    │
//! │  │ (axum, /ws)     │     │ (clients + active calls)    │    │
//! │  └────────┬────────┘     └──────┬───────────────┬──────┘    │
//! │           │ on_upgrade          │ try_send      │ spawn     │
//! │           ▼                     ▼               ▼           │
//! │  ┌─────────────────┐     ┌──────────────┐ ┌──────────────┐  │
//! │  │   Connection    │◀────│ outbound     │ │OfflineNotifier│ │
//! │  │ (read + write)  │     │ queue (mpsc) │ │  (FCM)       │  │
//! │  └─────────────────┘     └──────────────┘ └──────────────┘  │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod hub;
pub mod notify;
pub mod server;
