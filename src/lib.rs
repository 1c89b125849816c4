//! # Playlist Relay
//!
//! Collects music links posted in chat communities and keeps a shared
//! YouTube playlist and a shared SoundCloud playlist in sync with them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌──────────────┐   ┌───────────────┐
//! │ chat / CLI  │──▶│ Pipeline │──▶│  Dedup Store │   │ Token Manager │
//! │ live+backlog│   │ classify │   │ SQLite       │   │ OAuth + PKCE  │
//! └─────────────┘   └────┬─────┘   └──────────────┘   └───────┬───────┘
//!                        │                                    │
//!                        ▼                                    │
//!                 ┌──────────────┐                            │
//!                 │  Providers   │◀───────────────────────────┘
//!                 │ YouTube / SC │
//!                 └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! relay init                         # create database
//! relay auth youtube                 # consent in the browser, token stored
//! relay ingest --community 1 "https://youtu.be/dQw4w9WgXcQ"
//! relay backlog --community 1 --history export.jsonl --count 50
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`classify`] | URL extraction, provider identification, canonical URLs |
//! | [`store`] | Dedup store trait, SQLite and in-memory backends |
//! | [`oauth`] | PKCE authorization, token refresh, persistence |
//! | [`providers`] | YouTube and SoundCloud playlist clients |
//! | [`ingest`] | Live and backlog ingestion pipeline |
//! | [`history`] | Channel history sources for backlog replay |
//! | [`service`] | Long-lived service wiring and shutdown |
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`stats`] | Store statistics |
//! | [`status`] | Provider readiness |

pub mod classify;
pub mod config;
pub mod db;
pub mod history;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod oauth;
pub mod providers;
pub mod service;
pub mod stats;
pub mod status;
pub mod store;
