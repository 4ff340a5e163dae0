// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cutover - Zero-Downtime Container Deployment
//!
//! This crate runs one application as a container behind a reverse proxy
//! and moves live traffic between versions of it without dropping requests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐          ┌──────────────────────────────────────┐
//! │     Deploy tool      │──HTTP───►│        Control API (port 8001)       │
//! └──────────────────────┘          └──────────────────────────────────────┘
//!                                        │ deploy/history       │ launch/switch
//!                                        ▼                      ▼
//!                          ┌──────────────────────┐  ┌──────────────────────┐
//!                          │  ContainerHistory    │  │  ContainerManager    │
//!                          │  LaunchConfigStore   │◄─│  (deploy state       │
//!                          └──────────────────────┘  │   machine)           │
//!                                   │                └──────────────────────┘
//!                                   ▼                   │ runtime     │ update
//!                          ┌──────────────────────┐     ▼             ▼
//!                          │  Object storage (S3) │  ┌────────┐  ┌──────────┐
//!                          │  container.{md5}.json│  │ Docker │  │  Proxy   │◄── clients
//!                          │  current.json        │  └────────┘  │ (port 80)│
//!                          │  history.json        │      │       └──────────┘
//!                          └──────────────────────┘      ▼             │
//!                                                 ┌─────────────────────────┐
//!                                                 │ App containers (9292/tcp│
//!                                                 │ published on host port) │
//!                                                 └─────────────────────────┘
//! ```
//!
//! # Deploy flow
//!
//! | Step | Operation | Effect |
//! |------|-----------|--------|
//! | 1 | `POST /deploy` | Launch config stored under its MD5 |
//! | 2 | `POST /launch` | Container reused, started or created, then polled until healthy |
//! | 3 | `POST /switch` | Proxy upstream swapped, history event saved, `current.json` updated, superseded containers and images removed |
//!
//! After a restart [`ContainerManager::run_latest`] resumes whatever
//! `current.json` names.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Environment configuration and container env file |
//! | [`storage`] | Object storage boundary, S3 client, in-memory store |
//! | [`launch_config`] | Content-addressed launch configurations |
//! | [`history`] | Bounded deployment ledger |
//! | [`identity`] | Deployer identity for history events |
//! | [`containers`] | Container runtime boundary, Docker client, mock runtime |
//! | [`health`] | Health check polling |
//! | [`manager`] | Container deployment state machine |
//! | [`proxy`] | Reverse proxy with maintenance mode and statistics |
//! | [`api`] | Operator control API |
//! | [`runtime`] | Embeddable runtime wiring everything together |

pub mod api;
pub mod config;
pub mod containers;
pub mod error;
pub mod health;
pub mod history;
pub mod identity;
pub mod launch_config;
pub mod manager;
pub mod proxy;
pub mod retry;
pub mod runtime;
pub mod storage;

pub use error::{Error, Result};
pub use history::{ContainerHistory, ContainerHistoryEvent};
pub use launch_config::{LaunchConfig, LaunchConfigStore};
pub use manager::{ContainerManager, ManagerConfig};
pub use proxy::Proxy;
pub use runtime::CutoverRuntime;
