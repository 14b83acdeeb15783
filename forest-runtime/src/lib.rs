/********************************************************************************
 * Copyright (c) 2026 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! # forest-runtime
//!
//! `forest-runtime` is an event-driven orchestration runtime for small
//! operations teams: external data flows through deterministic parsers,
//! rule engines, and AI-backed decision-makers, over a clustered
//! message-bus substrate with persistent state and an audit trail.
//!
//! Typical usage is API-first and centered on [`Forest`] and
//! [`ForestOptions`]: build the options, start the node, mount its two
//! routers, and drive components through the supervisor.
//!
//! ```no_run
//! use forest_runtime::{Forest, ForestOptions};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let mut options = ForestOptions::new("./forest-data", "./artifacts");
//! options.config_path = Some("./forest.json5".into());
//! let forest = Forest::start(options).await.unwrap();
//! // axum::serve(..., forest.management_router()) on loopback,
//! // axum::serve(..., forest.webhook_router()) on the webhook bind.
//! forest.shutdown().await;
//! # });
//! ```
//!
//! ## Internal architecture map
//!
//! - API facade: outward `Forest` construction, startup, shutdown
//! - Control plane: descriptor table, supervisor lifecycle, config, the
//!   management API
//! - Data plane: Wind, the durable stream engine (River, Humus), Soil, and
//!   the Decomposer
//! - Routing: subject grammar, wildcard matching, reserved prefixes
//! - Runtime: artifact loading and the Tree / TreeHouse / Nim / Source /
//!   Songbird drivers
//! - Cluster: node descriptor, registry lookup, peer links
//!
//! ## Delivery model
//!
//! Wind is at-most-once with per-subscription FIFO; River and Humus are
//! at-least-once in slot order per durable consumer; Soil is revisioned
//! compare-and-set, written only by the Decomposer. Exactly-once delivery
//! and global cross-subject ordering are non-goals.
//!
//! ## Observability model
//!
//! The workspace uses `tracing` for logs/events. Library code emits
//! events/spans and does not unconditionally initialize a global
//! subscriber. Binaries and tests are responsible for one-time
//! `tracing_subscriber` initialization at process boundaries.

pub mod api;
pub mod cluster;
pub mod control_plane;
pub mod data_plane;
pub mod routing;
pub mod runtime;

mod leaf;
pub use leaf::Leaf;

mod status;
pub use status::{ErrorKind, ForestError};

pub use api::{Forest, ForestOptions};
pub use control_plane::{
    load_config, ComponentDescriptor, ComponentKind, ComponentSpec, ForestConfig, Supervisor,
};
pub use data_plane::{Compost, CompostAction, Humus, River, Soil, StateEntry, Wind};
pub use runtime::{AiAsker, Songbird, SongbirdMessage, Source};
