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

//! Control-plane layer.
//!
//! Owns the component descriptor model, the supervisor lifecycle (add,
//! remove, reload, drain), declarative configuration, and the loopback
//! management API. Mutation of the descriptor table is serialized; readers
//! get lock-free snapshots. This layer is responsible for name uniqueness
//! per kind and for rollback-safe start transitions.

pub(crate) mod config;
pub(crate) mod descriptor;
pub(crate) mod management;
pub(crate) mod supervisor;
pub(crate) mod table;

pub use config::{load_config, ForestConfig};
pub use descriptor::{
    ComponentDescriptor, ComponentKind, ComponentSpec, NimSpec, SongbirdSpec, SourceSpec,
    TreeHouseSpec, TreeSpec,
};
pub use management::management_router;
pub use supervisor::{ReloadOutcome, Supervisor, SupervisorContext};
pub use table::{ComponentState, ComponentStatus};
