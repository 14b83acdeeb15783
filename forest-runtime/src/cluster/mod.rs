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

//! Cluster bootstrap layer.
//!
//! Solves initial peer discovery and nothing more: read the node
//! descriptor, ask the shared registry for peers in the same forest, and
//! bring up the peer links that carry Wind traffic between nodes. Streams
//! and Soil stay node-local; consistency under partition is last-writer-
//! wins by design.

pub(crate) mod boot;
pub(crate) mod node;
pub(crate) mod peer;
pub(crate) mod registry;

pub use boot::{bootstrap, ClusterHandle};
pub use node::{load_node_descriptor, NodeDescriptor};
pub use peer::PeerLinks;
pub use registry::{registry_for, FileRegistry, HttpRegistry, Registry, RegistryEntry};
