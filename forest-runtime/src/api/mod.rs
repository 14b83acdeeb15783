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

//! API facade layer.
//!
//! Keeps outward usage forest-centric: one [`Forest`] handle owns the
//! substrate, the reconciliation worker, the supervisor, and the cluster
//! membership, while internals stay in their domain-focused layers.

pub mod forest;

pub use forest::{Forest, ForestOptions};
