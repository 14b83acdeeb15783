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

//! Data-plane layer: the message-bus substrate.
//!
//! Wind (ephemeral pub/sub), the durable stream engine behind River and
//! Humus, Soil (revisioned current state), and the Decomposer that applies
//! the change-log to state. Delivery guarantees live here and nowhere else:
//! Wind is at-most-once with per-subscription FIFO; the streams are
//! at-least-once in slot order per consumer; Soil offers compare-and-set as
//! its only ordering primitive.

pub(crate) mod consumer;
pub(crate) mod decomposer;
pub(crate) mod humus;
pub(crate) mod river;
pub(crate) mod soil;
pub(crate) mod stream;
pub(crate) mod wind;

pub use consumer::{AckDecision, ConsumerHandle, RecordHandler};
pub use decomposer::{Decomposer, DecomposerState};
pub use humus::{Compost, CompostAction, Humus};
pub use river::River;
pub use soil::{Soil, SoilEvent, SoilWatchHandle, SoilWatcher, StateEntry, UNCHECKED_REVISION};
pub use stream::{DurableStream, StreamConfig, StreamRecord};
pub use wind::{LeafListener, SubscriptionHandle, Wind};
