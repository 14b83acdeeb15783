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

//! Component execution layer.
//!
//! Drives user components against the substrate: artifact loading (rhai
//! scripts and prompt templates), the Tree / TreeHouse / Nim message loops,
//! the three Source variants, the Songbird contract, and the conductor that
//! beats `dance.beat`. Spawn and deadline policy is isolated in `worker` so
//! async behavior stays localized.

pub(crate) mod artifact;
pub(crate) mod asker;
pub(crate) mod ceremony;
pub(crate) mod nim;
pub(crate) mod poll;
pub(crate) mod songbird;
pub(crate) mod source;
pub(crate) mod tree;
pub(crate) mod treehouse;
pub(crate) mod webhook;
pub(crate) mod worker;

pub use artifact::{ArtifactLoader, LeafSpec, PromptArtifact, ScriptArtifact};
pub use asker::{AiAsker, HttpAsker};
pub use ceremony::{CeremonyPayload, CeremonySource, Conductor};
pub use nim::{ActionOutcome, AgentSpec, AutomationResult, Automator, Nim, NimContext};
pub use poll::HttpPollSource;
pub use songbird::{response_subject, Songbird, SongbirdMessage, TracingSongbird};
pub use source::Source;
pub use tree::Tree;
pub use treehouse::TreeHouse;
pub use webhook::{HttpWebhookSource, SignatureVerifier, WebhookServer};
