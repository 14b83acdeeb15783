//! The descriptor table: single source of truth for component identity and
//! lifecycle state. Mutation is serialized behind the entry lock; status
//! readers load a lock-free snapshot.

use crate::control_plane::descriptor::{ComponentDescriptor, ComponentKind};
use crate::runtime::nim::Nim;
use crate::runtime::songbird::Songbird;
use crate::runtime::source::Source;
use crate::runtime::tree::Tree;
use crate::runtime::treehouse::TreeHouse;
use crate::status::{ErrorKind, ForestError};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// One row of the status snapshot served by the management API.
#[derive(Clone, Debug, Serialize)]
pub struct ComponentStatus {
    pub kind: ComponentKind,
    pub name: String,
    pub state: ComponentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// The live half of a table entry.
pub(crate) enum RunningComponent {
    Tree(Tree),
    TreeHouse(TreeHouse),
    Nim(Nim),
    Source(Arc<dyn Source>),
    Songbird(Arc<dyn Songbird>),
}

impl std::fmt::Debug for RunningComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            RunningComponent::Tree(_) => "Tree",
            RunningComponent::TreeHouse(_) => "TreeHouse",
            RunningComponent::Nim(_) => "Nim",
            RunningComponent::Source(_) => "Source",
            RunningComponent::Songbird(_) => "Songbird",
        };
        f.debug_tuple(variant).finish()
    }
}

impl RunningComponent {
    pub(crate) async fn stop(&self) {
        match self {
            RunningComponent::Tree(tree) => tree.stop().await,
            RunningComponent::TreeHouse(treehouse) => treehouse.stop().await,
            RunningComponent::Nim(nim) => nim.stop().await,
            RunningComponent::Source(source) => source.stop().await,
            // Songbirds hold no subscriptions; deregistration is enough.
            RunningComponent::Songbird(_) => {}
        }
    }
}

#[derive(Debug)]
pub(crate) struct ComponentEntry {
    pub(crate) descriptor: ComponentDescriptor,
    pub(crate) state: ComponentState,
    pub(crate) last_error: Option<String>,
    pub(crate) runner: Option<RunningComponent>,
}

/// Table keyed by `(kind, name)` with snapshot reads.
pub(crate) struct DescriptorTable {
    entries: Mutex<HashMap<(ComponentKind, String), ComponentEntry>>,
    snapshot: ArcSwap<Vec<ComponentStatus>>,
}

impl DescriptorTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub(crate) async fn entries(
        &self,
    ) -> tokio::sync::MutexGuard<'_, HashMap<(ComponentKind, String), ComponentEntry>> {
        self.entries.lock().await
    }

    /// Reserves a `(kind, name)` slot in `Created` state; a live entry with
    /// the same identity is a name conflict.
    pub(crate) async fn reserve(
        &self,
        descriptor: ComponentDescriptor,
    ) -> Result<(), ForestError> {
        let key = (descriptor.kind(), descriptor.name.clone());
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&key) {
            return Err(ForestError::fail_with_kind(
                ErrorKind::NameConflict,
                format!("{} {:?} already registered", key.0, key.1),
            ));
        }
        entries.insert(
            key,
            ComponentEntry {
                descriptor,
                state: ComponentState::Created,
                last_error: None,
                runner: None,
            },
        );
        self.rebuild_snapshot(&entries);
        Ok(())
    }

    pub(crate) async fn update(
        &self,
        kind: ComponentKind,
        name: &str,
        state: ComponentState,
        last_error: Option<String>,
        runner: Option<RunningComponent>,
    ) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&(kind, name.to_string())) {
            entry.state = state;
            entry.last_error = last_error;
            entry.runner = runner;
        }
        self.rebuild_snapshot(&entries);
    }

    pub(crate) async fn take(
        &self,
        kind: ComponentKind,
        name: &str,
    ) -> Result<ComponentEntry, ForestError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.remove(&(kind, name.to_string())).ok_or_else(|| {
            ForestError::fail_with_kind(
                ErrorKind::NotFound,
                format!("no {kind} named {name:?}"),
            )
        })?;
        self.rebuild_snapshot(&entries);
        Ok(entry)
    }

    pub(crate) async fn descriptors(&self, kind: ComponentKind) -> Vec<ComponentDescriptor> {
        let entries = self.entries.lock().await;
        let mut descriptors: Vec<ComponentDescriptor> = entries
            .values()
            .filter(|entry| entry.descriptor.kind() == kind)
            .map(|entry| entry.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Lock-free status read; at most one descriptor per `(kind, name)` is
    /// observable at any moment.
    pub(crate) fn status(&self) -> Vec<ComponentStatus> {
        self.snapshot.load().as_ref().clone()
    }

    fn rebuild_snapshot(&self, entries: &HashMap<(ComponentKind, String), ComponentEntry>) {
        let mut statuses: Vec<ComponentStatus> = entries
            .values()
            .map(|entry| ComponentStatus {
                kind: entry.descriptor.kind(),
                name: entry.descriptor.name.clone(),
                state: entry.state,
                last_error: entry.last_error.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| (a.kind.as_str(), &a.name).cmp(&(b.kind.as_str(), &b.name)));
        self.snapshot.store(Arc::new(statuses));
    }
}
