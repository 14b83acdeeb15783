//! Declarative forest configuration.
//!
//! A JSON5 document with one section per component kind. `${VAR}`
//! references anywhere in the document are substituted from the process
//! environment at load time; a missing variable fails validation before
//! any I/O happens.

use crate::control_plane::descriptor::{
    ComponentDescriptor, ComponentSpec, NimSpec, SongbirdSpec, SourceSpec, TreeHouseSpec, TreeSpec,
};
use crate::status::{ErrorKind, ForestError};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ForestConfig {
    #[serde(default)]
    pub sources: BTreeMap<String, SourceSpec>,
    #[serde(default)]
    pub trees: BTreeMap<String, TreeSpec>,
    #[serde(default)]
    pub treehouses: BTreeMap<String, TreeHouseSpec>,
    #[serde(default)]
    pub nims: BTreeMap<String, NimSpec>,
    #[serde(default)]
    pub songbirds: BTreeMap<String, SongbirdSpec>,
}

impl ForestConfig {
    pub fn parse(raw: &str) -> Result<Self, ForestError> {
        let substituted = substitute_env(raw)?;
        let config: ForestConfig = json5::from_str(&substituted).map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::ConfigInvalid, format!("unparsable config: {err}"))
        })?;
        for descriptor in config.descriptors() {
            descriptor.validate()?;
        }
        Ok(config)
    }

    /// Descriptors in start order: producers (sources) last.
    pub fn descriptors(&self) -> Vec<ComponentDescriptor> {
        let mut descriptors = Vec::new();
        for (name, spec) in &self.songbirds {
            descriptors.push(ComponentDescriptor {
                name: name.clone(),
                spec: ComponentSpec::Songbird(spec.clone()),
            });
        }
        for (name, spec) in &self.trees {
            descriptors.push(ComponentDescriptor {
                name: name.clone(),
                spec: ComponentSpec::Tree(spec.clone()),
            });
        }
        for (name, spec) in &self.treehouses {
            descriptors.push(ComponentDescriptor {
                name: name.clone(),
                spec: ComponentSpec::TreeHouse(spec.clone()),
            });
        }
        for (name, spec) in &self.nims {
            descriptors.push(ComponentDescriptor {
                name: name.clone(),
                spec: ComponentSpec::Nim(spec.clone()),
            });
        }
        for (name, spec) in &self.sources {
            descriptors.push(ComponentDescriptor {
                name: name.clone(),
                spec: ComponentSpec::Source(spec.clone()),
            });
        }
        descriptors
    }
}

/// Loads and validates a config document from disk.
pub fn load_config(path: impl AsRef<Path>) -> Result<ForestConfig, ForestError> {
    let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
        ForestError::fail_with_kind(
            ErrorKind::ConfigInvalid,
            format!("unable to read config {}: {err}", path.as_ref().display()),
        )
    })?;
    ForestConfig::parse(&raw)
}

fn substitute_env(raw: &str) -> Result<String, ForestError> {
    let reference = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    let mut missing = Vec::new();
    let substituted = reference.replace_all(raw, |captures: &regex::Captures<'_>| {
        match std::env::var(&captures[1]) {
            Ok(value) => value,
            Err(_) => {
                missing.push(captures[1].to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        return Err(ForestError::fail_with_kind(
            ErrorKind::ConfigInvalid,
            format!("undefined environment variables: {}", missing.join(", ")),
        ));
    }
    Ok(substituted.into_owned())
}
