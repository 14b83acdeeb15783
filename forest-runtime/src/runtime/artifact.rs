//! Artifact loading: rhai scripts for Trees and TreeHouses, prompt
//! templates for Nims.
//!
//! Scripts are compiled once at component start and executed with a fresh
//! scope per call; no host bindings for time or randomness are registered,
//! so a well-formed script stays a pure function of its input. Changing an
//! artifact on disk takes effect only when its component is restarted.

use crate::status::{ErrorKind, ForestError};
use regex::Regex;
use rhai::{Dynamic, Engine, Scope, AST};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Ceiling on script operations per invocation; bounds runaway loops.
const MAX_SCRIPT_OPERATIONS: u64 = 1_000_000;

/// One Leaf produced by a script or a Nim reply: an optional subject
/// (defaulting to the component's output subject) and a JSON payload.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LeafSpec {
    #[serde(default)]
    pub subject: Option<String>,
    pub payload: serde_json::Value,
}

/// Resolves artifact references relative to a base directory and loads them.
pub struct ArtifactLoader {
    base_dir: PathBuf,
}

impl ArtifactLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, artifact_ref: &str) -> PathBuf {
        let path = Path::new(artifact_ref);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn load_script(&self, artifact_ref: &str) -> Result<Arc<ScriptArtifact>, ForestError> {
        ScriptArtifact::load(&self.resolve(artifact_ref)).map(Arc::new)
    }

    pub fn load_prompt(&self, artifact_ref: &str) -> Result<Arc<PromptArtifact>, ForestError> {
        PromptArtifact::load(&self.resolve(artifact_ref)).map(Arc::new)
    }
}

/// A compiled rhai script exposing `parse(subject, body)` (Trees) or
/// `process(leaf)` (TreeHouses).
pub struct ScriptArtifact {
    engine: Engine,
    ast: AST,
}

impl std::fmt::Debug for ScriptArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptArtifact").finish_non_exhaustive()
    }
}

impl ScriptArtifact {
    pub fn load(path: &Path) -> Result<Self, ForestError> {
        let source = std::fs::read_to_string(path).map_err(|err| {
            ForestError::fail_with_kind(
                ErrorKind::ArtifactNotFound,
                format!("unable to read script {}: {err}", path.display()),
            )
        })?;
        Self::compile(&source)
    }

    pub fn compile(source: &str) -> Result<Self, ForestError> {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_SCRIPT_OPERATIONS);
        let ast = engine.compile(source).map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Script, format!("compile failed: {err}"))
        })?;
        Ok(Self { engine, ast })
    }

    /// Tree entry point: `parse(subject, body)` where `body` is the record
    /// payload as a JSON value when it parses, a string otherwise.
    pub fn parse(&self, subject: &str, payload: &[u8]) -> Result<Vec<LeafSpec>, ForestError> {
        let body = payload_dynamic(payload)?;
        self.call("parse", (Dynamic::from(subject.to_string()), body))
    }

    /// TreeHouse entry point: `process(leaf)` with a map of subject,
    /// payload, source, and timestamp.
    pub fn process(&self, leaf: serde_json::Value) -> Result<Vec<LeafSpec>, ForestError> {
        let value = rhai::serde::to_dynamic(&leaf).map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Script, format!("leaf conversion: {err}"))
        })?;
        self.call("process", (value,))
    }

    /// Ceremony entry point: `trigger(beat)` returning an arbitrary JSON
    /// payload for the flow.
    pub fn trigger(&self, beat: u64) -> Result<serde_json::Value, ForestError> {
        let mut scope = Scope::new();
        let result: Dynamic = self
            .engine
            .call_fn(&mut scope, &self.ast, "trigger", (beat as i64,))
            .map_err(|err| {
                ForestError::fail_with_kind(ErrorKind::Script, format!("trigger raised: {err}"))
            })?;
        rhai::serde::from_dynamic(&result).map_err(|err| {
            ForestError::fail_with_kind(
                ErrorKind::Script,
                format!("trigger returned an unusable value: {err}"),
            )
        })
    }

    fn call(
        &self,
        entry: &str,
        args: impl rhai::FuncArgs,
    ) -> Result<Vec<LeafSpec>, ForestError> {
        let mut scope = Scope::new();
        let result: Dynamic = self
            .engine
            .call_fn(&mut scope, &self.ast, entry, args)
            .map_err(|err| {
                ForestError::fail_with_kind(ErrorKind::Script, format!("{entry} raised: {err}"))
            })?;
        if result.is_unit() {
            return Ok(Vec::new());
        }
        rhai::serde::from_dynamic::<Vec<LeafSpec>>(&result).map_err(|err| {
            ForestError::fail_with_kind(
                ErrorKind::Script,
                format!("{entry} returned an unusable value: {err}"),
            )
        })
    }
}

fn payload_dynamic(payload: &[u8]) -> Result<Dynamic, ForestError> {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
        rhai::serde::to_dynamic(&value).map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Script, format!("payload conversion: {err}"))
        })
    } else {
        Ok(Dynamic::from(
            String::from_utf8_lossy(payload).to_string(),
        ))
    }
}

/// A prompt template with `{{field.path}}` placeholders resolved against
/// the triggering Leaf's JSON payload. Unresolvable placeholders render
/// empty.
pub struct PromptArtifact {
    template: String,
}

impl PromptArtifact {
    pub fn load(path: &Path) -> Result<Self, ForestError> {
        let template = std::fs::read_to_string(path).map_err(|err| {
            ForestError::fail_with_kind(
                ErrorKind::ArtifactNotFound,
                format!("unable to read prompt {}: {err}", path.display()),
            )
        })?;
        Ok(Self::from_template(template))
    }

    pub fn from_template(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, payload: &serde_json::Value) -> String {
        static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
        let placeholder = PLACEHOLDER
            .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("valid regex"));
        placeholder
            .replace_all(&self.template, |captures: &regex::Captures<'_>| {
                lookup(payload, &captures[1])
            })
            .into_owned()
    }
}

fn lookup(payload: &serde_json::Value, dotted_path: &str) -> String {
    let mut current = payload;
    for token in dotted_path.split('.') {
        match current.get(token) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    match current {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
