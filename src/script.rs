//! Small named scripts applied to extracted values.
//!
//! Scripts live under the `_script` sub-node of the level they apply to,
//! keyed by the field they post-process. A missing script is an identity
//! passthrough of the `source` variable. Script failures never propagate:
//! they are logged and produce an empty string.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use rhai::{Dynamic, Engine, Map, Scope};

use crate::config::{ConfigError, ConfigNode, SCRIPT_NODE};
use crate::substitution::{Substitutor, Variables};

/// Variable holding the value being transformed.
pub const SOURCE_VAR: &str = "source";

/// Configuration key selecting the backend.
pub const ENGINE_KEY: &str = "script.engine";

const MAX_OPERATIONS: u64 = 200_000;

/// Scripting backends, selected by name from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptBackend {
    /// The substituted body is the result
    Identity,
    /// Body is evaluated as a Rhai expression/program
    #[default]
    Rhai,
}

impl FromStr for ScriptBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "none" | "template" => Ok(ScriptBackend::Identity),
            "rhai" => Ok(ScriptBackend::Rhai),
            other => Err(format!("unknown script engine '{}'", other)),
        }
    }
}

impl fmt::Display for ScriptBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptBackend::Identity => write!(f, "identity"),
            ScriptBackend::Rhai => write!(f, "rhai"),
        }
    }
}

/// Evaluates `_script` entries against a value and local variables.
#[derive(Clone)]
pub struct ScriptEngine {
    backend: ScriptBackend,
    engine: Arc<Engine>,
    substitutor: Substitutor,
}

impl fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("backend", &self.backend)
            .finish()
    }
}

impl ScriptEngine {
    pub fn new(backend: ScriptBackend, substitutor: Substitutor) -> Self {
        Self {
            backend,
            engine: Arc::new(build_engine()),
            substitutor,
        }
    }

    /// Select the backend from `script.engine` (default: rhai).
    pub fn from_config(config: &ConfigNode, substitutor: Substitutor) -> Result<Self, ConfigError> {
        let backend = match config.literal(ENGINE_KEY) {
            None => ScriptBackend::default(),
            Some(name) => name.parse().map_err(|reason| ConfigError::InvalidValue {
                key: ENGINE_KEY.to_string(),
                reason,
            })?,
        };
        Ok(Self::new(backend, substitutor))
    }

    pub fn backend(&self) -> ScriptBackend {
        self.backend
    }

    /// Whether `settings` defines a script for `key`.
    pub fn has_script(settings: &ConfigNode, key: &str) -> bool {
        script_body(settings, key).is_some()
    }

    /// Evaluate the script stored at `_script.<key>` under `settings`.
    ///
    /// `vars` must carry the value being transformed under `source`.
    pub fn evaluate(&self, settings: &ConfigNode, key: &str, vars: &Variables) -> String {
        match script_body(settings, key) {
            Some(body) => self.run(key, body, vars),
            None => vars.get(SOURCE_VAR).cloned().unwrap_or_default(),
        }
    }

    /// Convenience wrapper binding `value` as `source`.
    pub fn apply(&self, settings: &ConfigNode, key: &str, value: &str, vars: &Variables) -> String {
        if !Self::has_script(settings, key) {
            return value.to_string();
        }
        let mut scoped = vars.clone();
        scoped.insert(SOURCE_VAR.to_string(), value.to_string());
        self.evaluate(settings, key, &scoped)
    }

    fn run(&self, key: &str, body: &str, vars: &Variables) -> String {
        let script = match self.substitutor.resolve(body, vars) {
            Ok(script) => script,
            Err(e) => {
                tracing::warn!("Script '{}' substitution failed: {}", key, e);
                return String::new();
            }
        };

        match self.backend {
            ScriptBackend::Identity => script,
            ScriptBackend::Rhai => {
                let mut scope = build_scope(vars);
                match self.engine.eval_with_scope::<Dynamic>(&mut scope, &script) {
                    Ok(value) => dynamic_to_string(value),
                    Err(e) => {
                        tracing::warn!("Script '{}' failed: {}", key, e);
                        String::new()
                    }
                }
            }
        }
    }
}

fn script_body<'a>(settings: &'a ConfigNode, key: &str) -> Option<&'a str> {
    settings
        .node(SCRIPT_NODE)
        .and_then(|scripts| scripts.literal(key))
        .filter(|body| !body.trim().is_empty())
}

fn build_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);

    engine.register_fn(
        "regex_replace",
        |text: &str, pattern: &str, replacement: &str| -> Result<String, Box<rhai::EvalAltResult>> {
            let re = Regex::new(pattern).map_err(|e| e.to_string())?;
            Ok(re.replace_all(text, replacement).into_owned())
        },
    );
    engine.register_fn(
        "regex_find",
        |text: &str, pattern: &str| -> Result<String, Box<rhai::EvalAltResult>> {
            let re = Regex::new(pattern).map_err(|e| e.to_string())?;
            Ok(re
                .find(text)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default())
        },
    );
    engine
}

fn build_scope(vars: &Variables) -> Scope<'static> {
    let mut scope = Scope::new();
    let mut all = Map::new();
    for (name, value) in vars {
        all.insert(name.as_str().into(), Dynamic::from(value.clone()));
        if is_identifier(name) {
            scope.push(name.clone(), value.clone());
        }
    }
    scope.push("vars", all);
    scope
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name != "vars" && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn dynamic_to_string(value: Dynamic) -> String {
    if value.is_unit() {
        String::new()
    } else if value.is_string() {
        value.into_string().unwrap_or_default()
    } else {
        value.to_string()
    }
}
