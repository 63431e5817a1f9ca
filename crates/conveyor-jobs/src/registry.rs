//! Job registry: kind name -> handler, deadline and declared parameters.
//!
//! The registry is populated once at process start and shared read-only
//! (behind an `Arc`) by the dispatcher and every worker.

use crate::error::{JobError, JobsResult};
use crate::job::JobArguments;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default execution deadline when a definition does not set one.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

/// Domain failure reported by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub message: String,
    pub detail: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    /// Attaches structured detail.
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Executable logic for one job kind.
///
/// Handlers are synchronous and may block (disk I/O, decoding); the worker
/// pool runs them on the blocking thread pool. They must tolerate being run
/// more than once for the same job id.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, args: &JobArguments) -> Result<Value, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&JobArguments) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    fn call(&self, args: &JobArguments) -> Result<Value, HandlerError> {
        self(args)
    }
}

/// Value type accepted for a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl ArgType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ArgType::String => value.is_string(),
            ArgType::Integer => value.is_i64() || value.is_u64(),
            ArgType::Number => value.is_number(),
            ArgType::Boolean => value.is_boolean(),
            ArgType::Object => value.is_object(),
            ArgType::Array => value.is_array(),
            ArgType::Any => true,
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgType::String => "string",
            ArgType::Integer => "integer",
            ArgType::Number => "number",
            ArgType::Boolean => "boolean",
            ArgType::Object => "object",
            ArgType::Array => "array",
            ArgType::Any => "any",
        };
        f.write_str(name)
    }
}

/// A declared handler parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ArgType,
    pub required: bool,
}

/// Builder for a registry entry.
pub struct KindDefinition {
    kind: String,
    handler: Arc<dyn Handler>,
    deadline: Duration,
    params: Vec<ParamSpec>,
}

impl KindDefinition {
    /// Starts a definition with the default deadline and no parameters.
    pub fn new(kind: impl Into<String>, handler: impl Handler) -> Self {
        Self {
            kind: kind.into(),
            handler: Arc::new(handler),
            deadline: DEFAULT_DEADLINE,
            params: Vec::new(),
        }
    }

    /// Sets the execution deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Declares a required parameter.
    pub fn param(mut self, name: impl Into<String>, ty: ArgType) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            ty,
            required: true,
        });
        self
    }

    /// Declares an optional parameter.
    pub fn optional(mut self, name: impl Into<String>, ty: ArgType) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            ty,
            required: false,
        });
        self
    }
}

/// A registered kind.
#[derive(Clone)]
pub struct RegistryEntry {
    kind: String,
    handler: Arc<dyn Handler>,
    deadline: Duration,
    params: Vec<ParamSpec>,
}

impl RegistryEntry {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.handler)
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Checks arity and types of `args` against the declared parameters.
    pub fn validate(&self, args: &JobArguments) -> JobsResult<()> {
        for spec in &self.params {
            match args.get(&spec.name) {
                Some(value) if !spec.ty.matches(value) => {
                    return Err(JobError::invalid_arguments(
                        &self.kind,
                        format!("parameter '{}' must be of type {}", spec.name, spec.ty),
                    ));
                }
                None if spec.required => {
                    return Err(JobError::invalid_arguments(
                        &self.kind,
                        format!("missing parameter '{}'", spec.name),
                    ));
                }
                _ => {}
            }
        }

        if let Some((name, _)) = args
            .iter()
            .find(|(name, _)| !self.params.iter().any(|p| &p.name == *name))
        {
            return Err(JobError::invalid_arguments(
                &self.kind,
                format!("unexpected parameter '{}'", name),
            ));
        }

        Ok(())
    }

    /// Serializable summary.
    pub fn descriptor(&self) -> KindDescriptor {
        KindDescriptor {
            kind: self.kind.clone(),
            deadline_ms: self.deadline.as_millis() as u64,
            params: self.params.clone(),
        }
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("kind", &self.kind)
            .field("deadline", &self.deadline)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Public description of a registered kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindDescriptor {
    pub kind: String,
    pub deadline_ms: u64,
    pub params: Vec<ParamSpec>,
}

/// Lookup table from kind name to registry entry.
#[derive(Debug, Default)]
pub struct JobRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers a kind. Fails if the kind is already present.
    pub fn register(&mut self, definition: KindDefinition) -> JobsResult<()> {
        if self.entries.contains_key(&definition.kind) {
            return Err(JobError::DuplicateKind(definition.kind));
        }
        if definition.deadline.is_zero() {
            return Err(JobError::Configuration(format!(
                "Deadline for job kind {} must be greater than zero",
                definition.kind
            )));
        }

        info!(
            kind = %definition.kind,
            deadline_ms = definition.deadline.as_millis() as u64,
            params = definition.params.len(),
            "Registered job kind"
        );

        let entry = RegistryEntry {
            kind: definition.kind.clone(),
            handler: definition.handler,
            deadline: definition.deadline,
            params: definition.params,
        };
        self.entries.insert(definition.kind, entry);
        Ok(())
    }

    /// Resolves a kind.
    pub fn lookup(&self, kind: &str) -> JobsResult<&RegistryEntry> {
        self.entries
            .get(kind)
            .ok_or_else(|| JobError::UnknownKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptors of all registered kinds, sorted by name.
    pub fn kinds(&self) -> Vec<KindDescriptor> {
        let mut kinds: Vec<KindDescriptor> =
            self.entries.values().map(RegistryEntry::descriptor).collect();
        kinds.sort_by(|a, b| a.kind.cmp(&b.kind));
        kinds
    }
}
