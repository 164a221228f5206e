use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::artifact::{ArtifactType, Payload, Table};
use crate::error::RegistryError;
use crate::params::{ParamSchema, ParamSpec, ResolvedParams};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Bad parameters or bad input data. Retrying cannot help.
    Deterministic,
    /// Resource exhaustion and the like; worth another attempt when the
    /// definition allows it.
    Transient,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Deterministic => "deterministic",
            FailureKind::Transient => "transient",
            FailureKind::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn deterministic(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Deterministic,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "cancellation requested".to_string(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a stage implementation gets to see besides its inputs.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub node: String,
    run: CancelToken,
    call: CancelToken,
}

impl StageContext {
    pub fn new(node: impl Into<String>, run: CancelToken) -> Self {
        Self {
            node: node.into(),
            run,
            call: CancelToken::new(),
        }
    }

    /// Token that cancels this invocation only (used for timeouts).
    pub fn call_token(&self) -> CancelToken {
        self.call.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.is_cancelled() || self.call.is_cancelled()
    }

    /// Long-running implementations call this between units of work.
    pub fn checkpoint(&self) -> Result<(), StageFailure> {
        if self.is_cancelled() {
            Err(StageFailure::cancelled())
        } else {
            Ok(())
        }
    }
}

/// Named inputs bound for one invocation, in slot order.
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    entries: Vec<(String, Arc<Payload>)>,
}

impl StageInputs {
    pub fn new(entries: Vec<(String, Arc<Payload>)>) -> Self {
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&Payload> {
        self.entries
            .iter()
            .find(|(slot, _)| slot == name)
            .map(|(_, payload)| payload.as_ref())
    }

    pub fn table(&self, name: &str) -> Result<&Table, StageFailure> {
        self.get(name)
            .and_then(Payload::as_table)
            .ok_or_else(|| StageFailure::deterministic(format!("input '{name}' is not a table")))
    }

    pub fn labels(&self, name: &str) -> Result<&[u32], StageFailure> {
        self.get(name)
            .and_then(Payload::as_labels)
            .ok_or_else(|| StageFailure::deterministic(format!("input '{name}' is not a label vector")))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The single capability every algorithm provides. Implementations must not
/// cache or persist anything themselves.
pub trait StageImplementation: Send + Sync {
    fn execute(
        &self,
        inputs: &StageInputs,
        params: &ResolvedParams,
        ctx: &StageContext,
    ) -> Result<Payload, StageFailure>;
}

impl<F> StageImplementation for F
where
    F: Fn(&StageInputs, &ResolvedParams, &StageContext) -> Result<Payload, StageFailure>
        + Send
        + Sync,
{
    fn execute(
        &self,
        inputs: &StageInputs,
        params: &ResolvedParams,
        ctx: &StageContext,
    ) -> Result<Payload, StageFailure> {
        self(inputs, params, ctx)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputSlot {
    pub name: String,
    pub artifact_type: ArtifactType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageDefinition {
    pub name: String,
    pub version: u32,
    pub description: String,
    pub inputs: Vec<InputSlot>,
    pub output: ArtifactType,
    pub params: ParamSchema,
    pub stochastic: bool,
    pub timeout: Option<Duration>,
    /// Only retryable definitions are ever re-attempted, and only on
    /// transient failures.
    pub retryable: bool,
    pub retry: RetryPolicy,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, version: u32, output: ArtifactType) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            inputs: Vec::new(),
            output,
            params: ParamSchema::default(),
            stochastic: false,
            timeout: None,
            retryable: false,
            retry: RetryPolicy::none(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn input(mut self, name: impl Into<String>, artifact_type: ArtifactType) -> Self {
        self.inputs.push(InputSlot {
            name: name.into(),
            artifact_type,
        });
        self
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        let mut specs = self.params.specs().to_vec();
        specs.push(spec);
        self.params = ParamSchema::new(specs);
        self
    }

    pub fn stochastic(mut self) -> Self {
        self.stochastic = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retryable(mut self, policy: RetryPolicy) -> Self {
        self.retryable = true;
        self.retry = policy;
        self
    }

    pub fn id(&self) -> String {
        format!("{}@v{}", self.name, self.version)
    }
}

#[derive(Clone)]
pub struct RegisteredStage {
    pub definition: Arc<StageDefinition>,
    pub implementation: Arc<dyn StageImplementation>,
}

impl fmt::Debug for RegisteredStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredStage")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Catalogue of stage implementations keyed by (name, version). Adding an
/// algorithm means registering another entry.
#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: BTreeMap<String, BTreeMap<u32, RegisteredStage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I>(
        &mut self,
        definition: StageDefinition,
        implementation: I,
    ) -> Result<(), RegistryError>
    where
        I: StageImplementation + 'static,
    {
        let mut seen = HashSet::new();
        for spec in definition.params.specs() {
            if !seen.insert(spec.name.as_str()) {
                return Err(RegistryError::DuplicateParameter {
                    name: definition.name.clone(),
                    param: spec.name.clone(),
                });
            }
        }
        if definition.stochastic && !definition.params.has_seed() {
            return Err(RegistryError::MissingSeed {
                name: definition.name.clone(),
            });
        }

        let versions = self.stages.entry(definition.name.clone()).or_default();
        if versions.contains_key(&definition.version) {
            return Err(RegistryError::Duplicate {
                name: definition.name.clone(),
                version: definition.version,
            });
        }
        tracing::debug!(stage = %definition.name, version = definition.version, "Registered stage");
        versions.insert(
            definition.version,
            RegisteredStage {
                definition: Arc::new(definition),
                implementation: Arc::new(implementation),
            },
        );
        Ok(())
    }

    /// Closure form of [`register`](Self::register); lets argument types be
    /// inferred at the call site.
    pub fn register_fn<F>(&mut self, definition: StageDefinition, f: F) -> Result<(), RegistryError>
    where
        F: Fn(&StageInputs, &ResolvedParams, &StageContext) -> Result<Payload, StageFailure>
            + Send
            + Sync
            + 'static,
    {
        self.register(definition, f)
    }

    pub fn get(&self, name: &str, version: u32) -> Option<&RegisteredStage> {
        self.stages.get(name)?.get(&version)
    }

    pub fn latest(&self, name: &str) -> Option<&RegisteredStage> {
        self.stages.get(name)?.values().next_back()
    }

    pub fn versions(&self, name: &str) -> Option<Vec<u32>> {
        self.stages.get(name).map(|v| v.keys().copied().collect())
    }

    pub fn known_stages(&self) -> Vec<String> {
        self.stages.keys().cloned().collect()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages
            .values()
            .flat_map(|versions| versions.values())
            .map(|stage| stage.definition.as_ref())
    }

    /// Apply per-stage overrides from configuration to every registered
    /// version of `name`. `max_attempts` only applies to retryable versions;
    /// the others keep running once and a warning is logged.
    pub fn override_policy(&mut self, name: &str, timeout: Option<Duration>, max_attempts: Option<u32>) {
        let Some(versions) = self.stages.get_mut(name) else {
            tracing::warn!(stage = name, "Ignoring configuration for unknown stage");
            return;
        };
        for stage in versions.values_mut() {
            let mut definition = stage.definition.as_ref().clone();
            if timeout.is_some() {
                definition.timeout = timeout;
            }
            if let Some(attempts) = max_attempts {
                if definition.retryable {
                    definition.retry = definition.retry.clone().with_attempts(attempts);
                } else {
                    tracing::warn!(
                        stage = %definition.id(),
                        max_attempts = attempts,
                        "Ignoring max_attempts for a stage that is not retryable"
                    );
                }
            }
            stage.definition = Arc::new(definition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamSpec;

    fn noop(_: &StageInputs, _: &ResolvedParams, _: &StageContext) -> Result<Payload, StageFailure> {
        Ok(Payload::Labels(Vec::new()))
    }

    #[test]
    fn registry_rejects_duplicates_and_unseeded_stochastic_stages() {
        let mut registry = StageRegistry::new();
        let def = StageDefinition::new("cluster", 1, ArtifactType::Labels)
            .input("data", ArtifactType::Table)
            .param(ParamSpec::seed())
            .stochastic();
        registry.register(def.clone(), noop).unwrap();
        assert_eq!(
            registry.register(def, noop),
            Err(RegistryError::Duplicate {
                name: "cluster".into(),
                version: 1
            })
        );

        let unseeded = StageDefinition::new("embed", 1, ArtifactType::Embedding).stochastic();
        assert_eq!(
            registry.register(unseeded, noop),
            Err(RegistryError::MissingSeed {
                name: "embed".into()
            })
        );
    }

    #[test]
    fn latest_picks_highest_version() {
        let mut registry = StageRegistry::new();
        for version in [1, 3, 2] {
            registry
                .register(StageDefinition::new("normalize", version, ArtifactType::Table), noop)
                .unwrap();
        }
        assert_eq!(registry.latest("normalize").unwrap().definition.version, 3);
        assert_eq!(registry.versions("normalize"), Some(vec![1, 2, 3]));
        assert!(registry.get("normalize", 4).is_none());
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let run = CancelToken::new();
        let ctx = StageContext::new("n1", run.clone());
        assert!(ctx.checkpoint().is_ok());
        run.cancel();
        assert_eq!(ctx.checkpoint().unwrap_err().kind, FailureKind::Cancelled);
    }
}
