use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::artifact::{ArtifactKey, ArtifactType, InputFingerprint, compute_key};
use crate::error::ValidationError;
use crate::params::{ResolvedParams, StageParameters};
use crate::registry::{StageDefinition, StageImplementation, StageRegistry};

/// Where one input of a stage comes from. Written `sample:<id>` or
/// `stage:<id>`; a bare id refers to a stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum InputRef {
    Sample(String),
    Stage(String),
}

impl TryFrom<String> for InputRef {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        match raw.split_once(':') {
            Some(("sample", id)) if !id.is_empty() => Ok(InputRef::Sample(id.to_string())),
            Some(("stage", id)) if !id.is_empty() => Ok(InputRef::Stage(id.to_string())),
            Some(_) => Err(format!(
                "input '{raw}' must be written 'sample:<id>', 'stage:<id>' or '<id>'"
            )),
            None if raw.is_empty() => Err("input reference is empty".to_string()),
            None => Ok(InputRef::Stage(raw)),
        }
    }
}

impl From<InputRef> for String {
    fn from(input: InputRef) -> Self {
        input.to_string()
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputRef::Sample(id) => write!(f, "sample:{id}"),
            InputRef::Stage(id) => write!(f, "stage:{id}"),
        }
    }
}

/// One node as a pipeline author declares it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: StageParameters,
    #[serde(default)]
    pub inputs: Vec<InputRef>,
}

/// A registered raw sample as the graph sees it: id plus content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRef {
    pub id: String,
    pub content_hash: String,
}

/// A validated node: pinned definition, resolved parameters, wiring.
#[derive(Clone)]
pub struct StageInstance {
    pub id: String,
    pub index: usize,
    pub definition: Arc<StageDefinition>,
    pub implementation: Arc<dyn StageImplementation>,
    pub params: ResolvedParams,
    pub inputs: Vec<InputRef>,
}

impl fmt::Debug for StageInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageInstance")
            .field("id", &self.id)
            .field("stage", &self.definition.id())
            .field("params", &self.params)
            .field("inputs", &self.inputs)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineGraph {
    nodes: Vec<StageInstance>,
    index: HashMap<String, usize>,
    samples: BTreeMap<String, String>,
    order: Vec<usize>,
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl PipelineGraph {
    /// Validate `specs` against the registry and the registered samples. The
    /// checks run in a fixed order and the first violation is returned; no
    /// partial graph is ever produced.
    pub fn build(
        specs: &[StageSpec],
        samples: &[SampleRef],
        registry: &StageRegistry,
    ) -> Result<Self, ValidationError> {
        if specs.is_empty() {
            return Err(ValidationError::EmptyPipeline);
        }

        let mut index = HashMap::with_capacity(specs.len());
        for (idx, spec) in specs.iter().enumerate() {
            if !is_valid_id(&spec.id) {
                return Err(ValidationError::InvalidNodeId {
                    node: spec.id.clone(),
                });
            }
            if index.insert(spec.id.clone(), idx).is_some() {
                return Err(ValidationError::DuplicateNode {
                    node: spec.id.clone(),
                });
            }
        }

        // (a) definitions exist at a known version
        let mut bound = Vec::with_capacity(specs.len());
        for spec in specs {
            let stage = match spec.version {
                Some(version) => registry.get(&spec.stage, version).ok_or_else(|| {
                    match registry.versions(&spec.stage) {
                        Some(known) => ValidationError::UnknownVersion {
                            node: spec.id.clone(),
                            stage: spec.stage.clone(),
                            version,
                            known,
                        },
                        None => unknown_stage(spec, registry),
                    }
                })?,
                None => registry
                    .latest(&spec.stage)
                    .ok_or_else(|| unknown_stage(spec, registry))?,
            };
            bound.push(stage);
        }

        // (b) parameters satisfy the schema
        let mut resolved = Vec::with_capacity(specs.len());
        for (spec, stage) in specs.iter().zip(&bound) {
            let params = stage.definition.params.resolve(&spec.params).map_err(|source| {
                ValidationError::InvalidParameter {
                    node: spec.id.clone(),
                    source,
                }
            })?;
            resolved.push(params);
        }

        // (c) references resolve and the dependency graph is acyclic
        let sample_hashes: BTreeMap<String, String> = samples
            .iter()
            .map(|s| (s.id.clone(), s.content_hash.clone()))
            .collect();
        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut upstream = Vec::new();
            for input in &spec.inputs {
                match input {
                    InputRef::Sample(sample) if !sample_hashes.contains_key(sample) => {
                        return Err(ValidationError::UnknownSample {
                            node: spec.id.clone(),
                            sample: sample.clone(),
                        });
                    }
                    InputRef::Sample(_) => {}
                    InputRef::Stage(stage) => match index.get(stage) {
                        Some(&up) => upstream.push(up),
                        None => {
                            return Err(ValidationError::UnknownInput {
                                node: spec.id.clone(),
                                input: stage.clone(),
                            });
                        }
                    },
                }
            }
            deps.push(upstream);
        }
        detect_cycle(specs, &deps)?;

        // (d) arity and types match what upstream produces
        for (spec, stage) in specs.iter().zip(&bound) {
            let slots = &stage.definition.inputs;
            if slots.len() != spec.inputs.len() {
                return Err(ValidationError::ArityMismatch {
                    node: spec.id.clone(),
                    expected: slots.len(),
                    found: spec.inputs.len(),
                });
            }
            for (slot, input) in slots.iter().zip(&spec.inputs) {
                let produced = match input {
                    InputRef::Sample(_) => ArtifactType::Table,
                    InputRef::Stage(up) => bound[index[up]].definition.output,
                };
                if produced != slot.artifact_type {
                    return Err(ValidationError::TypeMismatch {
                        node: spec.id.clone(),
                        slot: slot.name.clone(),
                        expected: slot.artifact_type,
                        found: produced,
                    });
                }
            }
        }

        let nodes: Vec<StageInstance> = specs
            .iter()
            .zip(bound)
            .zip(resolved)
            .enumerate()
            .map(|(idx, ((spec, stage), params))| StageInstance {
                id: spec.id.clone(),
                index: idx,
                definition: Arc::clone(&stage.definition),
                implementation: Arc::clone(&stage.implementation),
                params,
                inputs: spec.inputs.clone(),
            })
            .collect();
        let order = kahn_order(&deps);

        Ok(Self {
            nodes,
            index,
            samples: sample_hashes,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[StageInstance] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&StageInstance> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn sample_hash(&self, id: &str) -> Option<&str> {
        self.samples.get(id).map(String::as_str)
    }

    /// Dependency order; ties go to the node declared first.
    pub fn topological_order(&self) -> Vec<&StageInstance> {
        self.order.iter().map(|&idx| &self.nodes[idx]).collect()
    }

    /// Indices of the stage nodes `idx` reads from directly.
    pub fn upstream_of(&self, idx: usize) -> Vec<usize> {
        self.nodes[idx]
            .inputs
            .iter()
            .filter_map(|input| match input {
                InputRef::Stage(id) => self.index.get(id).copied(),
                InputRef::Sample(_) => None,
            })
            .collect()
    }

    /// Every node that transitively depends on `idx`, in declaration order.
    pub fn downstream_of(&self, idx: usize) -> Vec<usize> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![idx];
        while let Some(current) = frontier.pop() {
            for candidate in 0..self.nodes.len() {
                if !found.contains(&candidate) && self.upstream_of(candidate).contains(&current) {
                    found.insert(candidate);
                    frontier.push(candidate);
                }
            }
        }
        found.into_iter().collect()
    }

    /// ArtifactKey of every node, indexed like [`nodes`](Self::nodes). Keys
    /// depend only on definitions, parameters and upstream keys, so the whole
    /// graph can be keyed before anything runs.
    pub fn compute_keys(&self) -> Vec<ArtifactKey> {
        let mut keys: Vec<Option<ArtifactKey>> = vec![None; self.nodes.len()];
        for &idx in &self.order {
            let node = &self.nodes[idx];
            let fingerprints: Vec<InputFingerprint> = node
                .inputs
                .iter()
                .filter_map(|input| match input {
                    InputRef::Sample(id) => {
                        self.samples.get(id).cloned().map(InputFingerprint::Sample)
                    }
                    InputRef::Stage(id) => self
                        .index
                        .get(id)
                        .and_then(|&up| keys[up].clone())
                        .map(InputFingerprint::Artifact),
                })
                .collect();
            keys[idx] = Some(compute_key(
                &node.definition.name,
                node.definition.version,
                &node.params,
                &fingerprints,
            ));
        }
        keys.into_iter().flatten().collect()
    }

    /// Specs with versions pinned and parameters fully resolved; this is the
    /// form persisted in a pipeline definition.
    pub fn pinned_specs(&self) -> Vec<StageSpec> {
        self.nodes
            .iter()
            .map(|node| StageSpec {
                id: node.id.clone(),
                stage: node.definition.name.clone(),
                version: Some(node.definition.version),
                params: node
                    .params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                inputs: node.inputs.clone(),
            })
            .collect()
    }
}

fn unknown_stage(spec: &StageSpec, registry: &StageRegistry) -> ValidationError {
    ValidationError::UnknownStage {
        node: spec.id.clone(),
        stage: spec.stage.clone(),
        available: registry.known_stages().join(", "),
    }
}

/// Depth-first search with an explicit recursion stack; reaching a node that
/// is still on the stack closes a cycle.
fn detect_cycle(specs: &[StageSpec], deps: &[Vec<usize>]) -> Result<(), ValidationError> {
    fn visit(
        idx: usize,
        deps: &[Vec<usize>],
        stack: &mut Vec<usize>,
        on_stack: &mut HashSet<usize>,
        done: &mut HashSet<usize>,
    ) -> Option<Vec<usize>> {
        if done.contains(&idx) {
            return None;
        }
        stack.push(idx);
        on_stack.insert(idx);
        for &up in &deps[idx] {
            if on_stack.contains(&up) {
                let start = stack.iter().position(|&n| n == up).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(up);
                return Some(cycle);
            }
            if let Some(cycle) = visit(up, deps, stack, on_stack, done) {
                return Some(cycle);
            }
        }
        stack.pop();
        on_stack.remove(&idx);
        done.insert(idx);
        None
    }

    let mut done = HashSet::new();
    for idx in 0..specs.len() {
        let mut stack = Vec::new();
        let mut on_stack = HashSet::new();
        if let Some(cycle) = visit(idx, deps, &mut stack, &mut on_stack, &mut done) {
            let path: Vec<String> = cycle.iter().map(|&n| specs[n].id.clone()).collect();
            return Err(ValidationError::Cycle {
                node: path[0].clone(),
                path,
            });
        }
    }
    Ok(())
}

fn kahn_order(deps: &[Vec<usize>]) -> Vec<usize> {
    let mut remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); deps.len()];
    for (idx, ups) in deps.iter().enumerate() {
        for &up in ups {
            dependents[up].push(idx);
        }
    }

    let mut ready: BTreeSet<usize> = (0..deps.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(deps.len());
    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for &next in &dependents[idx] {
            remaining[next] -= 1;
            if remaining[next] == 0 {
                ready.insert(next);
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_refs_parse_prefixes() {
        assert_eq!(
            InputRef::try_from("sample:S1".to_string()),
            Ok(InputRef::Sample("S1".into()))
        );
        assert_eq!(
            InputRef::try_from("stage:norm".to_string()),
            Ok(InputRef::Stage("norm".into()))
        );
        assert_eq!(
            InputRef::try_from("norm".to_string()),
            Ok(InputRef::Stage("norm".into()))
        );
        assert!(InputRef::try_from("file:x".to_string()).is_err());
        assert!(InputRef::try_from("sample:".to_string()).is_err());
    }

    #[test]
    fn kahn_breaks_ties_by_declaration_order() {
        // 0 <- 2, 1 <- 3, nodes 0 and 1 are roots
        let deps = vec![vec![], vec![], vec![0], vec![1], vec![2, 3]];
        assert_eq!(kahn_order(&deps), vec![0, 1, 2, 3, 4]);

        let deps = vec![vec![1], vec![], vec![]];
        assert_eq!(kahn_order(&deps), vec![1, 0, 2]);
    }
}
