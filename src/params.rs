use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Parameters exactly as a pipeline author wrote them.
pub type StageParameters = Map<String, Value>;

/// Parameters after schema resolution: every declared parameter bound to a
/// concrete, normalised value. Ordered so the hash input is stable.
pub type ResolvedParams = BTreeMap<String, Value>;

pub const SEED_PARAM: &str = "seed";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("unknown parameter '{0}'")]
    Unknown(String),
    #[error("missing required parameter '{0}'")]
    Missing(String),
    #[error("parameter '{name}' must be {expected}, got {found}")]
    WrongType {
        name: String,
        expected: &'static str,
        found: String,
    },
    #[error("parameter '{name}' = {value} is outside [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: String,
        min: String,
        max: String,
    },
    #[error("parameter '{name}' = '{value}' is not one of {options:?}")]
    NotAnOption {
        name: String,
        value: String,
        options: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
    Integer {
        min: Option<i64>,
        max: Option<i64>,
    },
    Float {
        min: Option<f64>,
        max: Option<f64>,
    },
    String,
    Boolean,
    Choice {
        options: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParamKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Integer {
            min: None,
            max: None,
        })
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Float {
            min: None,
            max: None,
        })
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::String)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Boolean)
    }

    pub fn choice(name: impl Into<String>, options: &[&str]) -> Self {
        Self::new(name, ParamKind::Choice {
            options: options.iter().map(|o| o.to_string()).collect(),
        })
    }

    /// The conventional seed every stochastic stage must declare.
    pub fn seed() -> Self {
        Self::integer(SEED_PARAM).int_range(0, i64::MAX).default(0)
    }

    fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn int_range(mut self, lo: i64, hi: i64) -> Self {
        if let ParamKind::Integer { min, max } = &mut self.kind {
            *min = Some(lo);
            *max = Some(hi);
        }
        self
    }

    pub fn float_range(mut self, lo: f64, hi: f64) -> Self {
        if let ParamKind::Float { min, max } = &mut self.kind {
            *min = Some(lo);
            *max = Some(hi);
        }
        self
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }

    fn check(&self, value: &Value) -> Result<Value, ParamError> {
        let name = &self.name;
        match &self.kind {
            ParamKind::Integer { min, max } => {
                let v = value.as_i64().ok_or_else(|| wrong_type(name, "an integer", value))?;
                let below = min.is_some_and(|lo| v < lo);
                let above = max.is_some_and(|hi| v > hi);
                if below || above {
                    return Err(out_of_range(name, v, *min, *max));
                }
                Ok(Value::from(v))
            }
            ParamKind::Float { min, max } => {
                let v = value.as_f64().ok_or_else(|| wrong_type(name, "a number", value))?;
                let below = min.is_some_and(|lo| v < lo);
                let above = max.is_some_and(|hi| v > hi);
                if below || above {
                    return Err(out_of_range(name, v, *min, *max));
                }
                // `5` and `5.0` must hash identically.
                Ok(Value::from(v))
            }
            ParamKind::String => value
                .as_str()
                .map(|s| Value::String(s.to_string()))
                .ok_or_else(|| wrong_type(name, "a string", value)),
            ParamKind::Boolean => value
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| wrong_type(name, "a boolean", value)),
            ParamKind::Choice { options } => {
                let v = value.as_str().ok_or_else(|| wrong_type(name, "a string", value))?;
                if options.iter().any(|o| o == v) {
                    Ok(Value::String(v.to_string()))
                } else {
                    Err(ParamError::NotAnOption {
                        name: name.clone(),
                        value: v.to_string(),
                        options: options.clone(),
                    })
                }
            }
        }
    }
}

fn wrong_type(name: &str, expected: &'static str, found: &Value) -> ParamError {
    ParamError::WrongType {
        name: name.to_string(),
        expected,
        found: found.to_string(),
    }
}

fn out_of_range<T: ToString>(name: &str, value: T, min: Option<T>, max: Option<T>) -> ParamError {
    let bound = |b: Option<T>, open: &str| b.map(|b| b.to_string()).unwrap_or_else(|| open.into());
    ParamError::OutOfRange {
        name: name.to_string(),
        value: value.to_string(),
        min: bound(min, "-inf"),
        max: bound(max, "inf"),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSchema {
    specs: Vec<ParamSpec>,
}

impl ParamSchema {
    pub fn new(specs: Vec<ParamSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn has_seed(&self) -> bool {
        self.get(SEED_PARAM).is_some()
    }

    /// Bind every declared parameter to a concrete value. Supplied values are
    /// type and range checked, absent ones fall back to their defaults, and
    /// anything the schema does not declare is rejected.
    pub fn resolve(&self, supplied: &StageParameters) -> Result<ResolvedParams, ParamError> {
        if let Some(unknown) = supplied.keys().find(|k| self.get(k).is_none()) {
            return Err(ParamError::Unknown(unknown.clone()));
        }

        let mut resolved = ResolvedParams::new();
        for spec in &self.specs {
            let value = match (supplied.get(&spec.name), &spec.default) {
                (Some(value), _) => spec.check(value)?,
                (None, Some(default)) => spec.check(default)?,
                (None, None) => return Err(ParamError::Missing(spec.name.clone())),
            };
            resolved.insert(spec.name.clone(), value);
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ParamSchema {
        ParamSchema::new(vec![
            ParamSpec::integer("k").int_range(2, 256).default(5),
            ParamSpec::float("cofactor").float_range(0.0, 1_000.0).default(5.0),
            ParamSpec::choice("method", &["arcsinh", "log"]).default("arcsinh"),
            ParamSpec::string("marker"),
            ParamSpec::seed(),
        ])
    }

    fn params(value: Value) -> StageParameters {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn resolve_fills_defaults_and_keeps_supplied_values() {
        let resolved = schema()
            .resolve(&params(json!({"marker": "CD4", "k": 8})))
            .unwrap();
        assert_eq!(resolved["k"], json!(8));
        assert_eq!(resolved["cofactor"], json!(5.0));
        assert_eq!(resolved["method"], json!("arcsinh"));
        assert_eq!(resolved["seed"], json!(0));
    }

    #[test]
    fn float_values_are_normalised() {
        let from_int = schema()
            .resolve(&params(json!({"marker": "CD4", "cofactor": 5})))
            .unwrap();
        let from_float = schema()
            .resolve(&params(json!({"marker": "CD4", "cofactor": 5.0})))
            .unwrap();
        assert_eq!(from_int, from_float);
    }

    #[test]
    fn resolve_rejects_bad_input() {
        let s = schema();
        assert_eq!(
            s.resolve(&params(json!({}))),
            Err(ParamError::Missing("marker".into()))
        );
        assert_eq!(
            s.resolve(&params(json!({"marker": "CD4", "kk": 3}))),
            Err(ParamError::Unknown("kk".into()))
        );
        assert!(matches!(
            s.resolve(&params(json!({"marker": "CD4", "k": 1}))),
            Err(ParamError::OutOfRange { .. })
        ));
        assert!(matches!(
            s.resolve(&params(json!({"marker": "CD4", "k": 2.5}))),
            Err(ParamError::WrongType { .. })
        ));
        assert!(matches!(
            s.resolve(&params(json!({"marker": "CD4", "method": "logicle"}))),
            Err(ParamError::NotAnOption { .. })
        ));
    }
}
