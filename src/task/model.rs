//! Job descriptions: a named, ordered list of steps.

use std::collections::BTreeMap;
use std::path::Path;

use serde_yaml::Value;
use tracing::warn;

use crate::error::TaskParseError;

/// A parsed job description. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub name: String,
    pub steps: Vec<Step>,
}

/// One named group of shell commands sharing an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub commands: Vec<String>,
    pub environments: BTreeMap<String, String>,
}

impl Task {
    /// Parse a YAML job description.
    ///
    /// Checks run in a fixed order (`name`, `steps`, then per step `name` and
    /// `commands`), so the same document always fails the same way.
    pub fn parse(source: &str) -> Result<Self, TaskParseError> {
        let doc: Value =
            serde_yaml::from_str(source).map_err(|e| TaskParseError::Yaml(e.to_string()))?;

        let name = match doc.get("name") {
            None | Some(Value::Null) => return Err(TaskParseError::MissingName),
            Some(v) => scalar(v, "name")?,
        };

        let steps = doc
            .get("steps")
            .and_then(Value::as_sequence)
            .ok_or(TaskParseError::InvalidSteps)?
            .iter()
            .enumerate()
            .map(|(index, step)| parse_step(index, step))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { name, steps })
    }

    /// Read and parse a job description file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, TaskParseError> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TaskParseError::Io {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Self::parse(&source)
    }

    pub fn command_count(&self) -> usize {
        self.steps.iter().map(|s| s.commands.len()).sum()
    }
}

fn parse_step(index: usize, step: &Value) -> Result<Step, TaskParseError> {
    let name = match step.get("name") {
        None | Some(Value::Null) => return Err(TaskParseError::StepMissingName { index }),
        Some(v) => scalar(v, &format!("steps[{index}].name"))?,
    };

    let commands = step
        .get("commands")
        .and_then(Value::as_sequence)
        .ok_or_else(|| TaskParseError::InvalidCommands { step: name.clone() })?
        .iter()
        .enumerate()
        .map(|(i, c)| scalar(c, &format!("{name}.commands[{i}]")))
        .collect::<Result<Vec<_>, _>>()?;

    let environments = parse_environments(&name, step.get("environments"));

    Ok(Step {
        name,
        commands,
        environments,
    })
}

/// `environments` is a sequence of single-key mappings merged in order; later
/// keys win. Malformed entries are skipped with a warning.
fn parse_environments(step: &str, value: Option<&Value>) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    let entries = match value {
        None | Some(Value::Null) => return merged,
        Some(Value::Sequence(entries)) => entries,
        Some(_) => {
            warn!(step = %step, "'environments' is not a sequence, ignoring");
            return merged;
        }
    };

    for entry in entries {
        let Some(mapping) = entry.as_mapping() else {
            warn!(step = %step, "Ignoring non-mapping environment entry");
            continue;
        };
        for (key, value) in mapping {
            match (scalar(key, "environment key"), scalar(value, "environment value")) {
                (Ok(k), Ok(v)) => {
                    merged.insert(k, v);
                }
                _ => warn!(step = %step, "Ignoring non-scalar environment entry"),
            }
        }
    }
    merged
}

fn scalar(value: &Value, field: &str) -> Result<String, TaskParseError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(TaskParseError::InvalidValue {
            field: field.to_string(),
        }),
    }
}
