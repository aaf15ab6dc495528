use crate::{config::ConfigErrors, params::scalar_str};
use itertools::Itertools;
use serde_yaml::Value;

/// one axis of the batch: a name and the values it takes
#[derive(Clone, Debug, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub values: Vec<Value>,
}

/// parse one dimension spec: a single-key YAML mapping whose value is either
/// a sequence or an integer range written as `a..b` / `a..=b`
pub fn parse_dimension(spec: &str) -> Result<Dimension, ConfigErrors> {
    let bad = || ConfigErrors::BadDimension(spec.to_string());

    let document: Value = serde_yaml::from_str(spec)?;
    let mapping = match document {
        Value::Mapping(mapping) if mapping.len() == 1 => mapping,
        _ => return Err(bad()),
    };
    let (key, value) = match mapping.into_iter().next() {
        Some(entry) => entry,
        None => return Err(bad()),
    };

    let name = key.as_str().ok_or_else(bad)?.to_string();
    let values = match value {
        Value::Sequence(values) => values,
        Value::String(range) => expand_range(&range).ok_or_else(bad)?,
        _ => return Err(bad()),
    };

    Ok(Dimension { name, values })
}

/// expand `a..b` (half-open) or `a..=b` (inclusive) over integers
fn expand_range(text: &str) -> Option<Vec<Value>> {
    let (start, rest) = text.split_once("..")?;
    let (inclusive, end) = match rest.strip_prefix('=') {
        Some(end) => (true, end),
        None => (false, rest),
    };

    let start: i64 = start.trim().parse().ok()?;
    let end: i64 = end.trim().parse().ok()?;
    let stop = if inclusive { end.checked_add(1)? } else { end };

    Some((start..stop).map(Value::from).collect())
}

/// the ordered task list: one entry per combination of dimension values,
/// fixed at startup and identical on every rank
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskSet {
    pub dims: Vec<String>,
    pub tasks: Vec<Vec<Value>>,
}

impl TaskSet {
    /// Cartesian product over the dimensions, in the order they were given
    /// (the last dimension varies fastest)
    pub fn build(dims: Vec<Dimension>) -> Result<Self, ConfigErrors> {
        if let Some(duplicate) = dims.iter().map(|dim| &dim.name).duplicates().next() {
            return Err(ConfigErrors::DuplicateDimension(duplicate.clone()));
        }

        let names = dims.iter().map(|dim| dim.name.clone()).collect_vec();
        let tasks = dims
            .into_iter()
            .map(|dim| dim.values)
            .multi_cartesian_product()
            .collect_vec();

        Ok(Self { dims: names, tasks })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// the value tuple of one task
    pub fn values(&self, task: usize) -> Option<&[Value]> {
        self.tasks.get(task).map(Vec::as_slice)
    }

    /// log-friendly form of one task: the bare value for a single dimension,
    /// a tuple otherwise
    pub fn display(&self, task: usize) -> String {
        match self.tasks.get(task) {
            Some(values) if values.len() == 1 => scalar_display(&values[0]),
            Some(values) => format!("({})", values.iter().map(scalar_display).join(", ")),
            None => format!("#{task}"),
        }
    }
}

fn scalar_display(value: &Value) -> String {
    scalar_str(value).unwrap_or_else(|_| format!("{value:?}"))
}
