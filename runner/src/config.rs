use crate::{
    params::{scalar_str, ParameterSet},
    tasks::{parse_dimension, TaskSet},
};
use serde_yaml::Value;
use std::{collections::BTreeMap, fs::File, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Dimension spec is invalid: {0}")]
    BadDimension(String),
    #[error("Dimension given more than once: {0}")]
    DuplicateDimension(String),
    #[error("cpus_per_worker must be at least 1")]
    ZeroGroupSize,
    #[error("Command template is empty")]
    EmptyCommand,
    #[error("Failed to read {path}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write materialized config to {path}")]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("File contains invalid YAML")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("Value is not a scalar: {0}")]
    NonScalar(String),
    #[error("Extras list `{name}` has {got} entries but there are {want} tasks")]
    ExtrasLength {
        name: String,
        got: usize,
        want: usize,
    },
    #[error("Placeholder has no substitution source: {0}")]
    UnknownPlaceholder(String),
    #[error("Malformed placeholder in template string: {0}")]
    BadTemplate(String),
    #[error("Override `{key}` references unknown parameter `{parameter}`")]
    UnknownOverride { key: String, parameter: String },
    #[error("Task index out of range: {0}")]
    UnknownTask(usize),
    #[error("Cannot form any worker group of size {group_size} from {workers} worker rank(s)")]
    NoWorkerGroups { workers: usize, group_size: usize },
    #[error("Only have {have} rank(s); need at least {need} to serve {groups} worker group(s)")]
    NotEnoughRanks {
        have: usize,
        need: usize,
        groups: usize,
    },
    #[error("World size is required: pass --ranks or launch under a rank-aware environment")]
    MissingWorldSize,
}

/// the fully-loaded batch description; every rank builds an identical copy
/// from the shared arguments and files, so only task indices ever travel
/// between ranks
#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub cpus_per_worker: usize,
    pub command: String,
    pub template: ParameterSet,
    pub tasks: TaskSet,
    pub extras: BTreeMap<String, Vec<String>>,
    pub updates: BTreeMap<String, BTreeMap<String, Value>>,
    pub timeout: Option<Duration>,
}

impl BatchConfig {
    pub fn load(args: &crate::Args) -> Result<Self, ConfigErrors> {
        if args.cpus_per_worker == 0 {
            return Err(ConfigErrors::ZeroGroupSize);
        }
        if args.cmd.trim().is_empty() {
            return Err(ConfigErrors::EmptyCommand);
        }

        let dims = args
            .iterate
            .iter()
            .map(|spec| parse_dimension(spec))
            .collect::<Result<Vec<_>, _>>()?;
        let tasks = TaskSet::build(dims)?;
        let template = ParameterSet::from_file(&args.params)?;

        let extras = match &args.extras {
            Some(path) => load_extras(path, tasks.len())?,
            None => BTreeMap::new(),
        };
        let updates = match &args.update_values {
            Some(path) => load_updates(path)?,
            None => BTreeMap::new(),
        };

        debug!(
            "loaded {} task(s) over {} dimension(s), {} extras list(s), {} override key(s)",
            tasks.len(),
            tasks.dims.len(),
            extras.len(),
            updates.len()
        );

        Ok(Self {
            cpus_per_worker: args.cpus_per_worker,
            command: args.cmd.clone(),
            template,
            tasks,
            extras,
            updates,
            timeout: args.timeout.map(Duration::from_secs),
        })
    }
}

/// extra per-task substitution lists: every list must cover every task, and
/// the values are rendered to strings up front so bad entries fail at startup
fn load_extras(path: &Path, tasks: usize) -> Result<BTreeMap<String, Vec<String>>, ConfigErrors> {
    let file = File::open(path).map_err(|source| ConfigErrors::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: BTreeMap<String, Vec<Value>> = serde_yaml::from_reader(file)?;

    let mut extras = BTreeMap::new();
    for (name, values) in raw {
        if values.len() != tasks {
            return Err(ConfigErrors::ExtrasLength {
                name,
                got: values.len(),
                want: tasks,
            });
        }
        let rendered = values
            .iter()
            .map(scalar_str)
            .collect::<Result<Vec<_>, _>>()?;
        extras.insert(name, rendered);
    }

    Ok(extras)
}

/// keyed parameter overrides: `"<dimension>_<value>"` -> parameter -> value
fn load_updates(
    path: &Path,
) -> Result<BTreeMap<String, BTreeMap<String, Value>>, ConfigErrors> {
    let file = File::open(path).map_err(|source| ConfigErrors::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(serde_yaml::from_reader(file)?)
}
