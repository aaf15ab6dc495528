use crate::config::ConfigErrors;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{collections::BTreeMap, fs, fs::File, path::Path};

/// map of parameter name -> parameter within one tagged group
pub type ParamGroup = BTreeMap<String, Parameter>;

/// a single template parameter: either a bare scalar or a structured entry
/// carrying at least a `value` (extra keys such as priors ride along)
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Parameter {
    Spec {
        value: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        fiducial: Option<Value>,
        #[serde(flatten)]
        rest: BTreeMap<String, Value>,
    },
    Bare(Value),
}

impl Parameter {
    /// the current value, regardless of representation
    pub fn value(&self) -> &Value {
        match self {
            Self::Spec { value, .. } => value,
            Self::Bare(value) => value,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value().as_str()
    }

    /// replace the value, keeping the representation
    pub fn set_value(&mut self, new: Value) {
        match self {
            Self::Spec { value, .. } => *value = new,
            Self::Bare(value) => *value = new,
        }
    }

    /// apply a keyed override: value and fiducial move together, and bare
    /// parameters pick up a fiducial in the process
    pub fn override_with(&mut self, new: Value) {
        match self {
            Self::Spec { value, fiducial, .. } => {
                *value = new.clone();
                *fiducial = Some(new);
            }
            Self::Bare(_) => {
                *self = Self::Spec {
                    value: new.clone(),
                    fiducial: Some(new),
                    rest: BTreeMap::new(),
                };
            }
        }
    }
}

/// the parameter template: tag -> named parameters, read once at startup and
/// never mutated afterwards; BTreeMaps keep serialization deterministic
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct ParameterSet {
    pub groups: BTreeMap<String, ParamGroup>,
}

impl ParameterSet {
    pub fn from_file(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|source| ConfigErrors::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigErrors> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfigErrors> {
        fs::write(path, self.to_yaml()?).map_err(|source| ConfigErrors::ArtifactWrite {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn group(&self, tag: &str) -> Option<&ParamGroup> {
        self.groups.get(tag)
    }

    pub fn group_mut(&mut self, tag: &str) -> Option<&mut ParamGroup> {
        self.groups.get_mut(tag)
    }
}

/// render a scalar in its YAML display form, for substitution values and
/// override keys
pub fn scalar_str(value: &Value) -> Result<String, ConfigErrors> {
    match value {
        Value::Bool(flag) => Ok(flag.to_string()),
        Value::Number(number) => Ok(number.to_string()),
        Value::String(text) => Ok(text.clone()),
        other => Err(ConfigErrors::NonScalar(format!("{other:?}"))),
    }
}
