use crate::{
    config::{BatchConfig, ConfigErrors},
    params::{scalar_str, ParameterSet},
};
use std::{
    collections::BTreeMap,
    env, fs,
    ops::Deref,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicUsize, Ordering},
};
use tracing::{debug, error};

/// parameter group that keyed overrides are allowed to touch
const THEORY_TAG: &str = "theory";

/// keeps artifact names apart when several group roots share a process
static ARTIFACT_SEQ: AtomicUsize = AtomicUsize::new(0);

/// everything a group needs to run one task
#[derive(Debug, Clone, PartialEq)]
pub struct StagedTask {
    pub params: ParameterSet,
    pub args: Vec<String>,
}

/// renders tasks into concrete parameter sets and command lines
pub struct Materializer<'a> {
    config: &'a BatchConfig,
}

impl<'a> Materializer<'a> {
    pub fn new(config: &'a BatchConfig) -> Self {
        Self { config }
    }

    /// substitution map for one task: dimension values, then per-task extras
    fn substitutions(&self, task: usize) -> Result<BTreeMap<String, String>, ConfigErrors> {
        let values = self
            .config
            .tasks
            .values(task)
            .ok_or(ConfigErrors::UnknownTask(task))?;

        let mut map = BTreeMap::new();
        for (name, value) in self.config.tasks.dims.iter().zip(values) {
            map.insert(name.clone(), scalar_str(value)?);
        }
        for (name, rendered) in &self.config.extras {
            map.insert(name.clone(), rendered[task].clone());
        }

        Ok(map)
    }

    /// fill the template for one task; identical input produces
    /// byte-identical output
    pub fn materialize(&self, task: usize) -> Result<ParameterSet, ConfigErrors> {
        let map = self.substitutions(task)?;
        let mut params = self.config.template.clone();

        for group in params.groups.values_mut() {
            for parameter in group.values_mut() {
                let rendered = match parameter.as_str() {
                    Some(text) if text.contains('{') || text.contains('}') => {
                        render_str(text, &map)?
                    }
                    _ => continue,
                };
                parameter.set_value(rendered.into());
            }
        }
        self.apply_overrides(&mut params, &map)?;

        Ok(params)
    }

    /// keyed overrides: a substitution pair `name=value` selects the table
    /// `<name>_<value>`, whose entries pin theory parameters (value and
    /// fiducial both)
    fn apply_overrides(
        &self,
        params: &mut ParameterSet,
        map: &BTreeMap<String, String>,
    ) -> Result<(), ConfigErrors> {
        for (name, value) in map {
            let key = format!("{name}_{value}");
            let overrides = match self.config.updates.get(&key) {
                Some(overrides) => overrides,
                None => continue,
            };

            for (parameter, new) in overrides {
                let slot = params
                    .group_mut(THEORY_TAG)
                    .and_then(|group| group.get_mut(parameter));
                match slot {
                    Some(slot) => slot.override_with(new.clone()),
                    None => {
                        return Err(ConfigErrors::UnknownOverride {
                            key,
                            parameter: parameter.clone(),
                        })
                    }
                }
            }
        }

        Ok(())
    }

    /// the rendered command line for one task, without the parameter-file
    /// argument appended later by the group root
    pub fn command(&self, task: usize) -> Result<Vec<String>, ConfigErrors> {
        let map = self.substitutions(task)?;
        let rendered = render_str(&self.config.command, &map)?;
        let args: Vec<String> = rendered.split_whitespace().map(str::to_string).collect();
        if args.is_empty() {
            return Err(ConfigErrors::EmptyCommand);
        }

        Ok(args)
    }

    /// materialize one task and pair it with its command line
    pub fn stage(&self, task: usize) -> Result<StagedTask, ConfigErrors> {
        Ok(StagedTask {
            params: self.materialize(task)?,
            args: self.command(task)?,
        })
    }
}

/// substitute `{name}` placeholders; `{{` and `}}` escape the braces
pub fn render_str(text: &str, map: &BTreeMap<String, String>) -> Result<String, ConfigErrors> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(ConfigErrors::BadTemplate(text.to_string())),
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(inner) => name.push(inner),
                        None => return Err(ConfigErrors::BadTemplate(text.to_string())),
                    }
                }
                match map.get(&name) {
                    Some(value) => out.push_str(value),
                    None => return Err(ConfigErrors::UnknownPlaceholder(name)),
                }
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

/// a materialized parameter file that removes itself once the task is done
#[derive(Debug)]
pub struct TempPath {
    path: PathBuf,
}

impl TempPath {
    /// write a parameter set under the system tmp dir
    pub fn write(params: &ParameterSet) -> Result<Self, ConfigErrors> {
        Self::write_in(params, &get_tmp_dir())
    }

    pub fn write_in(params: &ParameterSet, dir: &Path) -> Result<Self, ConfigErrors> {
        let sequence = ARTIFACT_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("fitfarm-{}-{sequence}.yaml", process::id()));
        debug!("creating temporary file: {}", path.display());
        params.write(&path)?;

        Ok(Self { path })
    }
}

impl Deref for TempPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("removing temporary file: {}", self.path.display()),
            Err(error) => error!(error = ?error, "Failed to remove temporary file: {error}"),
        }
    }
}

/// tmp dir from the environment, falling back to /tmp
fn get_tmp_dir() -> PathBuf {
    env::var("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or(PathBuf::from("/tmp"))
}
