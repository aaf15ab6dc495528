use crate::{
    config::{BatchConfig, ConfigErrors},
    materialize::{render_str, Materializer, TempPath},
    params::{Parameter, ParameterSet},
    tasks::{parse_dimension, TaskSet},
};
use serde_yaml::Value;
use std::{collections::BTreeMap, fs};
use tempfile::tempdir;

/// tasks: (1,A) (1,B) (2,A) (2,B), with overrides keyed on box=1 and sim=B
fn fixture() -> BatchConfig {
    let dims = vec![
        parse_dimension("box: [1, 2]").unwrap(),
        parse_dimension("sim: [A, B]").unwrap(),
    ];
    let template: ParameterSet = serde_yaml::from_str(
        "\
driver:
  input: data/box{box}_{sim}.dat
  burnin: 100
theory:
  b1: 2.0
  nbar:
    value: 1.0
",
    )
    .unwrap();

    let mut updates = BTreeMap::new();
    updates.insert(
        String::from("box_1"),
        BTreeMap::from([(String::from("nbar"), Value::from(0.0003))]),
    );
    updates.insert(
        String::from("sim_B"),
        BTreeMap::from([(String::from("b1"), Value::from(9))]),
    );

    BatchConfig {
        cpus_per_worker: 1,
        command: String::from("run-fit -m model{box}.npy"),
        template,
        tasks: TaskSet::build(dims).unwrap(),
        extras: BTreeMap::new(),
        updates,
        timeout: None,
    }
}

#[test]
pub fn renders_placeholders_from_task_values() {
    let config = fixture();
    let materializer = Materializer::new(&config);

    let params = materializer.materialize(2).unwrap();
    let driver = params.group("driver").unwrap();
    assert_eq!(
        driver.get("input").unwrap().value(),
        &Value::from("data/box2_A.dat")
    );
    // untouched parameters stay as they were
    assert_eq!(driver.get("burnin").unwrap().value(), &Value::from(100));
}

#[test]
pub fn keyed_overrides_pin_value_and_fiducial() {
    let config = fixture();
    let materializer = Materializer::new(&config);

    let params = materializer.materialize(0).unwrap();
    match params.group("theory").unwrap().get("nbar").unwrap() {
        Parameter::Spec {
            value, fiducial, ..
        } => {
            assert_eq!(value, &Value::from(0.0003));
            assert_eq!(fiducial, &Some(Value::from(0.0003)));
        }
        other => panic!("expected a structured parameter, got {other:?}"),
    }

    // tasks with box=2 leave the template value alone
    let untouched = materializer.materialize(2).unwrap();
    assert_eq!(
        untouched
            .group("theory")
            .unwrap()
            .get("nbar")
            .unwrap()
            .value(),
        &Value::from(1.0)
    );
}

#[test]
pub fn overrides_promote_bare_parameters() {
    let config = fixture();
    let materializer = Materializer::new(&config);

    let params = materializer.materialize(1).unwrap();
    match params.group("theory").unwrap().get("b1").unwrap() {
        Parameter::Spec {
            value, fiducial, ..
        } => {
            assert_eq!(value, &Value::from(9));
            assert_eq!(fiducial, &Some(Value::from(9)));
        }
        other => panic!("expected a structured parameter, got {other:?}"),
    }
}

#[test]
pub fn materialize_is_deterministic() {
    let config = fixture();
    let materializer = Materializer::new(&config);

    let once = materializer.materialize(1).unwrap().to_yaml().unwrap();
    let twice = materializer.materialize(1).unwrap().to_yaml().unwrap();
    assert_eq!(once, twice);
}

#[test]
pub fn command_renders_and_splits() {
    let config = fixture();
    let materializer = Materializer::new(&config);

    assert_eq!(
        materializer.command(3).unwrap(),
        vec!["run-fit", "-m", "model2.npy"]
    );
}

#[test]
pub fn unknown_placeholder_is_a_config_error() {
    let mut config = fixture();
    config.command = String::from("run-fit --tag {nope}");
    let materializer = Materializer::new(&config);

    assert!(matches!(
        materializer.command(0),
        Err(ConfigErrors::UnknownPlaceholder(name)) if name == "nope"
    ));
}

#[test]
pub fn override_of_a_missing_parameter_is_refused() {
    let mut config = fixture();
    config.updates.insert(
        String::from("sim_A"),
        BTreeMap::from([(String::from("ghost"), Value::from(1))]),
    );
    let materializer = Materializer::new(&config);

    assert!(matches!(
        materializer.materialize(0),
        Err(ConfigErrors::UnknownOverride { .. })
    ));
}

#[test]
pub fn extras_feed_the_substitution_map() {
    let mut config = fixture();
    config.extras.insert(
        String::from("tag"),
        ["a", "b", "c", "d"].into_iter().map(String::from).collect(),
    );
    config.command = String::from("run-fit --tag {tag}");
    let materializer = Materializer::new(&config);

    assert_eq!(
        materializer.command(2).unwrap(),
        vec!["run-fit", "--tag", "c"]
    );
}

#[test]
pub fn braces_escape_with_doubling() {
    let map = BTreeMap::from([(String::from("a"), String::from("x"))]);

    assert_eq!(render_str("{{literal}} {a}", &map).unwrap(), "{literal} x");
    assert!(matches!(
        render_str("dangling }", &map),
        Err(ConfigErrors::BadTemplate(_))
    ));
    assert!(matches!(
        render_str("open {a", &map),
        Err(ConfigErrors::BadTemplate(_))
    ));
}

#[test]
pub fn staged_artifacts_remove_themselves() {
    let config = fixture();
    let materializer = Materializer::new(&config);
    let dir = tempdir().unwrap();

    let staged = materializer.stage(0).unwrap();
    let path = {
        let artifact = TempPath::write_in(&staged.params, dir.path()).unwrap();
        let path = artifact.to_path_buf();
        assert!(path.exists());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            staged.params.to_yaml().unwrap()
        );
        path
    };

    assert!(!path.exists());
}
