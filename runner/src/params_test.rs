use crate::{
    config::ConfigErrors,
    params::{scalar_str, Parameter, ParameterSet},
};
use serde_yaml::Value;
use std::{collections::BTreeMap, path::Path};
use tempfile::tempdir;

#[test]
pub fn bare_scalars_parse_as_bare() {
    let set: ParameterSet = serde_yaml::from_str("theory:\n  b1: 2.5\n").unwrap();

    let parameter = set.group("theory").unwrap().get("b1").unwrap();
    assert_eq!(parameter, &Parameter::Bare(Value::from(2.5)));
}

#[test]
pub fn structured_entries_keep_their_extra_keys() {
    let set: ParameterSet = serde_yaml::from_str(
        "\
theory:
  nbar:
    value: 3.0e-4
    fiducial: 3.0e-4
    prior: uniform
",
    )
    .unwrap();

    match set.group("theory").unwrap().get("nbar").unwrap() {
        Parameter::Spec {
            value,
            fiducial,
            rest,
        } => {
            assert_eq!(value, &Value::from(3.0e-4));
            assert_eq!(fiducial, &Some(Value::from(3.0e-4)));
            assert_eq!(rest.get("prior"), Some(&Value::from("uniform")));
        }
        other => panic!("expected a structured parameter, got {other:?}"),
    }
}

#[test]
pub fn mappings_without_a_value_key_stay_bare() {
    let set: ParameterSet =
        serde_yaml::from_str("driver:\n  limits:\n    lower: 0\n    upper: 1\n").unwrap();

    let parameter = set.group("driver").unwrap().get("limits").unwrap();
    assert!(matches!(parameter, Parameter::Bare(Value::Mapping(_))));
}

#[test]
pub fn set_value_keeps_the_representation() {
    let mut parameter = Parameter::Bare(Value::from(1));
    parameter.set_value(Value::from(2));
    assert_eq!(parameter, Parameter::Bare(Value::from(2)));
}

#[test]
pub fn override_with_pins_value_and_fiducial() {
    let mut parameter = Parameter::Spec {
        value: Value::from(1.0),
        fiducial: None,
        rest: BTreeMap::from([(String::from("prior"), Value::from("normal"))]),
    };
    parameter.override_with(Value::from(2.0));

    match parameter {
        Parameter::Spec {
            value,
            fiducial,
            rest,
        } => {
            assert_eq!(value, Value::from(2.0));
            assert_eq!(fiducial, Some(Value::from(2.0)));
            assert_eq!(rest.get("prior"), Some(&Value::from("normal")));
        }
        other => panic!("expected a structured parameter, got {other:?}"),
    }
}

#[test]
pub fn override_with_promotes_bare_parameters() {
    let mut parameter = Parameter::Bare(Value::from(1));
    parameter.override_with(Value::from(7));

    assert_eq!(
        parameter,
        Parameter::Spec {
            value: Value::from(7),
            fiducial: Some(Value::from(7)),
            rest: BTreeMap::new(),
        }
    );
}

#[test]
pub fn serialization_round_trips() {
    let set: ParameterSet = serde_yaml::from_str(
        "\
driver:
  burnin: 100
theory:
  nbar:
    value: 0.0003
    fiducial: 0.0003
",
    )
    .unwrap();

    let rendered = set.to_yaml().unwrap();
    let again: ParameterSet = serde_yaml::from_str(&rendered).unwrap();
    assert_eq!(set, again);
}

#[test]
pub fn files_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("params.yaml");

    let set: ParameterSet = serde_yaml::from_str("theory:\n  b1: 2.0\n").unwrap();
    set.write(&path).unwrap();
    assert_eq!(ParameterSet::from_file(&path).unwrap(), set);
}

#[test]
pub fn missing_files_report_the_path() {
    let result = ParameterSet::from_file(Path::new("/nonexistent/params.yaml"));
    assert!(matches!(
        result,
        Err(ConfigErrors::FileRead { path, .. }) if path == Path::new("/nonexistent/params.yaml")
    ));
}

#[test]
pub fn scalars_render_in_yaml_form() {
    assert_eq!(scalar_str(&Value::from(true)).unwrap(), "true");
    assert_eq!(scalar_str(&Value::from(100)).unwrap(), "100");
    assert_eq!(scalar_str(&Value::from(0.5)).unwrap(), "0.5");
    assert_eq!(scalar_str(&Value::from("NGC")).unwrap(), "NGC");
    assert!(matches!(
        scalar_str(&Value::Sequence(Vec::new())),
        Err(ConfigErrors::NonScalar(_))
    ));
}
