use std::{
    collections::HashMap,
    fs::{self, File},
};

use chrono::NaiveDate;
use serde::Deserialize;
use switchyard::{
    backend::FileBackend,
    builtins::UserConditionSet,
    condition_set::SubjectConditionSet,
    field::{Field, Range, Text},
    Entity, ManagerConfig, SwitchManager, Subject, Value,
};

#[derive(Debug, Deserialize)]
struct TestCase {
    switch: String,
    #[serde(default)]
    default: bool,
    subjects: Vec<TestSubject>,
    expected: bool,
}

#[derive(Debug, Deserialize)]
struct TestSubject {
    kind: String,
    id: i64,
    #[serde(default)]
    attributes: HashMap<String, serde_json::Value>,
}

// Test files carry dates as plain strings; anything shaped like an ISO date is treated as a date.
fn to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Bool(b) => b.into(),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => i.into(),
            None => n.as_f64().into(),
        },
        serde_json::Value::String(s) => match NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
            Ok(date) => date.into(),
            Err(_) => s.into(),
        },
        _ => Value::Null,
    }
}

impl TestSubject {
    fn to_entity(&self) -> Entity {
        self.attributes
            .iter()
            .fold(Entity::new(&self.kind, self.id), |entity, (name, value)| {
                entity.with_attribute(name, to_value(value.clone()))
            })
    }
}

fn manager() -> SwitchManager {
    let _ = env_logger::builder().is_test(true).try_init();

    let backend = FileBackend::new(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/switches.json"));
    let manager = ManagerConfig::new(backend).auto_create(false).to_manager();
    manager.register(UserConditionSet::new());
    manager.register(
        SubjectConditionSet::new("billing.account")
            .with_field(Field::new("plan", Text))
            .with_field(Field::new("seats", Range)),
    );
    manager
}

#[test]
fn evaluation_test_data() {
    let manager = manager();

    let cases_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/cases/");
    for entry in fs::read_dir(cases_dir).unwrap() {
        let entry = entry.unwrap();
        println!("Processing test file: {:?}", entry.path());

        let cases: Vec<TestCase> = serde_json::from_reader(File::open(entry.path()).unwrap()).unwrap();
        for case in cases {
            print!("switch {:?} with {:?} ... ", case.switch, case.subjects);

            let entities = case
                .subjects
                .iter()
                .map(TestSubject::to_entity)
                .collect::<Vec<_>>();
            let subjects = entities
                .iter()
                .map(|entity| entity as &dyn Subject)
                .collect::<Vec<_>>();

            let result = manager
                .try_is_active_or(&case.switch, &subjects, case.default)
                .unwrap();
            assert_eq!(result, case.expected, "switch {:?}", case.switch);
            println!("ok");
        }
    }
}

#[test]
fn evaluation_never_writes() {
    let manager = manager();
    assert!(!manager.is_active("missing", &[]));
    assert!(!manager.contains("missing").unwrap());
    assert_eq!(manager.list().unwrap().len(), 18);
}
