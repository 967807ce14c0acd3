use std::path::PathBuf;

use planeval::{
    eval::{load_scenarios, StepKnowledgeBase},
    DataField, EvalConfig, FieldValue, Step,
};

fn root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

#[test]
fn shipped_scenarios_load_and_validate() {
    let scenarios = load_scenarios(root().join("scenarios")).unwrap();
    let ids: Vec<&str> = scenarios.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["ecommerce-novice", "saas-expert-budget-cut"]);

    for scenario in &scenarios {
        scenario.validate().unwrap();
        assert!(scenario.effective_failure_conditions().len() >= 6);
    }

    let novice = &scenarios[0];
    assert_eq!(novice.expected_completed_steps, vec![Step::Outcomes, Step::Economics]);
    assert!(novice.knowledge_injection.contains_key(&Step::Economics));
    assert!(novice.persona.unknown_fields.contains(&DataField::Cac));

    let expert = &scenarios[1];
    let change = expert.data_change.as_ref().unwrap();
    assert_eq!(change.at_turn, 8);
    assert_eq!(change.value, FieldValue::Number(400_000.0));
}

#[test]
fn example_config_and_knowledge_load() {
    let config = EvalConfig::load(root().join("eval.example.yaml")).unwrap();
    assert_eq!(config.concurrency, 4);
    assert!(config.engine_config().unwrap().call_timeout.is_some());

    let knowledge = config.knowledge_base().unwrap();
    assert!(!knowledge.is_empty());

    let direct = StepKnowledgeBase::from_dir(root().join("knowledge")).unwrap();
    assert_eq!(direct.len(), knowledge.len());
}
