use proptest::prelude::*;

use scenariodb::db::init_control_db;
use scenariodb::db::models::ScenarioStatus;
use scenariodb::db::repos::scenarios;
use scenariodb::{AppConfig, AppError};

fn status() -> impl Strategy<Value = ScenarioStatus> {
    prop_oneof![
        Just(ScenarioStatus::Free),
        Just(ScenarioStatus::InUse),
        Just(ScenarioStatus::Busy),
    ]
}

#[test]
fn test_edges_of_state_machine() {
    use ScenarioStatus::*;
    assert!(Free.can_transition_to(Busy));
    assert!(InUse.can_transition_to(Busy));
    assert!(Busy.can_transition_to(InUse));
    assert!(Busy.can_transition_to(Free));

    assert!(!Free.can_transition_to(InUse));
    assert!(!InUse.can_transition_to(Free));
    for s in [Free, InUse, Busy] {
        assert!(!s.can_transition_to(s), "{s} has a self edge");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_only_legal_edges_change_status(targets in prop::collection::vec(status(), 1..24)) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_control_db(&AppConfig::with_data_dir(dir.path())).unwrap();
        scenarios::create(&pool, "qa", None).unwrap();

        let mut current = ScenarioStatus::Free;
        for to in targets {
            let result = scenarios::set_status(&pool, "qa", to);
            if current.can_transition_to(to) {
                prop_assert_eq!(result.unwrap().status, to);
                current = to;
            } else {
                let err = result.unwrap_err();
                if current == ScenarioStatus::Busy && to == ScenarioStatus::Busy {
                    prop_assert!(matches!(err, AppError::Conflict(_)));
                } else {
                    prop_assert!(matches!(err, AppError::InvalidTransition { .. }), "unexpected {:?}", err);
                }
            }
            prop_assert_eq!(scenarios::get(&pool, "qa").unwrap().status, current);
        }
    }
}
