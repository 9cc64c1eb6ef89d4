//! Property tests for the workflow vocabulary

use super::*;
use proptest::prelude::*;

fn any_state() -> impl Strategy<Value = CoderState> {
    proptest::sample::select(CoderState::ALL.to_vec())
}

fn any_todo_list() -> impl Strategy<Value = TodoList> {
    proptest::collection::vec("[a-z ]{1,20}", 0..6)
        .prop_map(|descriptions| TodoList::from_descriptions(descriptions))
}

proptest! {
    #[test]
    fn transition_validation_agrees_with_table(from in any_state(), to in any_state()) {
        let allowed = from.allowed_successors().contains(&to);
        prop_assert_eq!(validate_transition(from, to).is_ok(), allowed);
    }

    #[test]
    fn terminal_states_never_advance_except_error_cleanup(from in any_state(), to in any_state()) {
        if from == CoderState::Done {
            prop_assert!(validate_transition(from, to).is_err());
        }
        if from == CoderState::Error && to != CoderState::Done {
            prop_assert!(validate_transition(from, to).is_err());
        }
    }

    #[test]
    fn state_serde_round_trips(state in any_state()) {
        let json = serde_json::to_string(&state).unwrap();
        let back: CoderState = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(state, back);
    }

    #[test]
    fn state_data_serialization_is_stable(
        story in "[a-z0-9-]{1,12}",
        plan in ".{0,64}",
        coding in 0u32..100,
        planning in 0u32..100,
        retried in any::<bool>(),
        todos in any_todo_list(),
    ) {
        let mut data = StateData::new();
        data.set(DataKey::StoryId, &story);
        data.set(DataKey::Plan, &plan);
        data.set_counter(DataKey::CodingIterations, coding);
        data.set_counter(DataKey::PlanningIterations, planning);
        data.set_flag(DataKey::EmptyResponseRetried, retried);
        data.set_todo_list(&todos);

        let first = serde_json::to_vec(&data).unwrap();
        let back: StateData = serde_json::from_slice(&first).unwrap();
        let second = serde_json::to_vec(&back).unwrap();

        prop_assert_eq!(&first, &second);
        prop_assert_eq!(data, back);
    }

    #[test]
    fn completing_todos_is_monotonic(mut todos in any_todo_list(), steps in 0usize..10) {
        let total = todos.len();
        for _ in 0..steps {
            todos.complete_current();
        }
        prop_assert_eq!(todos.completed_count(), steps.min(total));
        prop_assert_eq!(todos.all_completed(), steps >= total);
    }
}
