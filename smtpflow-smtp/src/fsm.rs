//! SMTP Finite State Machine implementation.
//!
//! Implements the `FiniteStateMachine` trait for [`State`] so the protocol can
//! be driven, and tested, without a connection.

use smtpflow_common::traits::fsm::FiniteStateMachine;

use crate::{command::Command, session_state::SessionState, state::State};

/// # Example
///
/// ```rust
/// use smtpflow_common::traits::fsm::FiniteStateMachine;
/// use smtpflow_smtp::{
///     command::{Command, HeloVariant},
///     session_state::SessionState,
///     state::State,
/// };
///
/// let mut session_state = SessionState::new();
/// let state = State::default(); // Connect state
///
/// let new_state = FiniteStateMachine::transition(
///     state,
///     Command::Helo(HeloVariant::Ehlo("client.example.com".to_string())),
///     &mut session_state,
/// );
///
/// assert_eq!(session_state.id, "client.example.com");
/// assert!(session_state.extended);
/// assert!(matches!(new_state, State::Ehlo(_)));
/// ```
impl FiniteStateMachine for State {
    type Input = Command;
    type Context = SessionState;

    fn transition(self, input: Self::Input, context: &mut Self::Context) -> Self {
        self.transition_protocol(input, context)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use smtpflow_common::traits::fsm::FiniteStateMachine;

    use super::*;
    use crate::command::HeloVariant;

    #[test]
    fn test_fsm_trait_helo_transition() {
        let mut session_state = SessionState::new();

        let new_state = FiniteStateMachine::transition(
            State::default(),
            Command::Helo(HeloVariant::Helo("client.example.com".to_string())),
            &mut session_state,
        );

        assert_eq!(session_state.id, "client.example.com");
        assert!(!session_state.extended);
        assert!(matches!(new_state, State::Helo(_)));
    }

    #[test]
    fn test_fsm_trait_ehlo_resets_transaction() {
        let mut session_state = SessionState {
            id: "old.example.com".to_string(),
            transaction: Some(crate::session_state::Envelope::default()),
            ..SessionState::default()
        };

        let new_state = FiniteStateMachine::transition(
            State::resume(&session_state),
            Command::Helo(HeloVariant::Ehlo("new.example.com".to_string())),
            &mut session_state,
        );

        assert!(matches!(new_state, State::Ehlo(_)));
        assert_eq!(session_state.id, "new.example.com");
        assert!(session_state.transaction.is_none());
    }

    #[test]
    fn test_fsm_trait_quit_from_any_state() {
        let mut session_state = SessionState::new();

        for state in [
            State::default(),
            State::resume(&session_state),
            State::Noop(crate::state::Noop),
        ] {
            let new_state =
                FiniteStateMachine::transition(state, Command::Quit, &mut session_state);
            assert!(matches!(new_state, State::Quit(_)));
        }
    }
}
