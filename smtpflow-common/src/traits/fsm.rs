/// A state machine driven by discrete inputs over a mutable context.
///
/// Transitions are expected to be pure with respect to I/O: anything that
/// needs to talk to the outside world happens after the transition, based on
/// the state it produced.
pub trait FiniteStateMachine {
    type Input;
    type Context;

    #[must_use]
    fn transition(self, input: Self::Input, context: &mut Self::Context) -> Self;
}
