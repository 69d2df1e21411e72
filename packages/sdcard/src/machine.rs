use statig::prelude::*;

use crate::host::CardEvent;

/// Coarse slot state as seen by the rest of the system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CardPhase {
    #[default]
    NotReady,
    Initialising,
    Ready,
}

/// What the card driver must do after an event was dispatched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum CardAction {
    #[default]
    Nothing,
    Initialise,
    Teardown,
}

/// Events the machine reacts to: host slot events plus the bring-up outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MachineEvent {
    Slot(CardEvent),
    BringUpDone,
    BringUpFailed,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct CardMachine {
    pub(crate) phase: CardPhase,
    pub(crate) insertions: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DispatchContext {
    pub(crate) action: CardAction,
}

#[state_machine(initial = "State::not_ready()")]
impl CardMachine {
    #[state]
    fn not_ready(&mut self, context: &mut DispatchContext, event: &MachineEvent) -> Outcome<State> {
        match event {
            MachineEvent::Slot(CardEvent::Detected) => {
                self.insertions = self.insertions.wrapping_add(1);
                self.phase = CardPhase::Initialising;
                context.action = CardAction::Initialise;
                Transition(State::initialising())
            }
            _ => Handled,
        }
    }

    #[state]
    fn initialising(&mut self, context: &mut DispatchContext, event: &MachineEvent) -> Outcome<State> {
        match event {
            MachineEvent::BringUpDone => {
                self.phase = CardPhase::Ready;
                Transition(State::ready())
            }
            MachineEvent::BringUpFailed | MachineEvent::Slot(CardEvent::Removed) => {
                self.phase = CardPhase::NotReady;
                context.action = CardAction::Nothing;
                Transition(State::not_ready())
            }
            MachineEvent::Slot(CardEvent::Detected) => Handled,
        }
    }

    #[state]
    fn ready(&mut self, context: &mut DispatchContext, event: &MachineEvent) -> Outcome<State> {
        match event {
            MachineEvent::Slot(CardEvent::Removed) => {
                self.phase = CardPhase::NotReady;
                context.action = CardAction::Teardown;
                Transition(State::not_ready())
            }
            _ => Handled,
        }
    }
}
