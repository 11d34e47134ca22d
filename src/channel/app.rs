//! Application seam for channel transition rules.
//!
//! A channel without an app (`App::None`) permits any redistribution that
//! passes the base rules. State apps judge full transitions; action apps
//! judge an action and recompute the successor state from it.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::state::{Params, State};
use super::PartIdx;
use crate::codec::types::Address;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("invalid action: {0}")]
    InvalidAction(String),
}

/// An app advanced by full state updates.
pub trait StateApp: Send + Sync + std::fmt::Debug {
    /// App-specific checks for a valid initial state; the base rules already
    /// guarantee version 0 and a correct channel ID.
    fn valid_init(&self, _params: &Params, _state: &State) -> Result<(), AppError> {
        Ok(())
    }

    /// Checks the app-specific rules of the transition `from -> to` caused
    /// by the participant at `actor`.
    fn valid_transition(
        &self,
        params: &Params,
        from: &State,
        to: &State,
        actor: PartIdx,
    ) -> Result<(), AppError>;
}

/// An app advanced by actions; the successor state is recomputed from the
/// action rather than trusted from the proposer.
pub trait ActionApp: Send + Sync + std::fmt::Debug {
    fn valid_action(
        &self,
        params: &Params,
        state: &State,
        actor: PartIdx,
        action: &[u8],
    ) -> Result<(), AppError>;

    fn apply_action(
        &self,
        params: &Params,
        state: &State,
        actor: PartIdx,
        action: &[u8],
    ) -> Result<State, AppError>;
}

/// The app attached to one channel.
#[derive(Clone, Debug, Default)]
pub enum App {
    /// Plain payment channel; the base rules are the whole contract.
    #[default]
    None,
    State(Arc<dyn StateApp>),
    Action(Arc<dyn ActionApp>),
}

impl App {
    /// Applies the app's validity rules to a proposed transition.
    ///
    /// For action apps the app data of the candidate state carries the
    /// action; the recomputed successor must match the candidate exactly.
    pub fn valid_transition(
        &self,
        params: &Params,
        from: &State,
        to: &State,
        actor: PartIdx,
    ) -> Result<(), AppError> {
        match self {
            App::None => Ok(()),
            App::State(app) => app.valid_transition(params, from, to, actor),
            App::Action(app) => {
                let action = to.app.as_ref().map(|a| a.data.as_slice()).unwrap_or(&[]);
                app.valid_action(params, from, actor, action)?;
                let expected = app.apply_action(params, from, actor, action)?;
                if expected != *to {
                    return Err(AppError::InvalidTransition(
                        "state does not match applied action".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Resolves app definitions arriving on the wire to local app rules.
#[derive(Debug, Default)]
pub struct AppRegistry {
    apps: HashMap<Address, App>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: Address, app: App) {
        self.apps.insert(def, app);
    }

    /// `None` resolves to the plain payment rules; an unknown definition is
    /// an error because its rules cannot be checked.
    pub fn resolve(&self, def: Option<Address>) -> Option<App> {
        match def {
            None => Some(App::None),
            Some(addr) => self.apps.get(&addr).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::state::Allocation;
    use crate::codec::types::U256;

    /// Toy state app that forbids touching participant 0's balance.
    #[derive(Debug)]
    struct FrozenProposer;

    impl StateApp for FrozenProposer {
        fn valid_transition(
            &self,
            _params: &Params,
            from: &State,
            to: &State,
            _actor: PartIdx,
        ) -> Result<(), AppError> {
            if from.allocation.balances[0] != to.allocation.balances[0] {
                return Err(AppError::InvalidTransition(
                    "proposer balance is frozen".into(),
                ));
            }
            Ok(())
        }
    }

    fn state_pair() -> (Params, State, State) {
        let params = Params {
            challenge_duration: 10,
            nonce: U256::one(),
            participants: vec![Address([1; 20]), Address([2; 20])],
            app_def: None,
            parent: None,
        };
        let from = State::new(
            &params,
            Allocation::new(Address([3; 20]), vec![U256::from(5u8), U256::from(5u8)]),
        )
        .unwrap();
        let to = from.make_next_state();
        (params, from, to)
    }

    #[test]
    fn no_app_allows_everything() {
        let (params, from, to) = state_pair();
        App::None.valid_transition(&params, &from, &to, 0).unwrap();
    }

    #[test]
    fn state_app_rules_apply() {
        let (params, from, mut to) = state_pair();
        let app = App::State(Arc::new(FrozenProposer));

        app.valid_transition(&params, &from, &to, 0).unwrap();

        to.allocation.transfer(0, 1, U256::one()).unwrap();
        assert!(app.valid_transition(&params, &from, &to, 0).is_err());
    }

    #[test]
    fn registry_resolves_none_to_payment_rules() {
        let registry = AppRegistry::new();
        assert!(matches!(registry.resolve(None), Some(App::None)));
        assert!(registry.resolve(Some(Address([9; 20]))).is_none());
    }

    #[test]
    fn registry_resolves_registered_defs() {
        let mut registry = AppRegistry::new();
        let def = Address([9; 20]);
        registry.register(def, App::State(Arc::new(FrozenProposer)));
        assert!(matches!(registry.resolve(Some(def)), Some(App::State(_))));
    }
}
