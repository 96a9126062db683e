//! Game-name policy for the master server
//!
//! Operators can restrict which games may register, either as a whitelist
//! ("accept these games only") or a blacklist ("reject these games, accept
//! everything else"). The mode is latched by the first policy declaration;
//! later declarations must agree with it. Names are kept sorted so every
//! registration costs one binary search.

use crate::error::MasterError;
use std::str::FromStr;

/// Which way a policy declaration cuts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    /// Only the listed games may register
    Accept,
    /// The listed games may not register; everything else may
    Reject,
}

impl FromStr for PolicyMode {
    type Err = MasterError;

    fn from_str(word: &str) -> Result<Self, Self::Err> {
        match word {
            "accept" => Ok(PolicyMode::Accept),
            "reject" => Ok(PolicyMode::Reject),
            _ => Err(MasterError::InvalidOptParams(format!(
                "unknown game policy \"{}\"",
                word
            ))),
        }
    }
}

/// Ordered set of known game names plus the latched policy mode
#[derive(Debug)]
pub struct GamePolicy {
    game_names: Vec<String>,
    reject_when_known: bool,
    declared: bool,
}

impl GamePolicy {
    pub fn new() -> Self {
        Self {
            game_names: Vec::new(),
            reject_when_known: true,
            declared: false,
        }
    }

    /// Declares a policy line, inserting its game names into the set
    ///
    /// The first declaration fixes the mode; a later declaration with the
    /// other mode fails without touching the set. Duplicate names are
    /// silently skipped.
    pub fn declare(&mut self, mode: PolicyMode, games: &[String]) -> Result<(), MasterError> {
        let new_reject_when_known = mode == PolicyMode::Reject;

        if !self.declared {
            self.reject_when_known = new_reject_when_known;
            self.declared = true;
        } else if new_reject_when_known != self.reject_when_known {
            return Err(MasterError::InvalidOptParams(
                "game policy lines must all accept or all reject".to_string(),
            ));
        }

        for game in games {
            if let Err(index) = self.game_names.binary_search(game) {
                self.game_names.insert(index, game.clone());
            }
        }

        Ok(())
    }

    /// Returns true if the game is allowed on this master
    ///
    /// A game passes when being listed disagrees with the reject mode. An
    /// empty set accepts everything regardless of mode.
    pub fn is_accepted(&self, game_name: &str) -> bool {
        if self.game_names.is_empty() {
            return true;
        }
        let known = self
            .game_names
            .binary_search_by(|name| name.as_str().cmp(game_name))
            .is_ok();
        known ^ self.reject_when_known
    }

    pub fn len(&self) -> usize {
        self.game_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.game_names.is_empty()
    }
}

impl Default for GamePolicy {
    fn default() -> Self {
        Self::new()
    }
}
