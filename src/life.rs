//! Entity lifecycle values

use std::fmt;

use serde::{Deserialize, Serialize};

/// The lifecycle state of an entity
///
/// Transitions are monotonic: `Alive` → `Dying` → `Dead`. `Dead` is
/// absorbing; once a watcher has reported an entity as Dead it will never
/// announce it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn is_dead(self) -> bool {
        matches!(self, Life::Dead)
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_life_ordering_is_monotonic() {
        assert!(Life::Alive < Life::Dying);
        assert!(Life::Dying < Life::Dead);
    }

    #[test]
    fn test_life_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Life::Dying).unwrap(), "\"dying\"");
    }
}
