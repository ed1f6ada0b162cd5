//! Errors surfaced by the engine

use crate::token::Position;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the engine reports. None of them unwind: `load`, `run`,
/// `step` and `call` hand them back as values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Lexing or parsing failed, nothing was executed.
    #[error("{position}: {message}")]
    Syntax { message: String, position: Position },

    /// An instruction faulted. `position` is taken from the faulting `Op`.
    #[error("{position}: {message}")]
    Runtime { message: String, position: Position },

    /// The step budget of a single `run()` or `call()` was exhausted.
    #[error("Program ran for too long (more than {limit} steps)")]
    RanTooLong { limit: usize },
}

impl Error {
    pub fn syntax(position: Position, message: impl Into<String>) -> Self {
        Error::Syntax {
            message: message.into(),
            position,
        }
    }

    pub fn runtime(position: Position, message: impl Into<String>) -> Self {
        Error::Runtime {
            message: message.into(),
            position,
        }
    }

    /// Convert a failure raised by a value operation or a native function.
    ///
    /// Natives that call back into the engine may propagate an engine error
    /// through `anyhow`; those keep their original position.
    pub(crate) fn from_anyhow(err: anyhow::Error, position: Position) -> Self {
        match err.downcast::<Error>() {
            Ok(err) => err,
            Err(err) => Error::runtime(position, err.to_string()),
        }
    }

    /// Position of the error, if it is attributable to one.
    pub fn position(&self) -> Option<Position> {
        match self {
            Error::Syntax { position, .. } | Error::Runtime { position, .. } => Some(*position),
            Error::RanTooLong { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn display_has_position_prefix() {
        let err = Error::runtime(Position::new(2, 13), "This is an error");
        assert_eq!(err.to_string(), "2:13: This is an error");
        assert_eq!(err.position(), Some(Position::new(2, 13)));
    }

    #[test]
    fn anyhow_round_trip_keeps_engine_errors() {
        let inner = Error::runtime(Position::new(1, 1), "inner");
        let wrapped: anyhow::Error = inner.clone().into();
        assert_eq!(Error::from_anyhow(wrapped, Position::new(9, 9)), inner);

        let plain = anyhow!("plain failure");
        assert_eq!(
            Error::from_anyhow(plain, Position::new(3, 4)),
            Error::runtime(Position::new(3, 4), "plain failure")
        );
    }

    #[test]
    fn ran_too_long_has_no_position() {
        let err = Error::RanTooLong { limit: 1000 };
        assert_eq!(err.position(), None);
        assert!(err.to_string().contains("too long"));
    }
}
