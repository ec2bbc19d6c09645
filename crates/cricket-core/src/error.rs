// Error taxonomy for room operations.

use thiserror::Error;

/// Why a room operation did not produce a new state.
///
/// Domain violations are detected before anything is written, so every
/// variant except `Store` guarantees the room is unchanged.
#[derive(Debug, Error)]
pub enum AuctionError {
    /// The request breaks a bidding, config, or layout rule.
    #[error("{0}")]
    Rejected(String),

    /// The request is valid in shape but the room is not ready for it
    /// (e.g. skipping while a bid is active, finalizing an incomplete squad).
    #[error("{0}")]
    Precondition(String),

    /// A room or team lookup failed. Durable, not worth retrying.
    #[error("{0} not found")]
    NotFound(String),

    /// The persistence layer failed.
    #[error("store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl AuctionError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        AuctionError::Rejected(reason.into())
    }

    pub fn precondition(reason: impl Into<String>) -> Self {
        AuctionError::Precondition(reason.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        AuctionError::NotFound(what.into())
    }

    /// Stable machine-readable kind used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            AuctionError::Rejected(_) => "rejected",
            AuctionError::Precondition(_) => "precondition",
            AuctionError::NotFound(_) => "not_found",
            AuctionError::Store(_) => "internal",
        }
    }
}

pub type AuctionResult<T> = Result<T, AuctionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(AuctionError::rejected("x").kind(), "rejected");
        assert_eq!(AuctionError::precondition("x").kind(), "precondition");
        assert_eq!(AuctionError::not_found("room abc").kind(), "not_found");
        assert_eq!(
            AuctionError::from(anyhow::anyhow!("disk full")).kind(),
            "internal"
        );
    }

    #[test]
    fn not_found_message_names_the_target() {
        let err = AuctionError::not_found("room ABCDEF");
        assert_eq!(err.to_string(), "room ABCDEF not found");
    }
}
