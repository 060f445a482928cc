use thiserror::Error;

use crate::cache::CacheError;
use crate::core::wire::{DecodeError, EncodeError};
use crate::folder::ChainError;
use crate::server::{CryptoError, ServerError};

/// Whether a failed folder operation is worth repeating.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Structural failure: a bad signature, a broken chain, a malformed
    /// batch. Repeating the call cannot change the outcome.
    Permanent,
    /// Contention or a flaky capability (a conflicting writer, a block
    /// server hiccup); back off and try again.
    Retryable,
    /// The error alone does not say.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// How far a failed operation may have gotten before it stopped.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Failed before anything left this process.
    None,
    /// Blocks or a revision definitely reached a server.
    Some,
    /// Partial progress is possible: some block puts may have landed
    /// before a sibling failed or the call was cancelled.
    Unknown,
}

/// One enum over the capability errors so callers hold a single type. The
/// classification helpers say whether to retry and whether anything may
/// have landed remotely.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            // a cache miss is recoverable by fetching
            Error::Cache(CacheError::NoSuchBlock(_)) => Transience::Retryable,
            Error::Encode(_) | Error::Decode(_) => Transience::Permanent,
            Error::Server(err) => {
                if err.is_retryable() {
                    Transience::Retryable
                } else {
                    Transience::Permanent
                }
            }
            // rekey errors clear once some device rekeys
            Error::Crypto(CryptoError::NeedSelfRekey(_) | CryptoError::NeedOtherRekey(_)) => {
                Transience::Retryable
            }
            Error::Crypto(CryptoError::BadSignature) => Transience::Permanent,
            Error::Chain(err) => match err {
                ChainError::Server(inner) if inner.is_retryable() => Transience::Retryable,
                ChainError::ResolutionStuck(_) => Transience::Retryable,
                ChainError::Cancelled => Transience::Unknown,
                ChainError::ChainBroken(_) | ChainError::SignatureInvalid(_) => {
                    Transience::Permanent
                }
                _ => Transience::Permanent,
            },
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // purely local failures leave no trace
            Error::Cache(_) | Error::Encode(_) | Error::Decode(_) | Error::Crypto(_) => {
                Effect::None
            }
            // a server call or chain mutation may have landed before failing
            Error::Server(_) | Error::Chain(_) => Effect::Unknown,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Server(ServerError::Cancelled) => true,
            Error::Chain(err) => err.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::BlockId;
    use crate::core::identity::TlfId;

    #[test]
    fn classification() {
        let miss: Error = CacheError::NoSuchBlock(BlockId::default()).into();
        assert!(miss.transience().is_retryable());
        assert!(!miss.is_cancelled());

        let cancelled: Error = ChainError::Cancelled.into();
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.transience(), Transience::Unknown);

        let broken: Error = ChainError::ChainBroken(crate::core::revision::RevisionNumber::INITIAL)
            .into();
        assert_eq!(broken.transience(), Transience::Permanent);

        let rekey: Error = CryptoError::NeedSelfRekey(TlfId::new([0; 16])).into();
        assert!(rekey.transience().is_retryable());
        assert_eq!(rekey.effect(), Effect::None);
    }
}
