//! The failures a revocation run reports to its caller.
//!
//! Layers below the orchestrator have their own error types; by the time a
//! failure gets here it is one of four kinds, with a readable cause. The
//! details stay in the log.
use thiserror::Error;

/// Why setting a participant up failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupFailure {
    /// Bad command line or configuration.
    Usage,
    /// Reading the key file failed.
    Io,
    /// The key file is missing, malformed, or fails its checks.
    InvalidKeyMaterial,
    /// The key uses an algorithm or curve we cannot sign with.
    UnsupportedAlgorithm,
    /// The channels to the other participants could not be established.
    Channels,
}

#[derive(Debug, Error)]
pub enum RevokeError {
    #[error("setup failed: {reason}")]
    SetupFailed { kind: SetupFailure, reason: String },
    #[error("agreement failed: {0}")]
    AgreementFailed(String),
    #[error("signing failed: {0}")]
    SigningFailed(String),
    #[error("export failed: {0}")]
    ExportFailed(String),
}

/// The classes of failure the command line distinguishes by exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Io,
    InvalidKeyMaterial,
    UnsupportedAlgorithm,
    Agreement,
    Signing,
}

impl FailureKind {
    /// The process exit status, the negative codes of a signed byte.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Io => 255,
            Self::InvalidKeyMaterial => 254,
            Self::UnsupportedAlgorithm => 253,
            Self::Agreement => 252,
            Self::Signing => 251,
        }
    }
}

impl RevokeError {
    pub(crate) fn setup(kind: SetupFailure, reason: impl ToString) -> Self {
        Self::SetupFailed {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::SetupFailed { kind, .. } => match kind {
                SetupFailure::Usage | SetupFailure::Io => FailureKind::Io,
                SetupFailure::InvalidKeyMaterial => FailureKind::InvalidKeyMaterial,
                SetupFailure::UnsupportedAlgorithm => FailureKind::UnsupportedAlgorithm,
                SetupFailure::Channels => FailureKind::Agreement,
            },
            Self::AgreementFailed(_) => FailureKind::Agreement,
            Self::SigningFailed(_) => FailureKind::Signing,
            Self::ExportFailed(_) => FailureKind::Io,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            RevokeError::setup(SetupFailure::Io, "x"),
            RevokeError::setup(SetupFailure::InvalidKeyMaterial, "x"),
            RevokeError::setup(SetupFailure::UnsupportedAlgorithm, "x"),
            RevokeError::AgreementFailed("x".to_string()),
            RevokeError::SigningFailed("x".to_string()),
        ];
        let mut codes: Vec<u8> = errors.iter().map(RevokeError::exit_code).collect();
        codes.dedup();
        assert_eq!(codes, vec![255, 254, 253, 252, 251]);
        assert_eq!(
            RevokeError::ExportFailed("x".to_string()).kind(),
            FailureKind::Io
        );
        assert_eq!(
            RevokeError::setup(SetupFailure::Channels, "x").kind(),
            FailureKind::Agreement
        );
    }
}
