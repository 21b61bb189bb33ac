use crate::decode::{DecodeError, DecodedRow};

/// Feature preprocessing applied to every decoded row before it is handed downstream.
pub trait Preprocessor: Send + Sync {
    fn process(&self, row: DecodedRow) -> Result<DecodedRow, DecodeError>;
}

/// Passes rows through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPreprocessor;

impl Preprocessor for IdentityPreprocessor {
    fn process(&self, row: DecodedRow) -> Result<DecodedRow, DecodeError> {
        Ok(row)
    }
}
