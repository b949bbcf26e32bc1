//! Header pattern matching.
//!
//! The primary false-positive filter of the carver: given the serial-type
//! codes decoded from a candidate record header, decide whether they are
//! consistent with a known table or index signature. Each declared column
//! type admits a set of serial codes; a single column outside its set
//! invalidates the whole candidate.

use crate::schema::ColumnType;

/// A positional constraint pattern compiled from a column-type signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPattern {
    signature: Vec<ColumnType>,
}

impl HeaderPattern {
    /// Compile a pattern from an ordered column-type signature.
    pub fn new(signature: impl Into<Vec<ColumnType>>) -> Self {
        Self {
            signature: signature.into(),
        }
    }

    /// Number of columns the pattern expects
    pub fn arity(&self) -> usize {
        self.signature.len()
    }

    /// The signature this pattern was compiled from
    pub fn signature(&self) -> &[ColumnType] {
        &self.signature
    }

    /// Test a decoded serial-type code sequence against the signature.
    ///
    /// Positional: code `i` must be admissible for column `i`. Arity must
    /// match exactly. Short-circuits on the first failing column.
    pub fn matches(&self, codes: &[u64]) -> bool {
        codes.len() == self.signature.len()
            && self
                .signature
                .iter()
                .zip(codes)
                .all(|(&ty, &code)| Self::admits(ty, code))
    }

    /// Admissible serial codes per declared column type.
    ///
    /// NULL (code 0) stands in for any integer-family column and for
    /// TEXT/BLOB; REAL admits only an actual float.
    fn admits(ty: ColumnType, code: u64) -> bool {
        match ty {
            ColumnType::Int => code <= 6,
            ColumnType::Real => code == 7,
            ColumnType::Text => code == 0 || (code > 13 && code % 2 == 1),
            ColumnType::Blob => code == 0 || (code > 12 && code % 2 == 0),
            ColumnType::Numeric => code <= 9,
        }
    }
}
