use std::error;
use std::fmt;

use crate::index_space::IndexSpace;
use crate::patch::PatchId;
use crate::warehouse::Generation;




/**
 * Every failure the engine can report. Store accessors, graph construction,
 * ghost exchange and the transport all return this type; nothing else is
 * used to signal an error.
 */
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    VariableNotFound {
        name: String,
        patch: PatchId,
        material: usize,
        generation: Generation,
    },
    DuplicateVariable {
        name: String,
        patch: PatchId,
        material: usize,
    },
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
    },
    DependencyCycle(Vec<String>),
    InsufficientGhostData {
        name: String,
        region: IndexSpace,
        storage: IndexSpace,
    },
    TransferFailure(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Attach a variable name to an `InsufficientGhostData` error raised by
    /// the name-agnostic packing routines.
    pub(crate) fn named(self, variable: &str) -> Self {
        match self {
            Error::InsufficientGhostData { region, storage, .. } => Error::InsufficientGhostData {
                name: variable.to_string(),
                region,
                storage,
            },
            other => other,
        }
    }

    /// Whether this error was raised by the communication layer.
    pub fn is_transfer_failure(&self) -> bool {
        matches!(self, Error::TransferFailure(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;

        match self {
            VariableNotFound { name, patch, material, generation } => write!(
                fmt,
                "variable '{}' not found on patch {} material {} in the {} generation",
                name, patch, material, generation
            ),
            DuplicateVariable { name, patch, material } => write!(
                fmt,
                "variable '{}' already exists on patch {} material {}",
                name, patch, material
            ),
            TypeMismatch { name, expected, found } => write!(
                fmt,
                "type mismatch for '{}': expected {}, found {}",
                name, expected, found
            ),
            DependencyCycle(tasks) => write!(fmt, "dependency cycle among tasks [{}]", tasks.join(", ")),
            InsufficientGhostData { name, region, storage } => write!(
                fmt,
                "insufficient ghost data for '{}': region {:?} not within storage {:?}",
                name, region, storage
            ),
            TransferFailure(reason) => write!(fmt, "transfer failure: {}", reason),
        }
    }
}

impl error::Error for Error {}
