use serde::{Deserialize, Serialize};

/// Hard failures while resolving a `${...}` pattern.
///
/// A pattern that merely cannot be resolved yet (unknown prefix, missing value, partially
/// resolved function argument) is not an error; it comes back as a not-fully-resolved value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ResolveError {
    #[error("cannot resolve global.{0}: expected <map>#<field>")]
    MalformedGlobal(String),
    #[error("cannot resolve {0}: expected name(arg,...)")]
    MalformedCall(String),
    #[error("cannot resolve func.{0}: unknown function")]
    UnknownFunction(String),
    #[error("cannot resolve snippet.{0}: unknown snippet")]
    UnknownSnippet(String),
    #[error("cannot resolve {name}: {count} argument(s) not allowed")]
    ArgumentCount { name: String, count: usize },
    #[error("cannot resolve var.{0}: cyclic variable reference")]
    CyclicVariable(String),
    #[error("cannot resolve var.{0}: no such variable")]
    UnknownVariable(String),
    #[error("cannot resolve resource.{path}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("cannot resolve {name}: {reason}")]
    FunctionFailed { name: String, reason: String },
}

/// User-input validation failures. Carries the offending field whenever one applies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("no input named {0}")]
    UnknownInput(String),
    #[error("field {field}: not declared by the input")]
    UnexpectedField { field: String },
    #[error("field {field}: value must be a string, number or boolean")]
    NotPrimitive { field: String },
    #[error("field {field}: {message}")]
    Invalid { field: String, message: String },
    #[error("field {field}: validator failed: {reason}")]
    ValidatorFailed { field: String, reason: String },
    #[error("field {field}: validator returned a malformed result")]
    MalformedValidatorResult { field: String },
    #[error("field {field}: required")]
    MissingField { field: String },
}

impl ValidationError {
    pub fn field(&self) -> Option<&str> {
        match self {
            ValidationError::UnknownInput(_) => None,
            ValidationError::UnexpectedField { field }
            | ValidationError::NotPrimitive { field }
            | ValidationError::Invalid { field, .. }
            | ValidationError::ValidatorFailed { field, .. }
            | ValidationError::MalformedValidatorResult { field }
            | ValidationError::MissingField { field } => Some(field),
        }
    }
}
