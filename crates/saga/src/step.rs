use serde::{Deserialize, Serialize};

/// Stable identifier of a step within a saga definition.
///
/// Step ids are persisted in saga instances, so renaming one breaks every
/// instance recorded under the old name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaStepId(String);

impl SagaStepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SagaStepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SagaStepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SagaStepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<str> for SagaStepId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for SagaStepId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
