use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::HermesError;

/// Feature identifier, rendered as `Fnnn` (zero-padded to three digits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeatureId(u32);

/// Task identifier, rendered as `Tnnn`. Task ids are globally unique across
/// all features and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(u32);

fn parse_tagged_id(input: &str, tag: char) -> Option<u32> {
    let trimmed = input.trim();
    let mut chars = trimmed.chars();
    if chars.next() != Some(tag) {
        return None;
    }
    let digits = chars.as_str();
    if digits.len() != 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u32>().ok().filter(|n| *n >= 1)
}

impl FeatureId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl TaskId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{:03}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{:03}", self.0)
    }
}

impl FromStr for FeatureId {
    type Err = HermesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_tagged_id(s, 'F')
            .map(Self)
            .ok_or_else(|| HermesError::invalid_plan(format!("invalid feature id `{s}`")))
    }
}

impl FromStr for TaskId {
    type Err = HermesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_tagged_id(s, 'T')
            .map(Self)
            .ok_or_else(|| HermesError::invalid_plan(format!("invalid task id `{s}`")))
    }
}

impl TryFrom<String> for FeatureId {
    type Error = HermesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FeatureId> for String {
    fn from(value: FeatureId) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for TaskId {
    type Error = HermesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(value: TaskId) -> Self {
        value.to_string()
    }
}
