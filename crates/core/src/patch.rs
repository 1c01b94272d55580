//! Tri-state field updates.
//!
//! A partial update has to tell "leave this field alone" apart from "clear this
//! field". `Patch` keeps those as distinct variants instead of folding both into
//! `Option::None`. With `#[serde(default)]` on the containing struct, a missing key
//! deserializes to `Absent` and an explicit JSON `null` to `Null`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::FunnelError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Patch<T> {
    Absent,
    Null,
    Value(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Self::Absent
    }
}

impl<T> Patch<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Applies the patch to a nullable field.
    pub fn apply_nullable(self, current: Option<T>) -> Option<T> {
        match self {
            Self::Absent => current,
            Self::Null => None,
            Self::Value(value) => Some(value),
        }
    }

    /// Applies the patch to a field that cannot be cleared.
    pub fn apply_required(self, current: T, field: &str) -> Result<T, FunnelError> {
        match self {
            Self::Absent => Ok(current),
            Self::Null => Err(FunnelError::Config(format!("`{field}` cannot be cleared"))),
            Self::Value(value) => Ok(value),
        }
    }

    pub fn as_value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Absent | Self::Null => None,
        }
    }
}

impl<T> From<Option<T>> for Patch<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Value(value),
            None => Self::Null,
        }
    }
}

impl<'de, T> Deserialize<'de> for Patch<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Self::from)
    }
}

impl<T> Serialize for Patch<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Value(value) => serializer.serialize_some(value),
            Self::Absent | Self::Null => serializer.serialize_none(),
        }
    }
}
