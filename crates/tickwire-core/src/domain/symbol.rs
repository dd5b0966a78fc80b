use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

const MAX_SYMBOL_LEN: usize = 20;

/// Case-normalized instrument identifier.
///
/// Two raw inputs that differ only in case or surrounding whitespace parse to
/// the same `Symbol`, which is what bulk deduplication relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Parse and normalize a raw ticker to its canonical uppercase form.
    pub fn parse(input: &str) -> Result<Self, ApiError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ApiError::Validation(String::from("symbol cannot be empty")));
        }

        let normalized = trimmed.to_ascii_uppercase();
        if normalized.len() > MAX_SYMBOL_LEN {
            return Err(ApiError::Validation(format!(
                "symbol '{normalized}' exceeds {MAX_SYMBOL_LEN} characters"
            )));
        }

        for ch in normalized.chars() {
            let valid = ch.is_ascii_alphanumeric() || ch == '.' || ch == '-';
            if !valid {
                return Err(ApiError::Validation(format!(
                    "symbol '{normalized}' contains invalid character '{ch}'"
                )));
            }
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Symbol {
    type Error = ApiError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for Symbol {
    type Error = ApiError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}
