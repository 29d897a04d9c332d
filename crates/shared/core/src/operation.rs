use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Trading operation carried in signal payloads (`"BUY"` / `"SELL"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Buy,
    Sell,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown operation: {0}")]
pub struct UnknownOperation(pub String);

impl Operation {
    /// Returns the opposite operation
    pub fn opposite(&self) -> Self {
        match self {
            Operation::Buy => Operation::Sell,
            Operation::Sell => Operation::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Buy => "BUY",
            Operation::Sell => "SELL",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Operation::Buy),
            "SELL" => Ok(Operation::Sell),
            other => Err(UnknownOperation(other.to_string())),
        }
    }
}
