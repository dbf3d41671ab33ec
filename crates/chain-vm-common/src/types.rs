//! Contract descriptors and invocation results.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a deployed contract version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ContractId {
    /// Contract name.
    pub name: String,
    /// Contract version.
    pub version: String,
}

impl ContractId {
    /// Create a new contract id.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Registry key of this contract version (`name_version`).
    pub fn key(&self) -> String {
        format!("{}_{}", self.name, self.version)
    }

    /// Returns `true` if both name and version are set.
    pub fn is_complete(&self) -> bool {
        !self.name.is_empty() && !self.version.is_empty()
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.version)
    }
}

/// An event emitted by a contract.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ContractEvent {
    /// Event topic.
    pub topic: String,
    /// Transaction that emitted the event.
    pub tx_id: String,
    /// Name of the emitting contract.
    pub contract_name: String,
    /// Version of the emitting contract.
    pub contract_version: String,
    /// Event payload.
    pub data: Vec<String>,
}

/// Scheduling class a transaction earns from the host operations its
/// contracts used.
///
/// Transactions that opened a state iterator read key ranges rather than
/// single keys, so schedulers order them apart from the rest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecOrderTxType {
    /// Point reads and writes only.
    #[default]
    Normal,
    /// At least one range or prefix iterator was opened.
    Iterator,
}

impl ExecOrderTxType {
    /// Combine the classes of two parts of one transaction.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Normal, Self::Normal) => Self::Normal,
            _ => Self::Iterator,
        }
    }
}

/// Outcome of one contract invocation.
///
/// `code` is zero on success. Guest code sets `result` and `message` through
/// the `success_result` / `error_result` syscalls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ContractResult {
    /// Zero on success, nonzero on failure.
    pub code: u32,
    /// Bytes returned by the contract.
    pub result: Vec<u8>,
    /// Human readable message, accumulated on failure.
    pub message: String,
    /// Gas consumed, including the caller chain.
    pub gas_used: u64,
    /// Events emitted during the invocation.
    pub events: Vec<ContractEvent>,
    /// Scheduling class, including nested calls.
    #[serde(default)]
    pub special_tx_type: ExecOrderTxType,
}

impl ContractResult {
    /// Code of a successful invocation.
    pub const SUCCESS: u32 = 0;

    /// Code of a failed invocation.
    pub const FAILURE: u32 = 1;

    /// Returns `true` if the invocation succeeded.
    pub fn is_success(&self) -> bool {
        self.code == Self::SUCCESS
    }

    /// Mark the result as failed and append a message.
    pub fn record_error(&mut self, msg: &str) {
        if self.message.is_empty() {
            self.message.push_str("error message: ");
        } else {
            self.message.push_str(". error message: ");
        }
        self.message.push_str(msg);
        self.code = Self::FAILURE;
    }
}
