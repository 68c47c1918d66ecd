use crate::domain::quote::CryptoAmount;
use serde::{Deserialize, Serialize};

/// An outbound transfer from the treasury to a customer address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub destination: String,
    pub amount: CryptoAmount,
    pub denom: String,
    pub memo: String,
    /// Lets the transfer layer de-duplicate on its own boundary.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    pub tx_hash: String,
    pub block_height: u64,
    pub treasury_address: String,
    pub success: bool,
    pub error: Option<String>,
}

impl TransferResult {
    pub fn rejected(treasury_address: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tx_hash: String::new(),
            block_height: 0,
            treasury_address: treasury_address.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Treasury holdings for one denomination, in base units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreasuryBalance {
    pub available: u64,
    pub reserved: u64,
    pub total: u64,
}

impl TreasuryBalance {
    pub fn covers(&self, amount: CryptoAmount) -> bool {
        self.available >= amount.value()
    }
}
