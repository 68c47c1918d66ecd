use crate::domain::ledger::ConversionErrorCode;
use crate::error::ConversionError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A positive crypto amount in the denomination's base units (e.g. `uve`).
///
/// Zero is never a valid transfer amount, so the constructor rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct CryptoAmount(u64);

impl CryptoAmount {
    pub fn new(value: u64) -> Result<Self, ConversionError> {
        if value > 0 {
            Ok(Self(value))
        } else {
            Err(ConversionError::rejected(
                ConversionErrorCode::InvalidRequest,
                "Crypto amount must be positive",
            ))
        }
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl TryFrom<u64> for CryptoAmount {
    type Error = ConversionError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CryptoAmount> for u64 {
    fn from(amount: CryptoAmount) -> Self {
        amount.0
    }
}

impl fmt::Display for CryptoAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A priced, time-bounded offer to convert fiat into crypto.
///
/// Issued by the pricing layer and consumed read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionQuote {
    pub id: String,
    /// Fiat amount in major currency units.
    pub fiat_amount: Decimal,
    pub fiat_currency: String,
    pub crypto_amount: CryptoAmount,
    /// Empty means the executor's default denomination.
    pub crypto_denom: String,
    pub destination_address: String,
    pub conversion_rate: Decimal,
    pub fee: Decimal,
    pub expires_at: DateTime<Utc>,
}

impl ConversionQuote {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
