use crate::application::executor::ConversionExecutionRequest;
use crate::domain::payment::PaymentIntentStatus;
use crate::domain::quote::{ConversionQuote, CryptoAmount};
use crate::error::{ConversionError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One CSV row: a paid quote ready to be settled.
#[derive(Debug, Deserialize)]
struct ConversionRequestRecord {
    idempotency_key: String,
    quote_id: String,
    payment_intent_id: String,
    fiat_amount: Decimal,
    fiat_currency: String,
    crypto_amount: u64,
    #[serde(default)]
    crypto_denom: String,
    destination_address: String,
    conversion_rate: Decimal,
    fee: Decimal,
    expires_at: DateTime<Utc>,
    /// Gateway status of the payment intent, if the batch carries it.
    #[serde(default)]
    payment_status: Option<PaymentIntentStatus>,
}

/// A parsed row: the request plus the payment status reported alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRow {
    pub request: ConversionExecutionRequest,
    pub payment_status: Option<PaymentIntentStatus>,
}

impl TryFrom<ConversionRequestRecord> for RequestRow {
    type Error = ConversionError;

    fn try_from(record: ConversionRequestRecord) -> Result<Self> {
        let quote = ConversionQuote {
            id: record.quote_id,
            fiat_amount: record.fiat_amount,
            fiat_currency: record.fiat_currency,
            crypto_amount: CryptoAmount::new(record.crypto_amount)?,
            crypto_denom: record.crypto_denom,
            destination_address: record.destination_address,
            conversion_rate: record.conversion_rate,
            fee: record.fee,
            expires_at: record.expires_at,
        };
        Ok(RequestRow {
            request: ConversionExecutionRequest::new(
                quote,
                record.payment_intent_id,
                record.idempotency_key,
            ),
            payment_status: record.payment_status,
        })
    }
}

/// Reads conversion requests from a CSV source.
///
/// Whitespace around fields is trimmed; an empty `crypto_denom` falls back to
/// the executor's default denomination.
pub struct RequestReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> RequestReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads and converts rows, so large batches stream.
    pub fn requests(self) -> impl Iterator<Item = Result<RequestRow>> {
        self.reader
            .into_deserialize::<ConversionRequestRecord>()
            .map(|result| result.map_err(ConversionError::from).and_then(TryInto::try_into))
    }
}
