use crate::domain::ledger::ConversionLedgerEntry;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct LedgerEntryRecord<'a> {
    id: String,
    idempotency_key: &'a str,
    status: &'static str,
    crypto_amount: u64,
    crypto_denom: &'a str,
    destination_address: &'a str,
    retry_count: u32,
    error_code: Option<&'static str>,
    tx_hash: Option<&'a str>,
    block_height: Option<u64>,
}

impl<'a> From<&'a ConversionLedgerEntry> for LedgerEntryRecord<'a> {
    fn from(entry: &'a ConversionLedgerEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            idempotency_key: &entry.idempotency_key,
            status: entry.status.as_str(),
            crypto_amount: entry.crypto_amount.value(),
            crypto_denom: &entry.crypto_denom,
            destination_address: &entry.destination_address,
            retry_count: entry.retry_count,
            error_code: entry.error_code.map(|code| code.as_str()),
            tx_hash: entry.tx_hash.as_deref(),
            block_height: entry.block_height,
        }
    }
}

/// Writes ledger entries as CSV, one row per entry.
pub struct EntryWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> EntryWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_entries<'a, I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a ConversionLedgerEntry>,
    {
        for entry in entries {
            self.writer.serialize(LedgerEntryRecord::from(entry))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
