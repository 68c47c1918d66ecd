//! Batch I/O used by the command-line runner.

pub mod csv;
