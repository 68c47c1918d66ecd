pub mod entry_writer;
pub mod request_reader;
