pub mod receipt;

pub use receipt::{build_receipt, write_receipt, JobReceipt, RECEIPT_SCHEMA_VERSION};
