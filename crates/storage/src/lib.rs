pub mod backup;
pub mod db;
pub mod error;
pub mod memory;

pub use backup::{create_backup, list_backups, verify_backup, BackupInfo, BackupMetadata};
pub use db::{create_db, DbPool, SqliteLedger};
pub use error::StoreError;
pub use memory::MemoryLedger;
