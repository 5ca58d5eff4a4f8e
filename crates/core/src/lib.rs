pub mod error;
pub mod money;
pub mod period;
pub mod store;
pub mod transaction;

pub use error::CoreError;
pub use money::Money;
pub use period::{DateRange, PayPeriod, DEFAULT_PAY_DAY};
pub use store::{LedgerStore, TransactionFilter};
pub use transaction::{
    split_amounts, Estado, Frequency, SettlementStatus, Transaction, TransactionKind,
};
