//! Local-first DEX trading journal and execution-safety core.
//!
//! The ledger is the single source of truth; PnL, portfolio, tax and
//! archival views derive from it. Conditional orders run through one
//! cooperative trigger loop, and every mutating surface is gated by the
//! system-state controller's emergency stop.

pub mod config;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod money;
pub mod orders;
pub mod positions;
pub mod reporting;
pub mod security;
pub mod store;
pub mod system;
pub mod tokens;
pub mod trading;
pub mod wallets;

#[cfg(test)]
pub mod testutil;

pub use config::{AccountingMethod, CoreConfig, TaxJurisdiction};
pub use error::{CoreError, CoreResult};
pub use ids::{ChainId, TokenRef, TraceId};
pub use money::{Money, MoneyError, RoundingMode};
pub use store::Store;
