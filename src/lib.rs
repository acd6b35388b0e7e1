pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod gate;
pub mod intent;
pub mod ledger;
pub mod logging;
pub mod notifier;
pub mod provider;
pub mod settlement;

pub use error::{BillingError, Result};
