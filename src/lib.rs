pub mod cli;
pub mod config;
pub mod db;
pub mod dead_letter;
pub mod dispatch;
pub mod max;
pub mod migration;
pub mod resilience;
pub mod telegram;
pub mod utils;

#[cfg(test)]
pub(crate) mod testkit;

pub use config::Config;
pub use db::DatabaseManager;
pub use dead_letter::DeadLetterService;
pub use dispatch::{Dispatcher, MediaGroupAggregator};
pub use migration::{MigrationQueue, Migrator};
