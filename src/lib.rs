pub mod config;
pub mod content;
pub mod db;
pub mod delivery;
pub mod dispatch;
pub mod ledger;
pub mod listener;
pub mod lock;
pub mod model;
pub mod payload;
pub mod registry;
