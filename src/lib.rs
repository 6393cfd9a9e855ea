pub mod audit;
pub mod authorize;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod ledger;
pub mod planner;
pub mod service;
pub mod trip;
pub mod utils;
pub mod visibility;
pub mod workflow;
