pub mod config;
pub mod domain;
pub mod harvest;
pub mod humanize;
pub mod ledger;
pub mod master;
pub mod messaging;
pub mod observability;
pub mod proto;
pub mod queue;
pub mod storage;
pub mod worker;
