pub mod analysis;
pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod fasta;
pub mod fetch;
pub mod hasher;
pub mod history;
pub mod http;
pub mod ledger;
pub mod output;
pub mod store;
