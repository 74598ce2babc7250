pub mod app;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod convert;
pub mod depotize;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod import;
pub mod object_store;
pub mod oracle;
pub mod output;
pub mod store;
pub mod sync;
pub mod tools;
pub mod user_depot;
