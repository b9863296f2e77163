#![allow(dead_code)]

pub mod builders;
pub mod db;

pub use builders::{tokens, PrefixVerifier, RacingVerifier, ServiceBuilder};
pub use db::TestDb;
