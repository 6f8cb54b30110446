pub mod address;
pub mod classifier;
pub mod config;
pub mod database;
pub mod dedup;
pub mod fingerprint;
pub mod geo_lookup;
pub mod models;
pub mod ping;
pub mod protocol;
pub mod ratelimiter;
pub mod response;
pub mod scanner;
pub mod schema;
pub mod utils;
pub mod varint;
