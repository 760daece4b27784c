pub mod catalog;
pub mod chunked;
pub mod config;
pub mod countries;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod geometry;
pub mod output;
pub mod overpass;
pub mod query;
pub mod runner;
pub mod store;
pub mod transform;
