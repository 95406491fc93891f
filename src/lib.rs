pub mod config;
pub mod db;
pub mod engine;
pub mod model;
pub mod store;
