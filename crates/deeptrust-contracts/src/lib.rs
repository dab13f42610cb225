pub mod audit;
pub mod cache;
pub mod models;
pub mod receipts;
pub mod schema;
pub mod scoring;
