pub mod exchange;
pub mod observability;
pub mod persistence;
