/// CSV export of replay results.
pub mod export;
