pub mod downtime_ledger;
pub mod midnight_split;
pub mod status_engine;
