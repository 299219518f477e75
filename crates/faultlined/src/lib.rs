pub mod aggregate_stage;
pub mod aggregator;
pub mod cli;
pub mod cluster_stage;
pub mod enrich_stage;
pub mod feedback;
pub mod ingest;
pub mod logging;
pub mod query;
pub mod runtime;
pub mod stats;
pub mod timers;
pub mod worker;
