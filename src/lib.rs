//! Fault-tolerant ETL pipeline for the Steam catalog.
//!
//! Three cooperating stages: resumable harvesters that pull the catalog
//! through a rate-limited client into immutable batch files, a defensive
//! bulk loader that lands those batches in a normalized store in three
//! ordered phases, and a validation framework that checks the result at
//! every layer. Gap detection and backfill close the loop between the two
//! harvest tracks.

pub mod analyzer;
pub mod backfill;
pub mod checkpoint;
pub mod client;
pub mod db;
pub mod error;
pub mod gaps;
pub mod harvester;
pub mod loader;
pub mod stream;
pub mod tracing;
pub mod util;
pub mod validation;
