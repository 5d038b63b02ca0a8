//! The ingest pipeline workers
//!
//! fetch -> validate -> store -> record, fed by the bucket reader. Each
//! worker consumes its own topic, claims the work item, does its stage, and
//! hands the item to the next stage by writing (stage = next,
//! status = Pending) to the registry, where that stage's poll finds it.

pub mod bucket_reader;
pub mod common;
pub mod fetcher;
pub mod recorder;
pub mod storer;
pub mod validator;

pub use bucket_reader::BucketReader;
pub use common::IngestState;
pub use fetcher::FetchWorker;
pub use recorder::RecordWorker;
pub use storer::StoreWorker;
pub use validator::ValidateWorker;
