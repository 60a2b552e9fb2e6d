//! In-memory test doubles and scenario builders for `datahub-core`:
//! the traits the core publishes (`Store`, `JobStore`, `DataSource`)
//! faked out in memory, plus a scripted `JobBody` for driving the
//! literal end-to-end scenarios in spec §8.

mod fake_source;
mod in_memory_job_store;
mod in_memory_store;
mod scripted_job;

pub use fake_source::FakeDataSource;
pub use in_memory_job_store::InMemoryJobStore;
pub use in_memory_store::InMemoryStore;
pub use scripted_job::{ScriptedJob, Step};
