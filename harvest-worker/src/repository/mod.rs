//! Repository layer
//!
//! Repositories are thin data-access objects over the job store, the
//! tenant catalog and the result store. They carry no business logic.
//!
//! All repositories are trait-based so the scheduler can run against the
//! in-memory store in tests.

mod catalog;
mod jobs;
mod memory;
mod results;

// Re-export traits
pub use catalog::CatalogRepository;
pub use jobs::JobRepository;
pub use results::ResultRepository;

// Re-export implementations
pub use catalog::PgCatalogRepository;
pub use jobs::PgJobRepository;
pub use memory::InMemoryStore;
pub use results::PgResultRepository;

pub use catalog::{Brand, OwnProduct};
pub use results::{DEFAULT_CURRENCY, ResultScope};
