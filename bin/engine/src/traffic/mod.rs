mod daemon;
mod enforce;
mod ingest;

pub use daemon::{DaemonSample, DaemonSource, SqliteDaemonSource};
pub use enforce::enforce_limits;
pub use ingest::ingest_provider;
