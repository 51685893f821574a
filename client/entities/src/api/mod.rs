pub mod task_payload;

pub use task_payload::*;
