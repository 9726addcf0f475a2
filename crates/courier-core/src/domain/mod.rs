//! Domain model: task records, references, errors.

pub mod errors;
pub mod ids;
pub mod task;

pub use self::errors::{DispatchError, PublishError, StoreError};
pub use self::ids::TaskRef;
pub use self::task::{Document, RecordError, TaskDocument, TaskRecord, TaskStatus};
