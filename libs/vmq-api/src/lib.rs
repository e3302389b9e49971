pub mod clock;
pub mod codec;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod record;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock, now_ms};
pub use codec::SessionCodec;
pub use error::{ErrorKind, ProtocolError, StoreError, StoreErrorKind};
pub use metrics::{Metrics, NoopMetrics};
pub use protocol::{Delivery, Event, Operation, StartPosition};
pub use record::{Headers, NewRecord, Record, TopicPartition};
pub use storage::{CommittedOffset, CursorStore, PartitionLog, StorageBackend, StorageFactory};
