//! Convenience prelude for distributed lock types.

pub use crate::error::{LockError, LockResult};
pub use crate::holder::{InstanceId, OwnerId};
pub use crate::record::{
    AcquireOutcome, LockRecord, NotificationEvent, ReleaseOutcome, WaitEntry, expiry_after,
};
pub use crate::store::{LockRecordStore, LockStore, NotificationLog, SequenceCounter, WaitRegistry};
pub use crate::timeout::{Lease, Timeout};
pub use crate::traits::{DLock, LockClient, LockClientExt, LockHandle};
