mod descriptor;
pub(crate) mod naming;
pub(crate) mod saga;

pub use descriptor::{BackupDescriptor, BackupLocation, BackupOrigin};
pub use saga::{BackupSaga, BackupSummary, SagaOutcome, SagaReport};
