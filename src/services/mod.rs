pub mod bulk_copy;
pub mod checksum;
pub mod copy_strategy;
pub mod export;

pub use bulk_copy::{
    BulkCopyConfig, BulkCopyJob, BulkCopyRequest, CommandBulkCopyJob, DisabledBulkCopyJob,
};
pub use checksum::{ChecksumSource, NativeOrSha256};
pub use copy_strategy::{
    CopyMethod, CopyPolicyConfig, CopyReport, CopyStrategySelector, GroupOutcome, SourceGroup,
};
pub use export::{ExportMode, ExportPlanner, ExportReport};
