pub mod file_operations;

pub use file_operations::{copy_file, copy_tree, TransferStats};
