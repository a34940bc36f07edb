// Session metadata and on-disk layout

pub mod metadata;
pub mod storage;

pub use metadata::*;
pub use storage::*;
