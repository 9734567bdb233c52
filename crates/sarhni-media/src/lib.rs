pub mod sniff;
pub mod storage;

#[cfg(any(test, feature = "test-util"))]
pub use sniff::fixtures;
pub use sniff::{ImageInfo, ImageKind, MAX_DIMENSION, MAX_UPLOAD_BYTES, UploadError, validate};
pub use storage::Storage;
