mod file;

pub use file::{FileIndex, FileStamp, INDEX_FILE_NAME, LOG_FILE_NAME};
