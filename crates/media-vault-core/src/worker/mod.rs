pub mod channel;
pub mod file_worker;

pub use channel::{Correlator, ProgressEmitter, ProgressSink, UploadProgress};
pub use file_worker::{
    DirEntry, FilePayload, FileRequest, FileResponse, FileWorker, UploadReceipt, UploadSource,
};
