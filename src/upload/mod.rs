mod loop_worker;
mod sink;

pub use loop_worker::{upload_loop, UploadConfig};
pub use sink::{encode_record, BatchSink, HttpBatchSink, MAX_SINK_RECORDS};
