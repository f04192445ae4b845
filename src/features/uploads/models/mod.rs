mod chunked_upload;
mod stored_file;

pub use chunked_upload::{parse_chunk_list, progress_percent, serialize_chunk_list, ChunkedUpload};
pub use stored_file::StoredFile;
