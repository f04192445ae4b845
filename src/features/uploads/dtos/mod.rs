mod upload_dto;

pub use upload_dto::{
    validate_filename, CancelUploadDto, ChunkReceiptDto, ChunkUploadFormDto, CleanupReportDto,
    CompleteUploadDto, FileCategory, InitiateUploadDto, StoredFileDto, UploadSessionDto,
    UploadStatusDto,
};
