/// File extensions accepted for upload (lowercase, with leading dot)
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".dwg",
    ".dxf", ".txt", ".zip", ".rar", ".mp4", ".mov",
];

/// MIME types that are never accepted, regardless of extension
pub const DENIED_MIME_TYPES: &[&str] = &[
    "application/x-msdownload",
    "application/x-executable",
    "application/x-sh",
    "application/x-bat",
    "application/x-msdos-program",
    "text/x-shellscript",
];

/// Fallback MIME type when the client declares none
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Fallback name when sanitization leaves nothing usable
pub const FALLBACK_FILENAME: &str = "file";

/// Maximum length of a sanitized filename (extension included)
pub const MAX_FILENAME_LEN: usize = 128;

/// Hard cap on the number of chunks a single upload may declare
pub const MAX_TOTAL_CHUNKS: i32 = 10_000;

/// Suffix of per-chunk advisory lock files
pub const CHUNK_LOCK_SUFFIX: &str = ".lock";

/// Suffix of in-progress chunk writes before the atomic rename
pub const CHUNK_TMP_SUFFIX: &str = ".tmp";
