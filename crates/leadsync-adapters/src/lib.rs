//! Inbound adapters: the partner mailbox and the spreadsheets it delivers.

pub mod mailbox;
pub mod workbook;

pub use mailbox::{
    AttachmentRetriever, ImapConfig, ImapConnector, MailConnector, MailError, MailQuery, Mailbox,
    MemoryMailConnector, RawMessage, RetrievedAttachment, Retrieval, ATTACHMENT_EXTENSIONS,
    DEFAULT_MAX_MESSAGES_PER_RUN,
};
pub use workbook::{
    extract_records, Extraction, RawRow, RowRejection, SkippedRow, WorkbookError, HEADER_SCAN_ROWS,
};

pub const CRATE_NAME: &str = "leadsync-adapters";
