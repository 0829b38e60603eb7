//! Partner mailbox access and attachment retrieval.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use leadsync_core::RunError;
use leadsync_storage::StagingArea;
use mailparse::{MailAddr, MailHeaderMap, ParsedMail};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Spreadsheet extensions accepted as partner attachments (lowercase).
pub const ATTACHMENT_EXTENSIONS: &[&str] = &["xlsx", "xls", "xlsm", "xlsb", "ods"];

pub const DEFAULT_MAX_MESSAGES_PER_RUN: usize = 50;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail server connection failed: {0}")]
    Connect(String),
    #[error("mail login failed: {0}")]
    Login(String),
    #[error("cannot select mailbox `{mailbox}`: {message}")]
    Select { mailbox: String, message: String },
    #[error("mail search failed: {0}")]
    Search(String),
    #[error("fetching message {uid} failed: {message}")]
    Fetch { uid: u32, message: String },
    #[error("marking messages as read failed: {0}")]
    MarkSeen(String),
    #[error("mail session already closed")]
    Closed,
    #[error("mail worker task failed: {0}")]
    Worker(String),
}

/// Selection criteria for partner messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailQuery {
    pub sender: String,
    pub since: NaiveDate,
}

impl MailQuery {
    pub fn new(sender: impl Into<String>, since: NaiveDate) -> Self {
        Self {
            sender: sender.into(),
            since,
        }
    }

    /// IMAP `SEARCH` criteria: unread, from the partner, on or after the cutoff.
    pub fn to_imap_search(&self) -> String {
        let sender = self.sender.replace(['"', '\\'], "");
        format!(
            "UNSEEN FROM \"{}\" SINCE {}",
            sender,
            self.since.format("%d-%b-%Y")
        )
    }

    fn sender_matches(&self, address: &str) -> bool {
        address.trim().eq_ignore_ascii_case(self.sender.trim())
    }
}

/// A message as fetched from the server, body undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: u32,
    pub internal_date: Option<DateTime<Utc>>,
    pub rfc822: Vec<u8>,
}

/// One open mailbox session. Dropped after `logout`.
#[async_trait]
pub trait Mailbox: Send {
    /// UIDs matching the query, in any order.
    async fn search(&mut self, query: &MailQuery) -> Result<Vec<u32>, MailError>;
    async fn fetch(&mut self, uid: u32) -> Result<RawMessage, MailError>;
    async fn mark_seen(&mut self, uids: &[u32]) -> Result<(), MailError>;
    async fn logout(&mut self) -> Result<(), MailError>;
}

#[async_trait]
pub trait MailConnector: Send + Sync {
    /// Open, authenticate and select the configured mailbox.
    async fn connect(&self) -> Result<Box<dyn Mailbox>, MailError>;
}

#[derive(Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub tls: bool,
    pub accept_invalid_certs: bool,
    pub mailbox: String,
    pub timeout: Duration,
}

impl fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("tls", &self.tls)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("mailbox", &self.mailbox)
            .field("timeout", &self.timeout)
            .finish()
    }
}

trait ImapStream: Read + Write + Send {}

impl<T: Read + Write + Send> ImapStream for T {}

type ImapSession = imap::Session<Box<dyn ImapStream>>;

/// Production connector over the blocking `imap` client.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

fn open_session(config: &ImapConfig) -> Result<ImapSession, MailError> {
    let address = format!("{}:{}", config.host, config.port);
    let tcp = TcpStream::connect(&address).map_err(|e| MailError::Connect(format!("{address}: {e}")))?;
    tcp.set_read_timeout(Some(config.timeout))
        .and_then(|_| tcp.set_write_timeout(Some(config.timeout)))
        .map_err(|e| MailError::Connect(format!("{address}: {e}")))?;

    let stream: Box<dyn ImapStream> = if config.tls {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| MailError::Connect(e.to_string()))?;
        let tls = connector
            .connect(&config.host, tcp)
            .map_err(|e| MailError::Connect(format!("{address}: {e}")))?;
        Box::new(tls)
    } else {
        Box::new(tcp)
    };

    let mut client = imap::Client::new(stream);
    client
        .read_greeting()
        .map_err(|e| MailError::Connect(format!("{address}: {e}")))?;
    let mut session = client
        .login(&config.user, &config.password)
        .map_err(|(e, _)| MailError::Login(e.to_string()))?;
    if let Err(err) = session.select(&config.mailbox) {
        let _ = session.logout();
        return Err(MailError::Select {
            mailbox: config.mailbox.clone(),
            message: err.to_string(),
        });
    }
    Ok(session)
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn Mailbox>, MailError> {
        let config = self.config.clone();
        let session = tokio::task::spawn_blocking(move || open_session(&config))
            .await
            .map_err(|e| MailError::Worker(e.to_string()))??;
        debug!(host = %self.config.host, mailbox = %self.config.mailbox, "imap session opened");
        Ok(Box::new(ImapMailbox {
            session: Some(session),
        }))
    }
}

/// Session handle moved onto a blocking thread for each command.
pub struct ImapMailbox {
    session: Option<ImapSession>,
}

impl ImapMailbox {
    async fn with_session<R, F>(&mut self, op: F) -> Result<R, MailError>
    where
        R: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<R, MailError> + Send + 'static,
    {
        let mut session = self.session.take().ok_or(MailError::Closed)?;
        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut session);
            (session, result)
        })
        .await
        .map_err(|e| MailError::Worker(e.to_string()))?;
        self.session = Some(session);
        result
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn search(&mut self, query: &MailQuery) -> Result<Vec<u32>, MailError> {
        let criteria = query.to_imap_search();
        self.with_session(move |session| {
            let uids = session
                .uid_search(&criteria)
                .map_err(|e| MailError::Search(e.to_string()))?;
            Ok(uids.into_iter().collect())
        })
        .await
    }

    async fn fetch(&mut self, uid: u32) -> Result<RawMessage, MailError> {
        self.with_session(move |session| {
            let fetches = session
                .uid_fetch(uid.to_string(), "(UID INTERNALDATE RFC822)")
                .map_err(|e| MailError::Fetch {
                    uid,
                    message: e.to_string(),
                })?;
            let fetch = fetches
                .iter()
                .find(|f| f.uid == Some(uid))
                .or_else(|| fetches.iter().next())
                .ok_or_else(|| MailError::Fetch {
                    uid,
                    message: "server returned no message".to_string(),
                })?;
            let body = fetch.body().ok_or_else(|| MailError::Fetch {
                uid,
                message: "message has no RFC822 body".to_string(),
            })?;
            Ok(RawMessage {
                uid,
                internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
                rfc822: body.to_vec(),
            })
        })
        .await
    }

    async fn mark_seen(&mut self, uids: &[u32]) -> Result<(), MailError> {
        if uids.is_empty() {
            return Ok(());
        }
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.with_session(move |session| {
            session
                .uid_store(&set, "+FLAGS (\\Seen)")
                .map_err(|e| MailError::MarkSeen(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn logout(&mut self) -> Result<(), MailError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || session.logout())
            .await
            .map_err(|e| MailError::Worker(e.to_string()))?
            .map_err(|e| MailError::Connect(e.to_string()))
    }
}

#[derive(Debug)]
struct StoredMessage {
    rfc822: Vec<u8>,
    internal_date: DateTime<Utc>,
    from: String,
    seen: bool,
}

#[derive(Debug, Default)]
struct MemoryMailState {
    messages: BTreeMap<u32, StoredMessage>,
    next_uid: u32,
    connect_failure: Option<String>,
    fetch_failures: HashSet<u32>,
    mark_seen_failure: bool,
    connects: usize,
    logouts: usize,
}

/// In-process mailbox with IMAP-like search semantics, for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryMailConnector {
    state: Arc<Mutex<MemoryMailState>>,
}

impl MemoryMailConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unread message and return its UID.
    pub async fn deliver(&self, rfc822: Vec<u8>, internal_date: DateTime<Utc>) -> u32 {
        let from = mailparse::parse_headers(&rfc822)
            .ok()
            .and_then(|(headers, _)| headers.get_first_value("From"))
            .unwrap_or_default();
        let mut state = self.state.lock().await;
        state.next_uid += 1;
        let uid = state.next_uid;
        state.messages.insert(
            uid,
            StoredMessage {
                rfc822,
                internal_date,
                from,
                seen: false,
            },
        );
        uid
    }

    pub async fn is_seen(&self, uid: u32) -> bool {
        let state = self.state.lock().await;
        state.messages.get(&uid).is_some_and(|m| m.seen)
    }

    pub async fn unseen_count(&self) -> usize {
        let state = self.state.lock().await;
        state.messages.values().filter(|m| !m.seen).count()
    }

    pub async fn fail_connect(&self, message: impl Into<String>) {
        self.state.lock().await.connect_failure = Some(message.into());
    }

    pub async fn fail_fetch(&self, uid: u32) {
        self.state.lock().await.fetch_failures.insert(uid);
    }

    pub async fn fail_mark_seen(&self) {
        self.state.lock().await.mark_seen_failure = true;
    }

    /// (sessions opened, sessions logged out)
    pub async fn session_counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.connects, state.logouts)
    }
}

#[async_trait]
impl MailConnector for MemoryMailConnector {
    async fn connect(&self) -> Result<Box<dyn Mailbox>, MailError> {
        let mut state = self.state.lock().await;
        if let Some(message) = &state.connect_failure {
            return Err(MailError::Connect(message.clone()));
        }
        state.connects += 1;
        Ok(Box::new(MemoryMailbox {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryMailbox {
    state: Arc<Mutex<MemoryMailState>>,
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn search(&mut self, query: &MailQuery) -> Result<Vec<u32>, MailError> {
        let sender = query.sender.to_ascii_lowercase();
        let state = self.state.lock().await;
        Ok(state
            .messages
            .iter()
            .filter(|(_, m)| !m.seen)
            .filter(|(_, m)| m.from.to_ascii_lowercase().contains(&sender))
            .filter(|(_, m)| m.internal_date.date_naive() >= query.since)
            .map(|(uid, _)| *uid)
            .collect())
    }

    async fn fetch(&mut self, uid: u32) -> Result<RawMessage, MailError> {
        let state = self.state.lock().await;
        if state.fetch_failures.contains(&uid) {
            return Err(MailError::Fetch {
                uid,
                message: "connection reset".to_string(),
            });
        }
        let message = state.messages.get(&uid).ok_or_else(|| MailError::Fetch {
            uid,
            message: "no such message".to_string(),
        })?;
        Ok(RawMessage {
            uid,
            internal_date: Some(message.internal_date),
            rfc822: message.rfc822.clone(),
        })
    }

    async fn mark_seen(&mut self, uids: &[u32]) -> Result<(), MailError> {
        let mut state = self.state.lock().await;
        if state.mark_seen_failure {
            return Err(MailError::MarkSeen("STORE rejected".to_string()));
        }
        for uid in uids {
            if let Some(message) = state.messages.get_mut(uid) {
                message.seen = true;
            }
        }
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), MailError> {
        self.state.lock().await.logouts += 1;
        Ok(())
    }
}

/// A verified spreadsheet attachment sitting in staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedAttachment {
    pub file_path: PathBuf,
    pub filename: String,
    pub source_message_id: String,
    pub subject: String,
    pub sender_address: String,
    pub received_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Retrieval {
    pub files: Vec<RetrievedAttachment>,
    pub messages_scanned: usize,
    pub errors: Vec<RunError>,
}

struct ParsedMessage {
    message_id: String,
    subject: String,
    sender_address: String,
    received: Option<DateTime<Utc>>,
    attachments: Vec<(String, Vec<u8>)>,
}

pub fn is_spreadsheet_name(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| ATTACHMENT_EXTENSIONS.contains(&ext.as_str()))
}

fn first_address(from: &str) -> Option<String> {
    let list = mailparse::addrparse(from).ok()?;
    list.iter().find_map(|addr| match addr {
        MailAddr::Single(single) => Some(single.addr.clone()),
        MailAddr::Group(group) => group.addrs.first().map(|a| a.addr.clone()),
    })
}

fn attachment_name(part: &ParsedMail<'_>) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn collect_attachments(
    part: &ParsedMail<'_>,
    out: &mut Vec<(String, Vec<u8>)>,
) -> Result<(), mailparse::MailParseError> {
    if let Some(name) = attachment_name(part) {
        if is_spreadsheet_name(&name) {
            out.push((name, part.get_body_raw()?));
        }
    }
    for sub in &part.subparts {
        collect_attachments(sub, out)?;
    }
    Ok(())
}

fn parse_message(raw: &RawMessage) -> Result<ParsedMessage, mailparse::MailParseError> {
    let parsed = mailparse::parse_mail(&raw.rfc822)?;
    let headers = &parsed.headers;
    let from = headers.get_first_value("From").unwrap_or_default();
    let header_date = headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0));

    let mut attachments = Vec::new();
    collect_attachments(&parsed, &mut attachments)?;

    Ok(ParsedMessage {
        message_id: headers
            .get_first_value("Message-ID")
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("uid:{}", raw.uid)),
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        sender_address: first_address(&from).unwrap_or(from),
        received: raw.internal_date.or(header_date),
        attachments,
    })
}

enum MessageOutcome {
    Skipped,
    Carried { verified: bool },
}

/// Pulls partner spreadsheets out of the mailbox into staging.
#[derive(Clone)]
pub struct AttachmentRetriever {
    connector: Arc<dyn MailConnector>,
    query: MailQuery,
    max_messages: usize,
}

impl AttachmentRetriever {
    pub fn new(connector: Arc<dyn MailConnector>, query: MailQuery, max_messages: usize) -> Self {
        Self {
            connector,
            query,
            max_messages: max_messages.max(1),
        }
    }

    pub fn query(&self) -> &MailQuery {
        &self.query
    }

    /// Open and close a session without touching any message.
    pub async fn test_connection(&self) -> Result<(), MailError> {
        let mut mailbox = self.connector.connect().await?;
        mailbox.logout().await?;
        info!(sender = %self.query.sender, "mail connection test succeeded");
        Ok(())
    }

    pub async fn retrieve_new_attachments(&self, staging: &StagingArea) -> Result<Retrieval, MailError> {
        let mut mailbox = self.connector.connect().await?;
        let result = self.collect(mailbox.as_mut(), staging).await;
        if let Err(err) = mailbox.logout().await {
            warn!(error = %err, "mail logout failed");
        }
        result
    }

    /// Walk matching messages oldest first. Only messages that carry a
    /// qualifying spreadsheet count toward the cap; anything else is skipped
    /// so it cannot hold back later attachments.
    async fn collect(&self, mailbox: &mut dyn Mailbox, staging: &StagingArea) -> Result<Retrieval, MailError> {
        let mut uids = mailbox.search(&self.query).await?;
        uids.sort_unstable();
        let matched = uids.len();

        let mut retrieval = Retrieval::default();
        let mut verified_uids = Vec::new();
        let mut carried = 0;
        for (position, &uid) in uids.iter().enumerate() {
            if carried == self.max_messages {
                info!(
                    matched,
                    deferred = matched - position,
                    "message cap reached; remaining messages left unread"
                );
                break;
            }
            retrieval.messages_scanned += 1;
            let raw = match mailbox.fetch(uid).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(uid, error = %err, "skipping message");
                    retrieval
                        .errors
                        .push(RunError::new(format!("message {uid}"), err.to_string()));
                    continue;
                }
            };
            match self.stage_message(&raw, staging, &mut retrieval).await {
                MessageOutcome::Skipped => {}
                MessageOutcome::Carried { verified } => {
                    carried += 1;
                    if verified {
                        verified_uids.push(uid);
                    }
                }
            }
        }

        if let Err(err) = mailbox.mark_seen(&verified_uids).await {
            warn!(error = %err, messages = verified_uids.len(), "could not mark messages as read");
            retrieval.errors.push(RunError::new("mark-seen", err.to_string()));
        }

        info!(
            scanned = retrieval.messages_scanned,
            files = retrieval.files.len(),
            errors = retrieval.errors.len(),
            "attachment retrieval finished"
        );
        Ok(retrieval)
    }

    /// Stage every qualifying attachment of one message.
    async fn stage_message(&self, raw: &RawMessage, staging: &StagingArea, retrieval: &mut Retrieval) -> MessageOutcome {
        let uid = raw.uid;
        let message = match parse_message(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(uid, error = %err, "unparseable message");
                retrieval
                    .errors
                    .push(RunError::new(format!("message {uid}"), err.to_string()));
                return MessageOutcome::Skipped;
            }
        };

        if !self.query.sender_matches(&message.sender_address) {
            debug!(uid, sender = %message.sender_address, "sender is not the partner address");
            return MessageOutcome::Skipped;
        }
        let Some(received) = message.received else {
            debug!(uid, "message has no date");
            return MessageOutcome::Skipped;
        };
        if received.date_naive() < self.query.since {
            debug!(uid, %received, "message predates cutoff");
            return MessageOutcome::Skipped;
        }
        if message.attachments.is_empty() {
            debug!(uid, subject = %message.subject, "no spreadsheet attachment");
            return MessageOutcome::Skipped;
        }

        let mut any_verified = false;
        for (filename, bytes) in message.attachments {
            let staged = match staging.stage_bytes(&filename, &bytes).await {
                Ok(staged) => staged,
                Err(err) => {
                    warn!(uid, %filename, error = %err, "failed to save attachment");
                    retrieval.errors.push(RunError::new(filename, format!("{err:#}")));
                    continue;
                }
            };
            if let Err(err) = staging.verify(&staged).await {
                warn!(uid, %filename, error = %err, "staged attachment failed verification");
                retrieval.errors.push(RunError::new(filename, format!("{err:#}")));
                if staged.path.exists() {
                    let _ = staging.remove(&staged.path).await;
                }
                continue;
            }
            info!(uid, %filename, staged = %staged.path.display(), bytes = staged.byte_size, "attachment staged");
            retrieval.files.push(RetrievedAttachment {
                file_path: staged.path,
                filename,
                source_message_id: message.message_id.clone(),
                subject: message.subject.clone(),
                sender_address: message.sender_address.clone(),
                received_date: received,
            });
            any_verified = true;
        }
        MessageOutcome::Carried {
            verified: any_verified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use chrono::TimeZone;
    use tempfile::tempdir;

    const PARTNER: &str = "mis@partner-insurer.com";

    fn cutoff() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 6).unwrap()
    }

    fn received(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, day, 9, 30, 0).single().unwrap()
    }

    fn message(from: &str, subject: &str, attachments: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = format!(
            "From: Partner MIS <{from}>\r\n\
             To: ops@example.com\r\n\
             Subject: {subject}\r\n\
             Message-ID: <{subject}@partner>\r\n\
             Date: Tue, 07 Oct 2025 09:30:00 +0000\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/mixed; boundary=\"XBOUNDARY\"\r\n\
             \r\n\
             --XBOUNDARY\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             Daily MIS attached.\r\n"
        );
        for (name, bytes) in attachments {
            out.push_str(&format!(
                "--XBOUNDARY\r\n\
                 Content-Type: application/octet-stream; name=\"{name}\"\r\n\
                 Content-Disposition: attachment; filename=\"{name}\"\r\n\
                 Content-Transfer-Encoding: base64\r\n\
                 \r\n\
                 {}\r\n",
                STANDARD.encode(bytes)
            ));
        }
        out.push_str("--XBOUNDARY--\r\n");
        out.into_bytes()
    }

    fn retriever(connector: &MemoryMailConnector, max: usize) -> AttachmentRetriever {
        AttachmentRetriever::new(
            Arc::new(connector.clone()),
            MailQuery::new(PARTNER, cutoff()),
            max,
        )
    }

    #[test]
    fn imap_search_uses_imap_date_format() {
        let query = MailQuery::new("mis@partner-insurer.com", cutoff());
        assert_eq!(
            query.to_imap_search(),
            "UNSEEN FROM \"mis@partner-insurer.com\" SINCE 06-Oct-2025"
        );
    }

    #[test]
    fn spreadsheet_extensions_are_case_insensitive() {
        assert!(is_spreadsheet_name("MIS.XLSX"));
        assert!(is_spreadsheet_name("dump.ods"));
        assert!(!is_spreadsheet_name("report.pdf"));
        assert!(!is_spreadsheet_name("xlsx"));
    }

    #[tokio::test]
    async fn stages_spreadsheets_and_marks_only_those_messages_read() {
        let dir = tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        let mail = MemoryMailConnector::new();

        let with_sheet = mail
            .deliver(
                message(PARTNER, "mis-1", &[("MIS.xlsx", b"sheet-bytes"), ("terms.pdf", b"%PDF")]),
                received(7),
            )
            .await;
        let pdf_only = mail
            .deliver(message(PARTNER, "mis-2", &[("terms.pdf", b"%PDF")]), received(7))
            .await;

        let retrieval = retriever(&mail, 50)
            .retrieve_new_attachments(&staging)
            .await
            .unwrap();

        assert_eq!(retrieval.messages_scanned, 2);
        assert!(retrieval.errors.is_empty());
        assert_eq!(retrieval.files.len(), 1);
        let file = &retrieval.files[0];
        assert_eq!(file.filename, "MIS.xlsx");
        assert_eq!(file.sender_address, PARTNER);
        assert_eq!(file.source_message_id, "<mis-1@partner>");
        assert_eq!(std::fs::read(&file.file_path).unwrap(), b"sheet-bytes");

        assert!(mail.is_seen(with_sheet).await);
        assert!(!mail.is_seen(pdf_only).await);
        assert_eq!(mail.session_counts().await, (1, 1));
    }

    #[tokio::test]
    async fn lookalike_senders_and_old_messages_are_left_alone() {
        let dir = tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        let mail = MemoryMailConnector::new();

        let lookalike = mail
            .deliver(
                message("ops-mis@partner-insurer.com.evil", "spoof", &[("MIS.xlsx", b"x")]),
                received(8),
            )
            .await;
        let old = mail
            .deliver(message(PARTNER, "old", &[("MIS.xlsx", b"x")]), received(1))
            .await;

        let retrieval = retriever(&mail, 50)
            .retrieve_new_attachments(&staging)
            .await
            .unwrap();

        assert!(retrieval.files.is_empty());
        assert!(!mail.is_seen(lookalike).await);
        assert!(!mail.is_seen(old).await);
    }

    #[tokio::test]
    async fn message_cap_defers_the_rest_to_the_next_run() {
        let dir = tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        let mail = MemoryMailConnector::new();
        for n in 0..3 {
            mail.deliver(
                message(PARTNER, &format!("mis-{n}"), &[("MIS.xlsx", b"rows")]),
                received(7),
            )
            .await;
        }

        let first = retriever(&mail, 2).retrieve_new_attachments(&staging).await.unwrap();
        assert_eq!(first.messages_scanned, 2);
        assert_eq!(mail.unseen_count().await, 1);

        let second = retriever(&mail, 2).retrieve_new_attachments(&staging).await.unwrap();
        assert_eq!(second.messages_scanned, 1);
        assert_eq!(second.files[0].source_message_id, "<mis-2@partner>");
        assert_eq!(mail.unseen_count().await, 0);
    }

    #[tokio::test]
    async fn messages_without_spreadsheets_do_not_use_up_the_cap() {
        let dir = tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        let mail = MemoryMailConnector::new();
        let first_pdf = mail
            .deliver(message(PARTNER, "terms-1", &[("terms.pdf", b"%PDF")]), received(7))
            .await;
        let second_pdf = mail
            .deliver(message(PARTNER, "terms-2", &[("terms.pdf", b"%PDF")]), received(7))
            .await;
        let sheet = mail
            .deliver(message(PARTNER, "mis", &[("MIS.xlsx", b"rows")]), received(8))
            .await;

        let retrieval = retriever(&mail, 2).retrieve_new_attachments(&staging).await.unwrap();

        assert_eq!(retrieval.messages_scanned, 3);
        assert_eq!(retrieval.files.len(), 1);
        assert_eq!(retrieval.files[0].source_message_id, "<mis@partner>");
        assert!(mail.is_seen(sheet).await);
        assert!(!mail.is_seen(first_pdf).await);
        assert!(!mail.is_seen(second_pdf).await);
    }

    #[tokio::test]
    async fn attachment_that_cannot_be_staged_is_not_returned() {
        let dir = tempdir().unwrap();
        let blocked_root = dir.path().join("not-a-directory");
        std::fs::write(&blocked_root, b"occupied").unwrap();
        let staging = StagingArea::new(&blocked_root);
        let mail = MemoryMailConnector::new();
        let uid = mail
            .deliver(message(PARTNER, "mis", &[("MIS.xlsx", b"rows")]), received(7))
            .await;

        let retrieval = retriever(&mail, 50)
            .retrieve_new_attachments(&staging)
            .await
            .unwrap();

        assert!(retrieval.files.is_empty());
        assert_eq!(retrieval.errors.len(), 1);
        assert_eq!(retrieval.errors[0].context, "MIS.xlsx");
        assert!(!mail.is_seen(uid).await);
    }

    #[tokio::test]
    async fn connection_failure_aborts_retrieval() {
        let dir = tempdir().unwrap();
        let mail = MemoryMailConnector::new();
        mail.fail_connect("connection refused").await;

        let err = retriever(&mail, 50)
            .retrieve_new_attachments(&StagingArea::new(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::Connect(_)));
        assert!(retriever(&mail, 50).test_connection().await.is_err());
    }

    #[tokio::test]
    async fn fetch_failure_is_local_to_one_message() {
        let dir = tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        let mail = MemoryMailConnector::new();
        let broken = mail
            .deliver(message(PARTNER, "broken", &[("A.xlsx", b"a")]), received(7))
            .await;
        let fine = mail
            .deliver(message(PARTNER, "fine", &[("B.xlsx", b"b")]), received(7))
            .await;
        mail.fail_fetch(broken).await;

        let retrieval = retriever(&mail, 50)
            .retrieve_new_attachments(&staging)
            .await
            .unwrap();

        assert_eq!(retrieval.files.len(), 1);
        assert_eq!(retrieval.errors.len(), 1);
        assert_eq!(retrieval.errors[0].context, format!("message {broken}"));
        assert!(mail.is_seen(fine).await);
        assert!(!mail.is_seen(broken).await);
        assert_eq!(mail.session_counts().await, (1, 1));
    }

    #[tokio::test]
    async fn mark_seen_failure_keeps_staged_files() {
        let dir = tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        let mail = MemoryMailConnector::new();
        let uid = mail
            .deliver(message(PARTNER, "mis", &[("MIS.xlsx", b"rows")]), received(7))
            .await;
        mail.fail_mark_seen().await;

        let retrieval = retriever(&mail, 50)
            .retrieve_new_attachments(&staging)
            .await
            .unwrap();

        assert_eq!(retrieval.files.len(), 1);
        assert!(retrieval.files[0].file_path.exists());
        assert_eq!(retrieval.errors[0].context, "mark-seen");
        assert!(!mail.is_seen(uid).await);
    }
}
