use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::NaiveDate;
use log::{error, info};
use serde::{Deserialize, Serialize};

pub mod attachment_store;
pub mod cursor;
pub mod display;
pub mod encoded_word;
pub mod error;
pub mod fetch;
pub mod imap;
pub mod message;

use attachment_store::{sanitize_filename, AttachmentStore, StoredReference};
use cursor::CursorStore;
use error::Result;
use fetch::{MailboxSession, SelectionCriterion};
use imap::{AccessMode, Connector, Credentials};
use message::DecodedEmail;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub uid: u32,
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub subject: String,
    pub date: Option<String>,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    #[serde(rename = "saved_path")]
    pub stored_reference: StoredReference,
    /// Base64 of the bytes as re-read from storage.
    #[serde(rename = "data", skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub emails: Vec<Message>,
    pub count: usize,
    /// Watermark stored after an incremental run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Everything received on or after the date.
    Window { since: NaiveDate },
    /// Everything above the folder's stored watermark.
    Incremental,
}

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub credentials: Credentials,
    pub folder: String,
    pub mode: SyncMode,
    pub access: AccessMode,
    /// Include base64 attachment bytes in the report.
    pub include_payload: bool,
}

/// Run one sync: open a session, fetch and decode every matching message,
/// store its attachments and, for incremental runs, advance the folder's
/// watermark to the highest UID processed.
///
/// Any failure aborts the whole batch: nothing is returned and the watermark
/// stays where it was. The session is closed on every path once it is open.
pub async fn sync<C: Connector>(
    connector: &C,
    store: &AttachmentStore,
    cursors: &CursorStore,
    request: &SyncRequest,
) -> Result<SyncReport> {
    let (folder_cursor, criterion) = match request.mode {
        SyncMode::Incremental => {
            let cursor = cursors.lock_folder(&request.folder).await;
            let last_uid = cursor.load().await?;
            (Some(cursor), SelectionCriterion::AfterUid(last_uid))
        }
        SyncMode::Window { since } => (None, SelectionCriterion::Since(since)),
    };

    let mut session = connector
        .open(&request.credentials, &request.folder, request.access)
        .await?;
    let collected = collect_messages(&mut session, store, &criterion, request.include_payload).await;
    session.close().await;

    let emails = collected.inspect_err(|e| {
        error!("sync of {} aborted: {}", request.folder, e);
    })?;

    let mut report = SyncReport {
        count: emails.len(),
        emails,
        cursor: None,
    };
    if let Some(cursor) = folder_cursor {
        let highest = report.emails.iter().map(|m| m.uid).max();
        report.cursor = Some(match highest {
            Some(uid) => cursor.advance(uid).await?,
            None => cursor.load().await?,
        });
    }

    info!("sync of {} finished: {} message(s)", request.folder, report.count);
    Ok(report)
}

// Strictly one message at a time: fetch, decode, store, then the next UID.
async fn collect_messages<S: MailboxSession>(
    session: &mut S,
    store: &AttachmentStore,
    criterion: &SelectionCriterion,
    include_payload: bool,
) -> Result<Vec<Message>> {
    let uids = fetch::search(session, criterion).await?;
    info!("{} message(s) match {}", uids.len(), criterion);

    let mut messages = Vec::with_capacity(uids.len());
    for uid in uids {
        let raw = fetch::fetch_raw(session, uid).await?;
        let decoded = message::decode(&raw)?;
        messages.push(assemble(store, decoded, include_payload)?);
    }
    Ok(messages)
}

fn assemble(store: &AttachmentStore, decoded: DecodedEmail, include_payload: bool) -> Result<Message> {
    let attachments = decoded
        .attachments
        .into_iter()
        .enumerate()
        .map(|(ordinal, part)| {
            let stored_reference = store.persist(decoded.uid, ordinal, &part.filename, &part.content)?;
            let payload = if include_payload {
                Some(BASE64.encode(store.read_back(&stored_reference)?))
            } else {
                None
            };
            Ok(Attachment {
                filename: sanitize_filename(&part.filename),
                content_type: part.content_type,
                stored_reference,
                payload,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Message {
        uid: decoded.uid,
        from: decoded.from,
        to: decoded.to,
        subject: decoded.subject,
        date: decoded.date,
        body: decoded.body,
        attachments,
    })
}
