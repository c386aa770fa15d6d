use std::fmt;
use std::future::Future;

use chrono::{Local, NaiveDate, TimeDelta};
use log::debug;

use crate::mail_reader::error::{Result, SyncError};
use crate::mail_reader::message::RawMessage;

/// Which messages of the selected folder a run looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionCriterion {
    /// Received on or after this date.
    Since(NaiveDate),
    /// UID strictly greater than this one.
    AfterUid(u32),
}

/// Local calendar date `days` before today. Negative or out-of-range
/// windows are rejected.
pub fn days_ago(days: i64) -> Result<NaiveDate> {
    if days < 0 {
        return Err(SyncError::InvalidRequest(format!(
            "since_days must not be negative: {}",
            days
        )));
    }
    TimeDelta::try_days(days)
        .and_then(|delta| Local::now().date_naive().checked_sub_signed(delta))
        .ok_or_else(|| SyncError::InvalidRequest(format!("since_days is out of range: {}", days)))
}

impl SelectionCriterion {
    /// The argument of a `UID SEARCH` command.
    pub fn to_imap_query(&self) -> String {
        match self {
            SelectionCriterion::Since(date) => format!("SINCE {}", date.format("%d-%b-%Y")),
            SelectionCriterion::AfterUid(uid) => format!("UID {}:*", uid.saturating_add(1)),
        }
    }

    /// Whether a message with this UID and receipt date belongs in the
    /// result.
    pub fn admits(&self, uid: u32, received: NaiveDate) -> bool {
        match self {
            SelectionCriterion::Since(date) => received >= *date,
            SelectionCriterion::AfterUid(min) => uid > *min,
        }
    }
}

impl fmt::Display for SelectionCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_imap_query())
    }
}

/// One authenticated connection with a folder selected.
///
/// Commands are issued strictly one after another; nothing pipelines on a
/// session.
pub trait MailboxSession {
    /// UIDs the server reports for `criterion`, in whatever order it sends
    /// them.
    fn search(&mut self, criterion: &SelectionCriterion) -> impl Future<Output = Result<Vec<u32>>> + Send;

    fn fetch_raw(&mut self, uid: u32) -> impl Future<Output = Result<RawMessage>> + Send;

    /// Log out. Never fails; calling it twice is a no-op.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Snapshot of matching UIDs, ascending and without duplicates.
///
/// `UID n:*` always matches the highest UID in the folder even when it is
/// below `n`, so UID criteria are filtered again here.
pub async fn search<S: MailboxSession>(session: &mut S, criterion: &SelectionCriterion) -> Result<Vec<u32>> {
    let mut uids = session.search(criterion).await?;
    uids.sort_unstable();
    uids.dedup();
    if let SelectionCriterion::AfterUid(min) = criterion {
        uids.retain(|uid| uid > min);
    }
    debug!("search {} -> {:?}", criterion, uids);
    Ok(uids)
}

pub async fn fetch_raw<S: MailboxSession>(session: &mut S, uid: u32) -> Result<RawMessage> {
    let raw = session.fetch_raw(uid).await?;
    debug!("fetched message {} ({} bytes)", uid, raw.bytes.len());
    Ok(raw)
}
