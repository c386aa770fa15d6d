use crate::mail_reader::SyncReport;
use log::{error, info};

pub fn display_report(report: &SyncReport) {
    report.emails.iter().for_each(|message| {
        match serde_json::to_string_pretty(message) {
            Ok(json) => info!("{}", json),
            Err(e) => error!("Error converting to JSON: {}", e),
        }
        info!("---");
    });
    match report.cursor {
        Some(uid) => info!("{} message(s), cursor at UID {}", report.count, uid),
        None => info!("{} message(s)", report.count),
    }
}
