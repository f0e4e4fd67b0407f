//! Inbound SMS extraction.
//!
//! With `AT+CNMI=2,2,0,0,0` the modem pushes each new message straight to the
//! port instead of storing it:
//!
//! ```text
//! +CMT: "+33612345678","","24/05/01,12:34:56+08"
//! Front door opened
//! ```
//!
//! A single read batch may hold several notifications back to back.
use std::borrow::Cow;
use std::sync::OnceLock;

use log::warn;
use regex::Regex;

use crate::events::InboundSms;
use crate::logutil::escape_log;

pub const NOTIFICATION_MARKER: &str = "+CMT:";

fn notification() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // sender, timestamp without timezone suffix, then the body line
        Regex::new(r#"\+CMT: "([^"]*)","[^"]*","([^"+]*)[^\r\n]*\r?\n([^\r\n]*)"#)
            .expect("valid SMS notification regex")
    })
}

/// Every complete SMS notification in `batch`, in order of appearance.
pub fn extract(batch: &str) -> Vec<InboundSms> {
    if !batch.contains(NOTIFICATION_MARKER) {
        return Vec::new();
    }
    let found: Vec<InboundSms> = notification()
        .captures_iter(batch)
        .map(|c| InboundSms {
            sender: c[1].to_string(),
            timestamp: c[2].to_string(),
            body: c[3].to_string(),
        })
        .collect();
    if found.is_empty() {
        warn!("Unable to parse SMS notification: {}", escape_log(batch));
    }
    found
}

/// `batch` with every complete SMS notification cut out, leaving only the
/// command traffic for the sequencer.
pub fn without_notifications(batch: &str) -> Cow<'_, str> {
    if !batch.contains(NOTIFICATION_MARKER) {
        return Cow::Borrowed(batch);
    }
    notification().replace_all(batch, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_notification() {
        let batch = "\r\n+CMT: \"+33612345678\",\"\",\"24/05/01,12:34:56+08\"\r\nFront door opened\r\n";
        let sms = extract(batch);
        assert_eq!(
            sms,
            vec![InboundSms {
                sender: "+33612345678".into(),
                timestamp: "24/05/01,12:34:56".into(),
                body: "Front door opened".into(),
            }]
        );
    }

    #[test]
    fn two_notifications_in_one_batch() {
        let batch = concat!(
            "+CMT: \"+331\",\"\",\"24/05/01,10:00:00+08\"\r\nHello\r\n",
            "+CMT: \"+332\",\"Bob\",\"24/05/01,10:01:00+08\"\r\nWorld\r\n",
        );
        let sms = extract(batch);
        assert_eq!(sms.len(), 2);
        assert_eq!(sms[0].sender, "+331");
        assert_eq!(sms[0].body, "Hello");
        assert_eq!(sms[1].sender, "+332");
        assert_eq!(sms[1].timestamp, "24/05/01,10:01:00");
        assert_eq!(sms[1].body, "World");
    }

    #[test]
    fn marker_without_match_yields_nothing() {
        assert!(extract("+CMT: garbage\r\n").is_empty());
    }

    #[test]
    fn unrelated_output_is_skipped() {
        assert!(extract("AT+CSQ\r\r\n+CSQ: 18,0\r\n\r\nOK\r\n").is_empty());
    }

    #[test]
    fn notifications_are_cut_from_command_output() {
        let batch = "+CMT: \"+331\",\"\",\"24/05/01,10:00:00+08\"\r\nHello\r\nAT+CMGF=1\r\r\nOK\r\n";
        assert_eq!(without_notifications(batch), "\r\nAT+CMGF=1\r\r\nOK\r\n");
        assert_eq!(without_notifications("OK\r\n"), "OK\r\n");
    }
}
