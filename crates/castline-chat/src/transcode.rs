use std::collections::HashSet;

use tracing::warn;

use castline_types::{ViewMessage, WireMessage};

use crate::identity::{ViewerIdentity, is_authored_by_viewer};
use crate::timestamp::{DisplayClock, normalize};

/// Shown for messages that carry only an attachment.
pub const ATTACHMENT_PLACEHOLDER: &str = "(attachment)";

pub fn transcode(msg: &WireMessage, viewer: &ViewerIdentity, clock: &DisplayClock) -> ViewMessage {
    let text = if !msg.text.is_empty() {
        msg.text.clone()
    } else if msg.attachment_url.is_some() {
        ATTACHMENT_PLACEHOLDER.to_string()
    } else {
        String::new()
    };

    ViewMessage {
        id: msg.id.clone(),
        text,
        is_me: is_authored_by_viewer(msg, viewer),
        timestamp: normalize(msg.created_at.as_ref(), clock),
    }
}

/// Transcodes a fetched log, keeping server order.
///
/// A repeated identifier keeps its first occurrence; ids must stay unique in
/// the displayed sequence.
pub fn transcode_log(
    log: &[WireMessage],
    viewer: &ViewerIdentity,
    clock: &DisplayClock,
) -> Vec<ViewMessage> {
    let mut seen = HashSet::with_capacity(log.len());
    let mut out = Vec::with_capacity(log.len());

    for msg in log {
        if !seen.insert(msg.id.as_str()) {
            warn!("Dropping duplicate message id '{}' from fetched log", msg.id);
            continue;
        }
        out.push(transcode(msg, viewer, clock));
    }

    out
}
