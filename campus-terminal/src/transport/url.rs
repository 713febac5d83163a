//! Builds the terminal socket address from the configured server address

use crate::error::TransportError;
use campus_protocol::{TerminalId, TERMINAL_PATH};

/// Normalise `base` into `<ws|wss>://<host>[:port][/prefix]/ws/terminals/<id>/`
pub fn terminal_url(base: &str, id: &TerminalId) -> Result<String, TransportError> {
    let trimmed = base.trim();
    let invalid = || TransportError::InvalidUrl(base.to_string());

    let (scheme, rest) = match trimmed.split_once("://") {
        Some(("http", rest)) | Some(("ws", rest)) => ("ws", rest),
        Some(("https", rest)) | Some(("wss", rest)) => ("wss", rest),
        Some(_) => return Err(invalid()),
        None => ("ws", trimmed),
    };

    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    if authority.is_empty() || authority.contains(char::is_whitespace) {
        return Err(invalid());
    }

    let path = path.trim_end_matches('/');
    let full_suffix = format!("/{TERMINAL_PATH}/{id}");
    let path = if path.ends_with(&full_suffix) {
        path.to_string()
    } else if path.ends_with(&format!("/{TERMINAL_PATH}")) {
        format!("{path}/{id}")
    } else {
        format!("{path}{full_suffix}")
    };

    Ok(format!("{scheme}://{authority}{path}/"))
}
