use serde::{Deserialize, Serialize};

use super::client::FetchedMessage;

/// Header lookup is case-insensitive; the first match wins.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// The parts of a message that are classified and stored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFields {
    pub subject: String,
    pub sender: String,
    pub snippet: String,
}

impl From<&FetchedMessage> for MessageFields {
    fn from(message: &FetchedMessage) -> Self {
        Self {
            subject: header_value(&message.headers, "Subject")
                .unwrap_or_default()
                .to_string(),
            sender: header_value(&message.headers, "From")
                .unwrap_or_default()
                .to_string(),
            snippet: message.snippet.clone().unwrap_or_default(),
        }
    }
}
