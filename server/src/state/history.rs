use indexmap::IndexSet;

use crate::{email::client::MailClient, error::AppResult};

/// Collects ids of messages added after `previous`, following every page.
/// No additions is an empty set, not an error.
pub async fn fetch_added_message_ids(
    client: &dyn MailClient,
    previous: i64,
    current: i64,
) -> AppResult<IndexSet<String>> {
    let mut message_ids = IndexSet::new();
    let mut page_token = None;

    loop {
        let page = client.list_history(previous, page_token).await?;
        message_ids.extend(page.message_ids);

        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    tracing::debug!(
        "History ({}, {}] added {} messages",
        previous,
        current,
        message_ids.len()
    );

    Ok(message_ids)
}
