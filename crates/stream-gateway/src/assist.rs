// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! The generative assistant sampler.
//!
//! Final transcripts accumulate into a per-call conversation log. A timer
//! periodically snapshots every conversation that grew past the gating
//! thresholds and posts it to the configured endpoint; replies marked for
//! the agent are published to the call's room and appended to the log.

use crate::gateway::Gateway;
use crate::metrics;
use crate::rooms::WidgetEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::interval;

#[derive(Debug, Default)]
pub struct Conversation {
    pub items: Vec<ConversationItem>,
    pub total_chars: usize,
    pub last_sent_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    pub timestamp: DateTime<Utc>,
    pub role: &'static str,
    pub text: String,
}

/// Append one utterance to a call's conversation log
pub fn append(gateway: &Gateway, call_uuid: &str, role: &'static str, text: &str) {
    let mut conversations = gateway.conversations.lock();
    let conversation = conversations.entry(call_uuid.to_owned()).or_default();

    conversation.items.push(ConversationItem {
        timestamp: Utc::now(),
        role,
        text: text.to_owned(),
    });
    conversation.total_chars += text.chars().count();
}

/// A conversation is sampled only when it reached the minimum size and
/// grew since the last send
fn should_send(conversation: &Conversation, min_chars: usize) -> bool {
    conversation.total_chars >= min_chars && conversation.items.len() > conversation.last_sent_items
}

/// Trailing window of at most `cap` characters (0 disables the window).
/// The most recent item is always included.
fn window(items: &[ConversationItem], cap: usize) -> Vec<ConversationItem> {
    if cap == 0 {
        return items.to_vec();
    }

    let mut chars = 0;
    let mut start = items.len();

    for (index, item) in items.iter().enumerate().rev() {
        chars += item.text.chars().count();

        if chars > cap && start < items.len() {
            break;
        }

        start = index;
    }

    items[start..].to_vec()
}

#[derive(Debug, Deserialize)]
struct AssistResponse {
    assistant: Option<AssistantReply>,
}

#[derive(Debug, Deserialize)]
struct AssistantReply {
    #[serde(default)]
    visibility: String,
    #[serde(default)]
    text: String,
}

pub async fn run(gateway: Arc<Gateway>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(gateway.settings.assistant.interval);

    log::info!(
        "assistant sampler ({}) running every {:?} against {}",
        gateway.settings.assistant.engine,
        gateway.settings.assistant.interval,
        gateway.settings.assistant.url
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => sample_all(&gateway).await,
        }
    }
}

async fn sample_all(gateway: &Arc<Gateway>) {
    let assistant = &gateway.settings.assistant;

    let candidates: Vec<(String, Vec<ConversationItem>, usize)> = {
        let conversations = gateway.conversations.lock();

        conversations
            .iter()
            .filter(|(_, conversation)| should_send(conversation, assistant.min_chars))
            .map(|(uuid, conversation)| {
                (
                    uuid.clone(),
                    window(&conversation.items, assistant.tail_chars),
                    conversation.items.len(),
                )
            })
            .collect()
    };

    for (uuid, items, item_count) in candidates {
        let reply = match post_conversation(gateway, &uuid, &items).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("assistant request for call {uuid} failed: {e:#}");
                continue;
            }
        };

        // the call may have ended while the request was in flight; only a
        // still-present conversation gets its counter advanced
        {
            let mut conversations = gateway.conversations.lock();

            match conversations.get_mut(&uuid) {
                Some(conversation) => conversation.last_sent_items = item_count,
                None => continue,
            }
        }

        let Some(reply) = reply else {
            continue;
        };

        if reply.visibility != "agent" || reply.text.is_empty() {
            continue;
        }

        metrics::ASSIST_REPLIES.inc();

        let extension = gateway
            .registrations
            .lock()
            .get(&uuid)
            .map(|registration| registration.extension.clone())
            .unwrap_or_default();
        let room = crate::types::room_for(&extension);

        gateway.rooms.publish(
            &room,
            &WidgetEvent::Assist {
                text: reply.text.clone(),
                speaker: gateway.settings.assistant.speaker.clone(),
            },
        );

        append(gateway, &uuid, "assistant", &reply.text);
    }
}

async fn post_conversation(
    gateway: &Gateway,
    uuid: &str,
    items: &[ConversationItem],
) -> anyhow::Result<Option<AssistantReply>> {
    let assistant = &gateway.settings.assistant;

    metrics::ASSIST_REQUESTS.inc();

    let mut request = gateway.http.post(&assistant.url).json(&serde_json::json!({
        "call_id": uuid,
        "conversation": items,
    }));

    if !assistant.authorization.is_empty() {
        request = request.header("authorization", &assistant.authorization);
    }

    let response = request.send().await?;

    if !response.status().is_success() {
        anyhow::bail!("assistant endpoint returned {}", response.status());
    }

    let response: AssistResponse = response.json().await?;

    Ok(response.assistant)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn item(text: &str) -> ConversationItem {
        ConversationItem {
            timestamp: Utc::now(),
            role: "user",
            text: text.to_owned(),
        }
    }

    fn conversation(texts: &[&str], last_sent_items: usize) -> Conversation {
        Conversation {
            items: texts.iter().map(|text| item(text)).collect(),
            total_chars: texts.iter().map(|text| text.chars().count()).sum(),
            last_sent_items,
        }
    }

    #[test]
    fn sampling_requires_minimum_size_and_growth() {
        // too small
        assert!(!should_send(&conversation(&["hi"], 0), 20));

        // big enough and grown
        assert!(should_send(
            &conversation(&["how can I help you today?"], 0),
            20
        ));

        // big enough but already sent
        assert!(!should_send(
            &conversation(&["how can I help you today?"], 1),
            20
        ));
    }

    #[test]
    fn window_keeps_the_tail_within_the_cap() {
        let items = vec![item("aaaaa"), item("bbbbb"), item("ccccc")];

        let windowed = window(&items, 11);

        assert_eq!(windowed.len(), 2);
        assert_eq!(windowed[0].text, "bbbbb");
        assert_eq!(windowed[1].text, "ccccc");
    }

    #[test]
    fn window_always_includes_the_latest_item() {
        let items = vec![item("aaaaa"), item("a very long closing statement")];

        let windowed = window(&items, 5);

        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].text, "a very long closing statement");
    }

    #[test]
    fn zero_cap_disables_the_window() {
        let items = vec![item("aaaaa"), item("bbbbb")];

        assert_eq!(window(&items, 0).len(), 2);
    }

    #[test]
    fn items_serialize_with_role_and_text() {
        let serialized = serde_json::to_value(item("hello")).unwrap();

        assert_eq!(serialized["role"], "user");
        assert_eq!(serialized["text"], "hello");
        assert!(serialized["timestamp"].is_string());
    }
}
