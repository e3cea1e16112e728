//! Presentation grouping of a chat's messages.
//!
//! Messages are grouped by calendar day (UTC), newest day first. Inside a
//! day, consecutive messages of the same origin form a chunk.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::model::{ChatMessage, MessageId, MessageOrigin, UserId};

#[derive(Debug, Clone, PartialEq)]
pub struct MessageChunk {
    pub origin: MessageOrigin,
    /// Newest first
    pub messages: Vec<ChatMessage>,
}

impl MessageChunk {
    /// Stable key built from the first and last message ids
    pub fn key(&self) -> String {
        match (self.messages.first(), self.messages.last()) {
            (Some(first), Some(last)) => format!("chunk-{}-{}", first.id, last.id),
            _ => "chunk-empty".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DateGroup {
    pub date: NaiveDate,
    pub chunks: Vec<MessageChunk>,
    pub min_message_id: MessageId,
}

impl DateGroup {
    pub fn message_count(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.messages.len()).sum()
    }
}

/// Group `messages` as seen by user `me`
pub fn group_by_date(messages: &[ChatMessage], me: UserId) -> Vec<DateGroup> {
    let mut by_date: BTreeMap<NaiveDate, Vec<ChatMessage>> = BTreeMap::new();
    for message in messages {
        by_date
            .entry(message.creation_date.date_naive())
            .or_default()
            .push(message.clone());
    }

    let mut groups: Vec<DateGroup> = by_date
        .into_iter()
        .filter_map(|(date, mut day)| {
            day.sort_by(|a, b| b.id.cmp(&a.id));
            let min_message_id = day.last()?.id;
            Some(DateGroup {
                date,
                chunks: chunk_by_origin(day, me),
                min_message_id,
            })
        })
        .collect();

    groups.sort_by(|a, b| b.min_message_id.cmp(&a.min_message_id));
    groups
}

fn chunk_by_origin(messages: Vec<ChatMessage>, me: UserId) -> Vec<MessageChunk> {
    let mut chunks: Vec<MessageChunk> = Vec::new();

    for message in messages {
        let origin = message.origin(me);
        match chunks.last_mut() {
            Some(chunk) if chunk.origin == origin => chunk.messages.push(message),
            _ => chunks.push(MessageChunk {
                origin,
                messages: vec![message],
            }),
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::message;
    use crate::model::MessageType;
    use chrono::{TimeZone, Utc};

    fn at(id: MessageId, sender: UserId, day: u32, hour: u32) -> ChatMessage {
        let mut msg = message(id, "4-9", sender, if sender == 4 { 9 } else { 4 });
        msg.creation_date = Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap();
        msg
    }

    #[test]
    fn test_groups_by_day_and_origin() {
        let mut system = at(3, 9, 1, 12);
        system.message_type = MessageType::LoanRequestCreated;

        let messages = vec![
            at(1, 4, 1, 9),
            at(2, 4, 1, 10),
            system,
            at(4, 9, 1, 13),
            at(5, 9, 2, 8),
            at(6, 4, 2, 9),
        ];

        let groups = group_by_date(&messages, 4);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].date, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(groups[0].min_message_id, 5);
        assert_eq!(groups[1].message_count(), 4);

        let origins: Vec<MessageOrigin> = groups[1].chunks.iter().map(|c| c.origin).collect();
        assert_eq!(
            origins,
            vec![
                MessageOrigin::Interlocutor,
                MessageOrigin::System,
                MessageOrigin::Me
            ]
        );
        assert_eq!(groups[1].chunks[2].key(), "chunk-2-1");
    }

    #[test]
    fn test_empty_input() {
        assert!(group_by_date(&[], 4).is_empty());
    }
}
