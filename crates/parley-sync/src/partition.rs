use std::collections::HashMap;

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use parley_types::models::Message;

pub const TODAY: &str = "Today";
pub const YESTERDAY: &str = "Yesterday";

/// Messages sharing a calendar day in the viewer's time zone.
#[derive(Debug, Clone, PartialEq)]
pub struct DateGroup {
    pub date: NaiveDate,
    pub label: String,
    pub messages: Vec<Message>,
    /// False for the first group: there is nothing above it to divide from.
    pub show_divider: bool,
}

/// Bucket messages by local calendar day.
///
/// Buckets come out in the order their first message appears in the input,
/// which for timestamp-ascending input means oldest first. Messages keep
/// their input order inside a bucket.
pub fn partition<Tz: TimeZone>(messages: &[Message], now: DateTime<Utc>, tz: &Tz) -> Vec<DateGroup> {
    let today = now.with_timezone(tz).date_naive();
    let mut groups: Vec<DateGroup> = Vec::new();
    let mut index: HashMap<NaiveDate, usize> = HashMap::new();

    for message in messages {
        let day = message.timestamp.with_timezone(tz).date_naive();
        let idx = *index.entry(day).or_insert_with(|| {
            groups.push(DateGroup {
                date: day,
                label: day_label(day, today),
                messages: Vec::new(),
                show_divider: !groups.is_empty(),
            });
            groups.len() - 1
        });
        groups[idx].messages.push(message.clone());
    }

    groups
}

/// "Today", "Yesterday", or e.g. "Monday, March 4".
pub fn day_label(day: NaiveDate, today: NaiveDate) -> String {
    if day == today {
        TODAY.to_string()
    } else if today.checked_sub_days(Days::new(1)) == Some(day) {
        YESTERDAY.to_string()
    } else {
        day.format("%A, %B %-d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use uuid::Uuid;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn message(ts: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            text: ts.into(),
            user_id: Uuid::nil(),
            username: "u".into(),
            channel_id: Some(Uuid::nil()),
            recipient_id: None,
            thread_id: None,
            timestamp: at(ts),
            reactions: vec![],
            mentions: vec![],
            edited: false,
            edited_at: None,
        }
    }

    fn flatten(groups: &[DateGroup]) -> Vec<Message> {
        groups.iter().flat_map(|g| g.messages.clone()).collect()
    }

    #[test]
    fn labels_relative_to_today() {
        let messages = vec![
            message("2024-03-04T09:00:00Z"),
            message("2024-03-05T09:00:00Z"),
            message("2024-03-06T09:00:00Z"),
            message("2024-03-06T10:00:00Z"),
        ];
        let groups = partition(&messages, at("2024-03-06T12:00:00Z"), &Utc);

        let labels: Vec<&str> = groups.iter().map(|g| g.label.as_str()).collect();
        assert_eq!(labels, vec!["Monday, March 4", "Yesterday", "Today"]);
        assert_eq!(groups[2].messages.len(), 2);
        assert_eq!(
            groups.iter().map(|g| g.show_divider).collect::<Vec<_>>(),
            vec![false, true, true]
        );
    }

    #[test]
    fn days_follow_the_viewer_time_zone() {
        // 23:30 UTC on the 5th is already the 6th in UTC+2.
        let messages = vec![message("2024-03-05T23:30:00Z"), message("2024-03-06T01:00:00Z")];
        let now = at("2024-03-06T12:00:00Z");

        assert_eq!(partition(&messages, now, &Utc).len(), 2);

        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let groups = partition(&messages, now, &plus_two);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].label, TODAY);
    }

    #[test]
    fn partition_is_idempotent_and_order_preserving() {
        let messages = vec![
            message("2024-02-28T08:00:00Z"),
            message("2024-02-29T08:00:00Z"),
            message("2024-02-29T09:00:00Z"),
            message("2024-03-01T00:00:00Z"),
        ];
        let now = at("2024-03-01T12:00:00Z");

        let once = partition(&messages, now, &Utc);
        assert_eq!(flatten(&once), messages);

        let twice = partition(&flatten(&once), now, &Utc);
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_input_yields_no_groups() {
        assert!(partition(&[], Utc::now(), &Utc).is_empty());
    }
}
