use super::*;

use chrono::{DateTime, TimeZone, Utc};

fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, second).unwrap()
}

fn message(id: &str, sender: &str, content: &str, timestamp: DateTime<Utc>) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from("c1"),
        sender: UserId::from(sender),
        content: content.to_string(),
        attachments: Vec::new(),
        timestamp,
        pending: false,
        delivered: true,
    }
}

fn timeline() -> ConversationTimeline {
    ConversationTimeline::new(
        ConversationId::from("c1"),
        Duration::from_secs(2),
        Duration::from_secs(10),
    )
}

fn ids(timeline: &ConversationTimeline) -> Vec<&str> {
    timeline.messages().iter().map(|m| m.id.as_str()).collect()
}

#[test]
fn delivery_before_durable_response_converges_to_one_entry() {
    let now = Instant::now();
    let mut timeline = timeline();
    timeline.append_optimistic(message("t1", "alice", "hey", at(9, 0, 0)));

    let outcome = timeline.accept_delivery(message("m42", "alice", "hey", at(9, 0, 0)), now);
    assert_eq!(outcome, DeliveryOutcome::ReplacedPending);
    assert!(!timeline.confirm_sent(&MessageId::from("t1"), &MessageId::from("m42")));

    assert_eq!(ids(&timeline), vec!["m42"]);
    assert!(!timeline.messages()[0].pending);
}

#[test]
fn durable_response_before_delivery_converges_to_one_entry() {
    let now = Instant::now();
    let mut timeline = timeline();
    timeline.append_optimistic(message("t1", "alice", "hey", at(9, 0, 0)));
    assert!(timeline.messages()[0].pending);

    assert!(timeline.confirm_sent(&MessageId::from("t1"), &MessageId::from("m42")));
    let outcome = timeline.accept_delivery(message("m42", "alice", "hey", at(9, 0, 0)), now);

    assert_eq!(outcome, DeliveryOutcome::DuplicateId);
    assert_eq!(ids(&timeline), vec!["m42"]);
    assert!(!timeline.messages()[0].pending);
    assert!(timeline.messages()[0].delivered);
}

#[test]
fn same_id_delivered_twice_is_kept_once() {
    let now = Instant::now();
    let mut timeline = timeline();
    let m = message("m1", "bob", "yo", at(9, 0, 0));

    assert_eq!(timeline.accept_delivery(m.clone(), now), DeliveryOutcome::Appended);
    assert_eq!(
        timeline.accept_delivery(m, now + Duration::from_secs(30)),
        DeliveryOutcome::DuplicateId
    );
    assert_eq!(timeline.len(), 1);
}

#[test]
fn repeated_event_with_new_id_is_dropped_inside_the_window() {
    let now = Instant::now();
    let mut timeline = timeline();

    timeline.accept_delivery(message("m1", "bob", "yo", at(9, 0, 0)), now);
    let outcome = timeline.accept_delivery(
        message("m1-copy", "bob", "yo", at(9, 0, 0)),
        now + Duration::from_millis(1_500),
    );

    assert_eq!(outcome, DeliveryOutcome::DuplicateRecent);
    assert_eq!(ids(&timeline), vec!["m1"]);
}

#[test]
fn repeated_content_outside_the_window_is_appended() {
    let now = Instant::now();
    let mut timeline = timeline();

    timeline.accept_delivery(message("m1", "bob", "yo", at(9, 0, 0)), now);
    let outcome = timeline.accept_delivery(
        message("m2", "bob", "yo", at(9, 0, 0)),
        now + Duration::from_secs(3),
    );

    assert_eq!(outcome, DeliveryOutcome::Appended);
    assert_eq!(timeline.len(), 2);
}

#[test]
fn recent_set_is_pruned_after_retention() {
    let now = Instant::now();
    let mut timeline = timeline();

    timeline.accept_delivery(message("m1", "bob", "a", at(9, 0, 0)), now);
    timeline.accept_delivery(message("m2", "bob", "b", at(9, 0, 1)), now + Duration::from_secs(1));
    assert_eq!(timeline.recent_len(), 2);

    timeline.accept_delivery(message("m3", "bob", "c", at(9, 0, 2)), now + Duration::from_secs(11));
    assert_eq!(timeline.recent_len(), 1);
}

#[test]
fn pending_match_ignores_timestamp_and_takes_the_earliest_entry() {
    let now = Instant::now();
    let mut timeline = timeline();
    timeline.append_optimistic(message("t1", "alice", "same", at(9, 0, 0)));
    timeline.append_optimistic(message("t2", "alice", "same", at(9, 0, 1)));

    let outcome = timeline.accept_delivery(message("m7", "alice", "same", at(9, 0, 5)), now);

    assert_eq!(outcome, DeliveryOutcome::ReplacedPending);
    assert_eq!(ids(&timeline), vec!["m7", "t2"]);
    assert_eq!(timeline.messages()[0].timestamp, at(9, 0, 5));
}

#[test]
fn confirm_drops_pending_entry_when_durable_id_is_already_listed() {
    let now = Instant::now();
    let mut timeline = timeline();
    timeline.accept_delivery(message("m9", "alice", "first", at(9, 0, 0)), now);
    timeline.append_optimistic(message("t3", "alice", "edited", at(9, 0, 1)));

    assert!(timeline.confirm_sent(&MessageId::from("t3"), &MessageId::from("m9")));
    assert_eq!(ids(&timeline), vec!["m9"]);
}

#[test]
fn replace_history_resets_trackers() {
    let now = Instant::now();
    let mut timeline = timeline();
    timeline.accept_delivery(message("m1", "bob", "yo", at(9, 0, 0)), now);

    timeline.replace_history(vec![message("h1", "bob", "old", at(8, 0, 0))]);

    assert_eq!(timeline.recent_len(), 0);
    assert_eq!(ids(&timeline), vec!["h1"]);
    let outcome = timeline.accept_delivery(message("m1-copy", "bob", "yo", at(9, 0, 0)), now);
    assert_eq!(outcome, DeliveryOutcome::Appended);
}

#[test]
fn discard_pending_only_removes_optimistic_entries() {
    let mut timeline = timeline();
    timeline.append_optimistic(message("t1", "alice", "oops", at(9, 0, 0)));
    timeline.replace_history(vec![message("m1", "bob", "kept", at(8, 0, 0))]);
    timeline.append_optimistic(message("t2", "alice", "retry", at(9, 0, 0)));

    assert!(timeline.discard_pending(&MessageId::from("m1")).is_none());
    let dropped = timeline.discard_pending(&MessageId::from("t2")).expect("pending entry");
    assert_eq!(dropped.content, "retry");
    assert_eq!(ids(&timeline), vec!["m1", "t1"]);
}

#[test]
fn history_reload_keeps_sends_still_in_flight() {
    let mut timeline = timeline();
    timeline.append_optimistic(message("t1", "alice", "hey", at(9, 0, 0)));

    timeline.replace_history(vec![message("h1", "bob", "old", at(8, 0, 0))]);
    assert_eq!(ids(&timeline), vec!["h1", "t1"]);
    assert!(timeline.messages()[1].pending);

    assert!(timeline.confirm_sent(&MessageId::from("t1"), &MessageId::from("m42")));
    assert_eq!(ids(&timeline), vec!["h1", "m42"]);
    assert!(!timeline.messages()[1].pending);
}

#[test]
fn tagged_echo_replaces_its_own_pending_entry() {
    let now = Instant::now();
    let mut timeline = timeline();
    timeline.append_optimistic(message("t1", "alice", "same", at(9, 0, 0)));
    timeline.append_optimistic(message("t2", "alice", "same", at(9, 0, 1)));

    let outcome = timeline.accept_tagged_delivery(
        message("m8", "alice", "same", at(9, 0, 1)),
        Some(&MessageId::from("t2")),
        now,
    );

    assert_eq!(outcome, DeliveryOutcome::ReplacedPending);
    assert_eq!(ids(&timeline), vec!["t1", "m8"]);
    assert!(timeline.messages()[0].pending);
}

#[test]
fn grouping_sorts_and_buckets_by_day() {
    let day_two = Utc.with_ymd_and_hms(2024, 5, 2, 7, 0, 0).unwrap();
    let messages = vec![
        message("c", "bob", "morning", day_two),
        message("b", "bob", "late", at(23, 59, 0)),
        message("a", "bob", "early", at(8, 0, 0)),
    ];

    let groups = group_by_day(&messages);

    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].day, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
    let first: Vec<&str> = groups[0].messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(first, vec!["a", "b"]);
    assert_eq!(groups[1].messages[0].id.as_str(), "c");
}
