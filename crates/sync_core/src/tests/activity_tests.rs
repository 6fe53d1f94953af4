use super::*;

fn signals(foreground: bool, map_engaged: bool, recent_input: bool) -> ActivitySignals {
    ActivitySignals {
        foreground,
        map_engaged,
        recent_input,
    }
}

#[test]
fn hidden_is_always_background() {
    assert_eq!(resolve_level(signals(false, true, true)), ActivityLevel::Background);
    assert_eq!(resolve_level(signals(false, false, false)), ActivityLevel::Background);
}

#[test]
fn input_or_map_promotes_to_active() {
    assert_eq!(resolve_level(signals(true, false, true)), ActivityLevel::Active);
    assert_eq!(resolve_level(signals(true, true, false)), ActivityLevel::Active);
    assert_eq!(resolve_level(signals(true, false, false)), ActivityLevel::Normal);
}

#[test]
fn cadence_follows_level() {
    assert_eq!(ActivityLevel::Active.cadence(), Duration::from_secs(60));
    assert_eq!(ActivityLevel::Normal.cadence(), Duration::from_secs(180));
    assert_eq!(ActivityLevel::Background.cadence(), Duration::from_secs(600));
}

#[test]
fn idle_timeout_demotes_active_to_normal() {
    let start = Instant::now();
    let mut tracker = ActivityTracker::new(start);
    assert_eq!(tracker.level(start), ActivityLevel::Active);

    let later = start + IDLE_DEMOTION_AFTER;
    assert_eq!(tracker.level(later), ActivityLevel::Normal);

    tracker.record_input(later);
    assert_eq!(tracker.level(later), ActivityLevel::Active);
}

#[test]
fn engaged_map_holds_active_through_idle() {
    let start = Instant::now();
    let mut tracker = ActivityTracker::new(start);
    tracker.set_map_engaged(true);
    assert_eq!(
        tracker.level(start + Duration::from_secs(3_600)),
        ActivityLevel::Active
    );
}

#[test]
fn returning_to_foreground_counts_as_input() {
    let start = Instant::now();
    let mut tracker = ActivityTracker::new(start);
    tracker.set_foreground(false, start);
    let back = start + Duration::from_secs(3_600);
    assert_eq!(tracker.level(back), ActivityLevel::Background);

    tracker.set_foreground(true, back);
    assert_eq!(tracker.level(back), ActivityLevel::Active);
}

#[test]
fn touch_while_hidden_promotes_straight_to_active() {
    let start = Instant::now();
    let mut tracker = ActivityTracker::new(start);
    tracker.set_foreground(false, start);
    assert!(!tracker.is_foreground());
    assert_eq!(tracker.level(start), ActivityLevel::Background);

    let touch = start + Duration::from_secs(30);
    tracker.record_input(touch);

    assert!(tracker.is_foreground());
    assert_eq!(tracker.level(touch), ActivityLevel::Active);
}
