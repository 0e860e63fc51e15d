use chrono::{Datelike, Duration, NaiveDate, NaiveTime, TimeZone};

use crate::error::EngineError;
use crate::models::{Settings, SnoozeAction, Timestamp};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;

/// Turns a snooze choice into an absolute wake time (epoch ms).
///
/// Pure: the only notion of "now" is the `now` argument, and local dates are
/// computed in `tz`. Times that have already passed roll forward to their next
/// occurrence; the result is always strictly after `now`.
pub fn resolve<Tz: TimeZone>(
    action: &SnoozeAction,
    now: Timestamp,
    tz: &Tz,
    settings: &Settings,
) -> Result<Timestamp, EngineError> {
    let local_now = tz
        .timestamp_millis_opt(now)
        .single()
        .ok_or_else(|| EngineError::InvalidSchedule(format!("unrepresentable time {now}")))?;
    let today = local_now.date_naive();
    let morning = settings.start_time();
    let evening = settings.end_time();

    let resolved = match action {
        SnoozeAction::LaterToday => {
            let hours = i64::from(settings.later_today_hours.max(1));
            Some(ceil_to_minute(now + hours * HOUR_MS))
        }
        SnoozeAction::ThisEvening => at_local(tz, today, evening)
            .filter(|at| *at > now)
            .or_else(|| at_local(tz, today + Duration::days(1), evening)),
        SnoozeAction::Tomorrow => at_local(tz, today + Duration::days(1), morning),
        SnoozeAction::ThisWeekend => (0..=7)
            .map(|offset| today + Duration::days(offset))
            .filter(|date| day_index(*date) == settings.weekend_begin)
            .filter_map(|date| at_local(tz, date, morning))
            .find(|at| *at > now),
        SnoozeAction::NextMonday => next_weekday(today, settings.week_begin)
            .and_then(|date| at_local(tz, date, morning)),
        SnoozeAction::InAWeek => at_local(tz, today + Duration::days(7), morning),
        SnoozeAction::InAMonth => at_local(tz, next_month_same_day(today), morning),
        SnoozeAction::PickDate { at } => {
            if *at <= now {
                return Err(EngineError::InvalidSchedule(
                    "the picked time is in the past".to_string(),
                ));
            }
            Some(*at)
        }
    };

    match resolved {
        Some(at) if at > now => Ok(at),
        _ => Err(EngineError::InvalidSchedule(format!(
            "could not find a future time for {action:?}"
        ))),
    }
}

/// Day-of-week index with 0 = Sunday.
fn day_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// The first date strictly after `date` falling on `weekday`.
fn next_weekday(date: NaiveDate, weekday: u8) -> Option<NaiveDate> {
    (1..=7)
        .map(|offset| date + Duration::days(offset))
        .find(|candidate| day_index(*candidate) == weekday)
}

fn next_month_same_day(date: NaiveDate) -> NaiveDate {
    let mut year = date.year();
    let mut month = date.month() + 1;
    if month > 12 {
        month = 1;
        year += 1;
    }
    let use_day = std::cmp::min(date.day(), last_day_of_month(year, month));
    NaiveDate::from_ymd_opt(year, month, use_day).unwrap_or(date + Duration::days(30))
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .map(|first_next| (first_next - Duration::days(1)).day())
        .unwrap_or(28)
}

/// Local wall-clock time to epoch ms. A time skipped by a DST jump resolves to
/// the same wall time one hour later; a repeated one to its first occurrence.
fn at_local<Tz: TimeZone>(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<Timestamp> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.timestamp_millis())
}

fn ceil_to_minute(at: Timestamp) -> Timestamp {
    let rem = at.rem_euclid(MINUTE_MS);
    if rem == 0 {
        at
    } else {
        at + (MINUTE_MS - rem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Berlin;
    use chrono_tz::Tz;

    fn at(tz: &Tz, y: i32, m: u32, d: u32, h: u32, min: u32) -> Timestamp {
        tz.with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    fn all_actions(now: Timestamp) -> Vec<SnoozeAction> {
        vec![
            SnoozeAction::LaterToday,
            SnoozeAction::ThisEvening,
            SnoozeAction::Tomorrow,
            SnoozeAction::ThisWeekend,
            SnoozeAction::NextMonday,
            SnoozeAction::InAWeek,
            SnoozeAction::InAMonth,
            SnoozeAction::PickDate { at: now + 1 },
        ]
    }

    // 2026-10-14 is a Wednesday.
    #[test]
    fn relative_actions_resolve_against_local_settings() {
        let settings = Settings::default();
        let now = at(&Berlin, 2026, 10, 14, 10, 0);
        let resolve_at = |action: SnoozeAction| resolve(&action, now, &Berlin, &settings).unwrap();

        assert_eq!(resolve_at(SnoozeAction::LaterToday), at(&Berlin, 2026, 10, 14, 13, 0));
        assert_eq!(resolve_at(SnoozeAction::ThisEvening), at(&Berlin, 2026, 10, 14, 18, 0));
        assert_eq!(resolve_at(SnoozeAction::Tomorrow), at(&Berlin, 2026, 10, 15, 9, 0));
        assert_eq!(resolve_at(SnoozeAction::ThisWeekend), at(&Berlin, 2026, 10, 17, 9, 0));
        assert_eq!(resolve_at(SnoozeAction::NextMonday), at(&Berlin, 2026, 10, 19, 9, 0));
        assert_eq!(resolve_at(SnoozeAction::InAWeek), at(&Berlin, 2026, 10, 21, 9, 0));
        assert_eq!(resolve_at(SnoozeAction::InAMonth), at(&Berlin, 2026, 11, 14, 9, 0));
    }

    #[test]
    fn this_evening_rolls_to_tomorrow_once_the_evening_started() {
        let settings = Settings::default();
        let now = at(&Berlin, 2026, 10, 14, 19, 30);
        let out = resolve(&SnoozeAction::ThisEvening, now, &Berlin, &settings).unwrap();
        assert_eq!(out, at(&Berlin, 2026, 10, 15, 18, 0));

        let exactly = at(&Berlin, 2026, 10, 14, 18, 0);
        let out = resolve(&SnoozeAction::ThisEvening, exactly, &Berlin, &settings).unwrap();
        assert_eq!(out, at(&Berlin, 2026, 10, 15, 18, 0));
    }

    #[test]
    fn weekend_and_week_start_boundaries() {
        let settings = Settings::default();

        // Saturday before the morning threshold: still this weekend.
        let sat_early = at(&Berlin, 2026, 10, 17, 8, 0);
        let out = resolve(&SnoozeAction::ThisWeekend, sat_early, &Berlin, &settings).unwrap();
        assert_eq!(out, at(&Berlin, 2026, 10, 17, 9, 0));

        // Saturday after it: the next weekend start.
        let sat_late = at(&Berlin, 2026, 10, 17, 11, 0);
        let out = resolve(&SnoozeAction::ThisWeekend, sat_late, &Berlin, &settings).unwrap();
        assert_eq!(out, at(&Berlin, 2026, 10, 24, 9, 0));

        // Monday morning before start_day still means next week's Monday.
        let monday = at(&Berlin, 2026, 10, 19, 7, 0);
        let out = resolve(&SnoozeAction::NextMonday, monday, &Berlin, &settings).unwrap();
        assert_eq!(out, at(&Berlin, 2026, 10, 26, 9, 0));

        // Week and weekend beginnings follow the settings.
        let custom = Settings {
            week_begin: 0,
            weekend_begin: 5,
            ..Settings::default()
        };
        let wed = at(&Berlin, 2026, 10, 14, 10, 0);
        let out = resolve(&SnoozeAction::NextMonday, wed, &Berlin, &custom).unwrap();
        assert_eq!(out, at(&Berlin, 2026, 10, 18, 9, 0));
        let out = resolve(&SnoozeAction::ThisWeekend, wed, &Berlin, &custom).unwrap();
        assert_eq!(out, at(&Berlin, 2026, 10, 16, 9, 0));
    }

    #[test]
    fn in_a_month_clamps_to_the_end_of_shorter_months() {
        let settings = Settings::default();
        let now = at(&Berlin, 2026, 1, 31, 12, 0);
        let out = resolve(&SnoozeAction::InAMonth, now, &Berlin, &settings).unwrap();
        assert_eq!(out, at(&Berlin, 2026, 2, 28, 9, 0));

        let december = at(&Berlin, 2026, 12, 15, 12, 0);
        let out = resolve(&SnoozeAction::InAMonth, december, &Berlin, &settings).unwrap();
        assert_eq!(out, at(&Berlin, 2027, 1, 15, 9, 0));
    }

    #[test]
    fn pick_date_is_used_as_is_but_never_in_the_past() {
        let settings = Settings::default();
        let now = at(&Berlin, 2026, 10, 14, 10, 0);
        let target = now + 12_345;
        assert_eq!(
            resolve(&SnoozeAction::PickDate { at: target }, now, &Berlin, &settings).unwrap(),
            target
        );
        for past in [now, now - 1] {
            let err = resolve(&SnoozeAction::PickDate { at: past }, now, &Berlin, &settings);
            assert!(matches!(err, Err(EngineError::InvalidSchedule(_))));
        }
    }

    #[test]
    fn later_today_rounds_up_to_the_minute() {
        let settings = Settings::default();
        let now = at(&Berlin, 2026, 10, 14, 10, 0) + 1_500;
        let out = resolve(&SnoozeAction::LaterToday, now, &Berlin, &settings).unwrap();
        assert_eq!(out, at(&Berlin, 2026, 10, 14, 13, 1));
    }

    #[test]
    fn skipped_local_times_move_past_the_dst_gap() {
        // Berlin jumps from 02:00 to 03:00 on 2026-03-29.
        let settings = Settings {
            start_day: "02:30".to_string(),
            ..Settings::default()
        };
        let now = at(&Berlin, 2026, 3, 28, 12, 0);
        let out = resolve(&SnoozeAction::Tomorrow, now, &Berlin, &settings).unwrap();
        assert_eq!(out, at(&Berlin, 2026, 3, 29, 3, 30));
    }

    #[test]
    fn resolved_times_are_always_in_the_future() {
        let settings_variants = [
            Settings::default(),
            Settings {
                start_day: "00:00".to_string(),
                end_day: "23:59".to_string(),
                week_begin: 0,
                weekend_begin: 0,
                ..Settings::default()
            },
            Settings {
                start_day: "07:15".to_string(),
                end_day: "07:16".to_string(),
                week_begin: 6,
                weekend_begin: 3,
                later_today_hours: 1,
                ..Settings::default()
            },
        ];
        let zones: [Tz; 3] = [Berlin, chrono_tz::America::New_York, chrono_tz::UTC];
        let start = at(&Berlin, 2026, 3, 20, 0, 0);
        for tz in &zones {
            for settings in &settings_variants {
                let mut now = start;
                // Every 37 minutes for three weeks, which crosses a DST change.
                while now < start + 21 * 24 * HOUR_MS {
                    for action in all_actions(now) {
                        let out = resolve(&action, now, tz, settings).unwrap();
                        assert!(out > now, "{action:?} at {now} in {tz:?} gave {out}");
                    }
                    now += 37 * MINUTE_MS;
                }
            }
        }
    }
}
