use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

use nervecore::timed::Recurrence;

fn arb_rrule() -> impl Strategy<Value = String> {
    (
        prop_oneof![
            Just("MINUTELY"),
            Just("HOURLY"),
            Just("DAILY"),
            Just("WEEKLY"),
        ],
        1u32..5,
        0u32..24,
        0u32..60,
    )
        .prop_map(|(freq, interval, hour, minute)| match freq {
            "DAILY" | "WEEKLY" => {
                format!("FREQ={freq};INTERVAL={interval};BYHOUR={hour};BYMINUTE={minute}")
            }
            _ => format!("FREQ={freq};INTERVAL={interval}"),
        })
}

fn arb_start() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..365, 0i64..86_400).prop_map(|(day, second)| {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::days(day)
            + chrono::Duration::seconds(second)
    })
}

proptest! {
    /// Successive occurrences are strictly increasing and never behind the
    /// anchor they were computed from.
    #[test]
    fn occurrences_are_strictly_increasing(rrule in arb_rrule(), start in arb_start()) {
        let rule = Recurrence::parse(&rrule).expect("generated rules parse");
        let mut cursor = start;
        for _ in 0..5 {
            let next = rule
                .next_occurrence(cursor, chrono_tz::UTC)
                .expect("an occurrence always exists");
            prop_assert!(next > cursor, "{next} must be after {cursor} for {rrule}");
            cursor = next;
        }
    }

    /// The nominal period scales linearly with INTERVAL.
    #[test]
    fn period_scales_with_interval(interval in 1u32..10) {
        let base = Recurrence::parse("FREQ=HOURLY").unwrap().period();
        let scaled = Recurrence::parse(&format!("FREQ=HOURLY;INTERVAL={interval}"))
            .unwrap()
            .period();
        prop_assert_eq!(scaled, base * interval as i32);
    }
}
