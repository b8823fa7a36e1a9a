//! Software real time clock disciplined by the bus date/time broadcasts
use tracing::debug;

/// Calendar stamp handled by the clock (month is 0 based internally)
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DateTime {
    /// Seconds [0-59]
    pub sec: u16,
    /// Minutes [0-59]
    pub min: u16,
    /// Hours [0-23]
    pub hour: u16,
    /// Day of month [1-31], 0 while unset
    pub day: u16,
    /// Month [0-11]
    pub month: u16,
    /// Absolute year
    pub year: u16,
}

impl DateTime {
    /// Placeholder before any date or time has been received
    pub const UNSET: DateTime = DateTime {
        sec: 0,
        min: 0,
        hour: 0xFFFF,
        day: 0,
        month: 0,
        year: 0,
    };

    /// Date and time must both have been received for the stamp to be usable
    pub fn is_set(&self) -> bool {
        self.day != 0 && self.hour != 0xFFFF
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        for word in [self.sec, self.min, self.hour, self.day, self.month, self.year] {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }

    pub(crate) fn decode(raw: &[u8]) -> DateTime {
        let word = |at: usize| u16::from_le_bytes([raw[2 * at], raw[2 * at + 1]]);
        DateTime {
            sec: word(0),
            min: word(1),
            hour: word(2),
            day: word(3),
            month: word(4),
            year: word(5),
        }
    }
}

/// Calendar transition reported by the clock
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DateChange {
    /// First successful calibration, restored baselines can now be checked
    /// against the real date
    Init,
    /// The day rolled over within the same month
    Day,
    /// The month rolled over within the same year
    Month,
    /// The year rolled over
    Year,
}

/// Reference year of the linear second count
const REFERENCE_YEAR: i64 = 2020;

/// Cumulated days before each month, non leap years
const DAYS_TO_MONTH: [i64; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];

fn leap_year(year: u16) -> bool {
    (year & 3) == 0 && (year % 100 != 0 || year % 400 == 0)
}

fn month_days(month: u16, year: u16) -> u16 {
    match month {
        0 | 2 | 4 | 6 | 7 | 9 | 11 => 31,
        1 => {
            if leap_year(year) {
                29
            } else {
                28
            }
        }
        _ => 30,
    }
}

/// Linear second count of a calendar stamp since a fixed reference
///
/// The reference point is arbitrary, only the difference between two stamps
/// is meaningful. Leap days are counted with the `y/4 - y/100 + y/400`
/// rule, one less when the current month is before March.
pub fn seconds_since_reference(dt: &DateTime) -> i64 {
    let mut leap_years = dt.year as i64;
    if dt.month < 2 {
        leap_years -= 1;
    }
    leap_years = leap_years / 4 - leap_years / 100 + leap_years / 400;
    dt.sec as i64
        + dt.min as i64 * 60
        + dt.hour as i64 * 3600
        + (dt.day as i64 - 1
            + DAYS_TO_MONTH[(dt.month % 12) as usize]
            + leap_years
            + (dt.year as i64 + dt.month as i64 / 12 - REFERENCE_YEAR) * 365)
            * 86400
}

/// Advance a stamp by whole seconds and renormalize every field
fn add_seconds(dt: &mut DateTime, add: u64) {
    let mut sec = dt.sec as u64 + add;
    let mut min = dt.min as u64 + sec / 60;
    sec %= 60;
    let mut hour = dt.hour as u64 + min / 60;
    min %= 60;
    let mut day = dt.day as u64 + hour / 24;
    hour %= 24;
    let mut month = dt.month as u64;
    let mut year = dt.year as u64;
    loop {
        if month >= 12 {
            year += 1;
            month -= 12;
            continue;
        }
        let len = month_days(month as u16, year as u16) as u64;
        if day > len {
            day -= len;
            month += 1;
        } else {
            break;
        }
    }
    *dt = DateTime {
        sec: sec as u16,
        min: min as u16,
        hour: hour as u16,
        day: day as u16,
        month: month as u16,
        year: year as u16,
    };
}

/// What a clock tick asks from the host
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ClockOutcome {
    /// The date, time and date/time datapoints should be read from the bus
    pub resync_request: bool,
    /// Fresh snapshot to mirror on the status datapoint
    pub status: Option<DateTime>,
    /// Calendar boundary crossed since the previous tick
    pub rollover: Option<DateChange>,
}

/// Drift corrected software clock synchronized from the bus
///
/// Between two accepted observations the current time is extrapolated from
/// the monotonic local millisecond counter, rescaled by a rational
/// correction factor which is recalibrated on every accepted sync.
///
/// ```
/// use teleinfo_knx::clock::BusClock;
///
/// let mut clock = BusClock::new(60);
/// clock.set_date_time(1_000, 2024, 2, 29, 12, 0, 0);
/// assert!(clock.is_valid());
/// assert_eq!(12, clock.current(1_000).hour);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusClock {
    resync_period_ms: u64,
    stamp: DateTime,
    last_stamp: DateTime,
    corr_num: i64,
    corr_den: i64,
    anchor: Option<u64>,
    last_sync: Option<u64>,
    last_requested: Option<u64>,
    last_emitted: DateTime,
    throttle: u64,
    status_dirty: bool,
}

impl BusClock {
    pub(crate) const ENCODED_LEN: usize = 2 * 12 + 2 * 8 + 9;

    /// Create an unsynchronized clock requesting a resync every
    /// `resync_minutes` (0 disables the periodic requests)
    pub fn new(resync_minutes: u32) -> BusClock {
        BusClock {
            resync_period_ms: resync_minutes as u64 * 60 * 1000,
            stamp: DateTime::UNSET,
            last_stamp: DateTime::default(),
            corr_num: 1,
            corr_den: 1,
            anchor: None,
            last_sync: None,
            last_requested: None,
            last_emitted: DateTime::default(),
            throttle: 0,
            status_dirty: false,
        }
    }

    /// Whether a full date and time have both been received
    pub fn is_valid(&self) -> bool {
        self.stamp.is_set()
    }

    /// Correction factor converting local milliseconds into calendar ones
    pub fn correction(&self) -> (i64, i64) {
        (self.corr_num, self.corr_den)
    }

    /// Feed a date observation from the bus (month 1 based on the wire)
    pub fn set_date(&mut self, now: u64, year: u16, month: u16, day: u16) -> Option<DateChange> {
        self.stamp.year = year;
        self.stamp.month = month.saturating_sub(1);
        self.stamp.day = day;
        self.adjust(now)
    }

    /// Feed a time of day observation from the bus
    pub fn set_time(&mut self, now: u64, hour: u16, min: u16, sec: u16) -> Option<DateChange> {
        self.stamp.hour = hour;
        self.stamp.min = min;
        self.stamp.sec = sec;
        self.adjust(now)
    }

    /// Feed a combined date and time observation from the bus
    #[allow(clippy::too_many_arguments)]
    pub fn set_date_time(
        &mut self,
        now: u64,
        year: u16,
        month: u16,
        day: u16,
        hour: u16,
        min: u16,
        sec: u16,
    ) -> Option<DateChange> {
        self.stamp.year = year;
        self.stamp.month = month.saturating_sub(1);
        self.stamp.day = day;
        self.stamp.hour = hour;
        self.stamp.min = min;
        self.stamp.sec = sec;
        self.adjust(now)
    }

    /// Recalibrate the correction factor from a fresh observation
    ///
    /// The candidate is the nominal elapsed time between the two last
    /// observations, rescaled by the inverse of the held factor, over the
    /// locally elapsed milliseconds. Candidates outside the [0.9, 1.1]
    /// band are discarded: a single bad report or a long gap must not
    /// destabilize the estimate.
    fn adjust(&mut self, now: u64) -> Option<DateChange> {
        if !self.is_valid() {
            return None;
        }
        if let Some(last_sync) = self.last_sync {
            let nominal_ms = 1000
                * (seconds_since_reference(&self.stamp) - seconds_since_reference(&self.last_stamp));
            let num = nominal_ms as i128 * self.corr_den as i128 / self.corr_num as i128;
            let den = now.saturating_sub(last_sync) as i128;
            if num != 0 && den != 0 && num * 10 >= den * 9 && num * 10 <= den * 11 {
                self.corr_num = num as i64;
                self.corr_den = den as i64;
            } else {
                debug!("clock correction candidate {}/{} rejected", num, den);
            }
        }
        let first_sync = self.anchor.is_none();
        self.anchor = Some(now);
        self.last_sync = Some(now);
        self.last_stamp = self.stamp;
        first_sync.then_some(DateChange::Init)
    }

    /// Current believed date/time, lazily advanced from the local counter
    ///
    /// Queries less than a second after the previous advance return the
    /// stored stamp unchanged; otherwise the corrected elapsed time is
    /// added and the sub second remainder is folded back into the anchor.
    pub fn current(&mut self, now: u64) -> DateTime {
        let Some(anchor) = self.anchor else {
            return self.stamp;
        };
        let elapsed = now.saturating_sub(anchor);
        if elapsed < 1000 {
            return self.stamp;
        }
        let adjusted_ms = (elapsed as i128 * self.corr_num as i128 / self.corr_den as i128) as u64;
        add_seconds(&mut self.stamp, adjusted_ms / 1000);
        self.anchor = Some(now - adjusted_ms % 1000);
        self.status_dirty = true;
        self.stamp
    }

    /// Snapshot published on the status datapoint (month 1 based)
    pub fn status_stamp(&self) -> DateTime {
        DateTime {
            month: self.stamp.month + 1,
            year: if self.stamp.year == 0 {
                1900
            } else {
                self.stamp.year
            },
            ..self.stamp
        }
    }

    pub(crate) fn take_status(&mut self) -> Option<DateTime> {
        if self.status_dirty {
            self.status_dirty = false;
            Some(self.status_stamp())
        } else {
            None
        }
    }

    /// Periodic maintenance, throttled to one pass per 100 ms
    ///
    /// Emits at most one boundary event per tick; the listener is expected
    /// to treat `Month` and `Year` as including the lower order boundaries.
    pub fn tick(&mut self, now: u64) -> ClockOutcome {
        let mut outcome = ClockOutcome::default();
        if now.saturating_sub(self.throttle) < 100 {
            return outcome;
        }
        self.throttle = now;

        if self.resync_period_ms != 0 {
            let sync_stale = self
                .last_sync
                .map_or(now > self.resync_period_ms, |at| {
                    now - at > self.resync_period_ms
                });
            let due = match self.last_requested {
                None => true,
                Some(at) => sync_stale && now - at > self.resync_period_ms,
            };
            if due {
                self.last_requested = Some(now);
                outcome.resync_request = true;
            }
        }

        if self.stamp.day != 0 {
            let current = self.current(now);
            if self.last_emitted.day == 0 {
                self.last_emitted = current;
            } else {
                let last = self.last_emitted;
                let change = if current.year == last.year
                    && current.month == last.month
                    && current.day > last.day
                {
                    Some(DateChange::Day)
                } else if current.year == last.year && current.month > last.month {
                    Some(DateChange::Month)
                } else if current.year > last.year {
                    Some(DateChange::Year)
                } else {
                    None
                };
                if change.is_some() {
                    self.last_emitted = current;
                    outcome.rollover = change;
                }
            }
        }
        outcome.status = self.take_status();
        outcome
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        self.stamp.encode(out);
        self.last_emitted.encode(out);
        out.extend_from_slice(&self.corr_num.to_le_bytes());
        out.extend_from_slice(&self.corr_den.to_le_bytes());
        out.push(self.anchor.is_some() as u8);
        out.extend_from_slice(&self.anchor.unwrap_or(0).to_le_bytes());
    }

    /// Restore the reset surviving part of the state
    ///
    /// The sync bookkeeping is intentionally left cleared: the next
    /// observation is stored without recalibration, as after a fresh boot,
    /// but the running stamp and correction factor carry over.
    pub(crate) fn restore(&mut self, raw: &[u8]) {
        self.stamp = DateTime::decode(&raw[0..12]);
        self.last_emitted = DateTime::decode(&raw[12..24]);
        self.corr_num = read_i64(raw, 24);
        self.corr_den = read_i64(raw, 32);
        if self.corr_den == 0 {
            self.corr_num = 1;
            self.corr_den = 1;
        }
        self.anchor = (raw[40] != 0).then(|| read_u64(raw, 41));
    }
}

fn read_u64(raw: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(word)
}

fn read_i64(raw: &[u8], at: usize) -> i64 {
    read_u64(raw, at) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> DateTime {
        DateTime {
            sec: 0,
            min: 0,
            hour: 0,
            day: 1,
            month: 0,
            year: 2020,
        }
    }

    #[test]
    fn calendar_round_trip() {
        let base = reference();
        let mut leap_februaries = 0;
        for year in 2020..=2027u16 {
            for month in 0..12u16 {
                let last_day = month_days(month, year);
                if month == 1 && last_day == 29 {
                    leap_februaries += 1;
                }
                for day in [1, 15, last_day] {
                    for (hour, min, sec) in [(0, 0, 0), (23, 59, 59), (12, 30, 7)] {
                        let dt = DateTime {
                            sec,
                            min,
                            hour,
                            day,
                            month,
                            year,
                        };
                        let delta = seconds_since_reference(&dt) - seconds_since_reference(&base);
                        let mut walked = base;
                        add_seconds(&mut walked, delta as u64);
                        assert_eq!(dt, walked, "round trip failed for {:?}", dt);
                    }
                }
            }
        }
        assert_eq!(2, leap_februaries);
    }

    #[test]
    fn leap_day_cascade() {
        let mut dt = DateTime {
            sec: 59,
            min: 59,
            hour: 23,
            day: 28,
            month: 1,
            year: 2024,
        };
        add_seconds(&mut dt, 1);
        assert_eq!((29, 1, 2024), (dt.day, dt.month, dt.year));
        add_seconds(&mut dt, 86400);
        assert_eq!((1, 2, 2024), (dt.day, dt.month, dt.year));

        let mut dt = DateTime {
            sec: 0,
            min: 0,
            hour: 0,
            day: 28,
            month: 1,
            year: 2023,
        };
        add_seconds(&mut dt, 86400);
        assert_eq!((1, 2, 2023), (dt.day, dt.month, dt.year));
    }

    #[test]
    fn first_observation_fires_init() {
        let mut clock = BusClock::new(0);
        assert!(!clock.is_valid());
        assert_eq!(None, clock.set_date(1_000, 2024, 6, 15));
        // Date alone is not enough, the clock stays unsynchronized
        assert!(!clock.is_valid());
        assert_eq!(
            Some(DateChange::Init),
            clock.set_time(1_200, 10, 30, 0),
            "first full observation must signal the init"
        );
        assert_eq!(None, clock.set_time(2_500, 10, 30, 2));
    }

    #[test]
    fn calibration_stays_in_band() {
        let mut clock = BusClock::new(0);
        clock.set_date_time(1_000, 2024, 6, 15, 10, 0, 0);
        // One hour of meter time over 3 601 s of local time
        clock.set_date_time(3_602_000, 2024, 6, 15, 11, 0, 0);
        let (num, den) = clock.correction();
        assert_eq!((3_600_000, 3_601_000), (num, den));
        assert!(num * 10 >= den * 9 && num * 10 <= den * 11);
    }

    #[test]
    fn out_of_band_candidate_is_discarded() {
        let mut clock = BusClock::new(0);
        clock.set_date_time(1_000, 2024, 6, 15, 10, 0, 0);
        clock.set_date_time(3_602_000, 2024, 6, 15, 11, 0, 0);
        let before = clock.correction();
        // One hour of meter time over 30 min of local time, a 2.0 ratio
        clock.set_date_time(5_402_000, 2024, 6, 15, 12, 0, 0);
        assert_eq!(before, clock.correction());
    }

    #[test]
    fn backward_observation_is_discarded() {
        let mut clock = BusClock::new(0);
        clock.set_date_time(1_000, 2024, 6, 15, 10, 0, 0);
        clock.set_date_time(3_601_000, 2024, 6, 15, 9, 0, 0);
        assert_eq!((1, 1), clock.correction());
    }

    #[test]
    fn display_is_monotonic() {
        let mut clock = BusClock::new(0);
        clock.set_date_time(0, 2024, 12, 31, 23, 59, 50);
        let mut previous = seconds_since_reference(&clock.current(0));
        for now in (500..120_000).step_by(700) {
            let linear = seconds_since_reference(&clock.current(now));
            assert!(linear >= previous, "clock moved backwards at {}", now);
            previous = linear;
        }
        // The year rolled over along the way
        assert_eq!(2025, clock.current(120_000).year);
    }

    #[test]
    fn sub_second_remainder_is_kept() {
        let mut clock = BusClock::new(0);
        clock.set_date_time(0, 2024, 6, 15, 10, 0, 0);
        assert_eq!(1, clock.current(1_500).sec);
        // The 500 ms left over from the first advance count for the second
        assert_eq!(2, clock.current(2_500).sec);
    }

    #[test]
    fn boundary_events() {
        let mut clock = BusClock::new(0);
        clock.set_date_time(0, 2024, 2, 28, 23, 59, 30);
        // Prime the emitted snapshot
        assert_eq!(None, clock.tick(200).rollover);
        assert_eq!(None, clock.tick(10_000).rollover);
        let outcome = clock.tick(40_000);
        assert_eq!(Some(DateChange::Day), outcome.rollover);
        assert!(outcome.status.is_some());
        // No repeated emission on the next tick
        assert_eq!(None, clock.tick(41_000).rollover);
    }

    #[test]
    fn month_boundary_wins_over_day() {
        let mut clock = BusClock::new(0);
        clock.set_date_time(0, 2024, 3, 31, 23, 59, 30);
        clock.tick(200);
        assert_eq!(Some(DateChange::Month), clock.tick(40_000).rollover);
    }

    #[test]
    fn year_boundary() {
        let mut clock = BusClock::new(0);
        clock.set_date_time(0, 2024, 12, 31, 23, 59, 30);
        clock.tick(200);
        assert_eq!(Some(DateChange::Year), clock.tick(40_000).rollover);
    }

    #[test]
    fn resync_requests_follow_the_period() {
        let mut clock = BusClock::new(1);
        // First request right away
        assert!(clock.tick(200).resync_request);
        assert!(!clock.tick(400).resync_request);
        // Not yet one period without sync
        assert!(!clock.tick(30_000).resync_request);
        assert!(clock.tick(61_000).resync_request);
        // A fresh sync holds the requests back
        clock.set_date_time(62_000, 2024, 6, 15, 10, 0, 0);
        assert!(!clock.tick(100_000).resync_request);
        assert!(clock.tick(125_000).resync_request);
    }

    #[test]
    fn requests_disabled_with_zero_period() {
        let mut clock = BusClock::new(0);
        assert!(!clock.tick(200).resync_request);
        assert!(!clock.tick(600_000).resync_request);
    }

    #[test]
    fn retained_snapshot_round_trip() {
        let mut clock = BusClock::new(15);
        clock.set_date_time(1_000, 2024, 6, 15, 10, 0, 0);
        clock.set_date_time(3_602_000, 2024, 6, 15, 11, 0, 0);
        clock.tick(3_602_000);

        let mut raw = Vec::new();
        clock.encode(&mut raw);
        assert_eq!(BusClock::ENCODED_LEN, raw.len());

        let mut resumed = BusClock::new(15);
        resumed.restore(&raw);
        assert!(resumed.is_valid());
        assert_eq!(clock.correction(), resumed.correction());
        assert_eq!(clock.current(3_602_000), resumed.current(3_602_000));
        // No init replay after a warm restart
        assert_eq!(None, resumed.set_date_time(3_700_000, 2024, 6, 15, 11, 2, 0));
    }
}
