//! Tariff history engine deriving day/month/year consumption deltas
use tracing::warn;

use crate::bus::{DatapointId, DpValue, FieldBus, TariffSlot};
use crate::clock::{DateChange, DateTime};
use crate::storage::NvStorage;
use crate::teleinfo::{FieldId, OpTarif, Teleinfo};

/// Storage offset of the history record
const HISTORY_BASE: usize = 0;

/// Debounce delay of manually triggered saves
const MANUAL_SAVE_DELAY_MS: u64 = 60 * 60 * 1000;

/// Serialized record length, trailing checksum byte excluded
pub(crate) const RECORD_LEN: usize = 12 + TariffBucket::COUNT * 7 * 4;

/// Storage footprint of the history record, checksum byte included
pub const STORAGE_LEN: usize = RECORD_LEN + 1;

/// Consumption buckets reported on the bus
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(usize)]
pub enum TariffBucket {
    /// Whole subscription (sum of the two others on split plans)
    Base = 0,
    /// Dig hours
    HC,
    /// Full hours
    HP,
}

impl TariffBucket {
    /// Number of buckets
    pub const COUNT: usize = 3;

    /// All buckets
    pub const ALL: [TariffBucket; TariffBucket::COUNT] =
        [TariffBucket::Base, TariffBucket::HC, TariffBucket::HP];
}

/// Baselines of one tariff bucket
///
/// A baseline of 0 means "not yet established"; a genuine meter index of
/// exactly 0 cannot be told apart from it. A brand new meter would report
/// its very first watt hour one delta late, nothing worse.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BucketHistory {
    /// Mirror of the latest decoded cumulative index (Wh)
    pub index: u32,
    /// Index at the start of the current day
    pub yesterday: u32,
    /// Index at the start of the current month
    pub last_month: u32,
    /// Index at the start of the current year
    pub last_year: u32,
    /// Index at the start of the previous day
    pub day_m2: u32,
    /// Index at the start of the previous month
    pub month_m2: u32,
    /// Index at the start of the previous year
    pub year_m2: u32,
}

impl BucketHistory {
    /// Delta reported on a tariff datapoint, 0 while the baseline is unset
    pub fn delta(&self, slot: TariffSlot) -> u32 {
        let (index, baseline) = match slot {
            TariffSlot::Today => (self.index, self.yesterday),
            TariffSlot::Yesterday => (self.yesterday, self.day_m2),
            TariffSlot::ThisMonth => (self.index, self.last_month),
            TariffSlot::LastMonth => (self.last_month, self.month_m2),
            TariffSlot::ThisYear => (self.index, self.last_year),
            TariffSlot::LastYear => (self.last_year, self.year_m2),
        };
        if baseline != 0 {
            index.saturating_sub(baseline)
        } else {
            0
        }
    }
}

/// Current cumulative index of each bucket, depending on the tariff option
///
/// A plain plan meters everything on the base counter; the two rate plans
/// split into dig/full counters; Tempo and unrecognized plans sum the six
/// color counters. `Base` is always the sum of the two others on split
/// plans.
pub fn current_indexes(tele: &Teleinfo) -> [u32; TariffBucket::COUNT] {
    let mut index = [0u32; TariffBucket::COUNT];
    match tele.tarif_option() {
        OpTarif::BASE => {
            index[TariffBucket::Base as usize] = tele.slot(FieldId::Base).num();
        }
        OpTarif::HC => {
            index[TariffBucket::HC as usize] = tele.slot(FieldId::Hchc).num();
            index[TariffBucket::HP as usize] = tele.slot(FieldId::Hchp).num();
            index[TariffBucket::Base as usize] =
                index[TariffBucket::HC as usize] + index[TariffBucket::HP as usize];
        }
        OpTarif::EJP => {
            index[TariffBucket::HC as usize] = tele.slot(FieldId::Ejphn).num();
            index[TariffBucket::HP as usize] = tele.slot(FieldId::Ejphpm).num();
            index[TariffBucket::Base as usize] =
                index[TariffBucket::HC as usize] + index[TariffBucket::HP as usize];
        }
        OpTarif::BBRx(_) | OpTarif::UNKNOWN => {
            index[TariffBucket::HC as usize] = tele.slot(FieldId::Bbrhcjb).num()
                + tele.slot(FieldId::Bbrhcjw).num()
                + tele.slot(FieldId::Bbrhcjr).num();
            index[TariffBucket::HP as usize] = tele.slot(FieldId::Bbrhpjb).num()
                + tele.slot(FieldId::Bbrhpjw).num()
                + tele.slot(FieldId::Bbrhpjr).num();
            index[TariffBucket::Base as usize] =
                index[TariffBucket::HC as usize] + index[TariffBucket::HP as usize];
        }
    }
    index
}

/// Per bucket history with checksummed persistence
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TariffHistory {
    last_save: DateTime,
    tariff: [BucketHistory; TariffBucket::COUNT],
    manual_override: Option<u64>,
}

impl TariffHistory {
    /// Baselines of one bucket
    pub fn bucket(&self, bucket: TariffBucket) -> &BucketHistory {
        &self.tariff[bucket as usize]
    }

    /// Stamp of the last persisted save
    pub fn last_save(&self) -> DateTime {
        self.last_save
    }

    /// Mirror the decoded indexes and establish the missing baselines
    ///
    /// The meter counter is monotonic, an index below its baseline is a
    /// transient decode artefact and leaves the baseline untouched. A
    /// first seen index becomes its own baseline so the first delta reads
    /// zero instead of the raw counter.
    pub fn refresh(
        &mut self,
        indexes: [u32; TariffBucket::COUNT],
        clock_valid: bool,
        bus: &mut dyn FieldBus,
    ) {
        for bucket in TariffBucket::ALL {
            let at = bucket as usize;
            let tariff = &mut self.tariff[at];
            tariff.index = indexes[at];
            if indexes[at] == 0 || !clock_valid {
                continue;
            }
            if indexes[at] >= tariff.yesterday {
                if tariff.yesterday == 0 {
                    tariff.yesterday = indexes[at];
                }
                bus.update(
                    DatapointId::Tariff(bucket, TariffSlot::Today),
                    DpValue::U32(indexes[at] - tariff.yesterday),
                );
            }
            if indexes[at] >= tariff.last_month {
                if tariff.last_month == 0 {
                    tariff.last_month = indexes[at];
                }
                bus.update(
                    DatapointId::Tariff(bucket, TariffSlot::ThisMonth),
                    DpValue::U32(indexes[at] - tariff.last_month),
                );
            }
            if indexes[at] >= tariff.last_year {
                if tariff.last_year == 0 {
                    tariff.last_year = indexes[at];
                }
                bus.update(
                    DatapointId::Tariff(bucket, TariffSlot::ThisYear),
                    DpValue::U32(indexes[at] - tariff.last_year),
                );
            }
        }
    }

    /// Apply a calendar rollover, cascading into the lower severities
    ///
    /// A year change rotates the year, month and day generations; a month
    /// change the month and day ones. Returns whether the record should be
    /// persisted: only the month level asks for it, flash endurance being
    /// the binding constraint.
    pub fn rollover(&mut self, change: DateChange, bus: &mut dyn FieldBus) -> bool {
        let levels: &[DateChange] = match change {
            DateChange::Year => &[DateChange::Year, DateChange::Month, DateChange::Day],
            DateChange::Month => &[DateChange::Month, DateChange::Day],
            DateChange::Day => &[DateChange::Day],
            DateChange::Init => &[],
        };
        let mut save = false;
        for level in levels {
            self.shift(*level, bus);
            if *level == DateChange::Month {
                save = true;
            }
        }
        save
    }

    /// Rotate the generations of one severity level
    ///
    /// A bucket whose baseline already sits at the current index is left
    /// alone, so a duplicated boundary event cannot rotate twice.
    fn shift(&mut self, level: DateChange, bus: &mut dyn FieldBus) {
        for bucket in TariffBucket::ALL {
            let tariff = &mut self.tariff[bucket as usize];
            let index = tariff.index;
            match level {
                DateChange::Day => {
                    if tariff.yesterday != index {
                        tariff.day_m2 = tariff.yesterday;
                        tariff.yesterday = index;
                        if tariff.day_m2 != 0 {
                            bus.publish(
                                DatapointId::Tariff(bucket, TariffSlot::Yesterday),
                                DpValue::U32(tariff.delta(TariffSlot::Yesterday)),
                            );
                        }
                    }
                }
                DateChange::Month => {
                    if tariff.last_month != index {
                        tariff.month_m2 = tariff.last_month;
                        tariff.last_month = index;
                        if tariff.month_m2 != 0 {
                            bus.publish(
                                DatapointId::Tariff(bucket, TariffSlot::LastMonth),
                                DpValue::U32(tariff.delta(TariffSlot::LastMonth)),
                            );
                        }
                    }
                }
                DateChange::Year => {
                    if tariff.last_year != index {
                        tariff.year_m2 = tariff.last_year;
                        tariff.last_year = index;
                        if tariff.year_m2 != 0 {
                            bus.publish(
                                DatapointId::Tariff(bucket, TariffSlot::LastYear),
                                DpValue::U32(tariff.delta(TariffSlot::LastYear)),
                            );
                        }
                    }
                }
                DateChange::Init => {}
            }
        }
    }

    /// Check the restored record against the first known real date
    ///
    /// An unknown power outage length bounds how much of the restored
    /// history is still meaningful: a different year voids everything, a
    /// different month the month and day baselines, a different day the
    /// day ones.
    pub fn reconcile(&mut self, current: DateTime) {
        if self.last_save.day == 0 {
            return;
        }
        if self.last_save.year != current.year {
            self.clear();
        } else if self.last_save.month != current.month {
            for tariff in &mut self.tariff {
                tariff.last_month = 0;
                tariff.month_m2 = 0;
                tariff.yesterday = 0;
                tariff.day_m2 = 0;
            }
        } else if self.last_save.day != current.day {
            for tariff in &mut self.tariff {
                tariff.yesterday = 0;
                tariff.day_m2 = 0;
            }
        }
    }

    /// Override a stored baseline from the bus (out of band correction)
    ///
    /// Writing a tariff datapoint replaces the baseline behind it with the
    /// given absolute index. A value matching the current delta or the
    /// stored baseline is a no-op. The matching period pair is
    /// retransmitted and a debounced save is scheduled, coalescing bursts
    /// of corrections into a single flash write.
    pub fn set_override(
        &mut self,
        bucket: TariffBucket,
        slot: TariffSlot,
        value: u32,
        bus: &mut dyn FieldBus,
        now: u64,
    ) {
        let tariff = &mut self.tariff[bucket as usize];
        let (reference, destination) = match slot {
            TariffSlot::Today => (tariff.index, tariff.yesterday),
            TariffSlot::Yesterday => (tariff.yesterday, tariff.day_m2),
            TariffSlot::ThisMonth => (tariff.index, tariff.last_month),
            TariffSlot::LastMonth => (tariff.last_month, tariff.month_m2),
            TariffSlot::ThisYear => (tariff.index, tariff.last_year),
            TariffSlot::LastYear => (tariff.last_year, tariff.year_m2),
        };
        if reference.wrapping_sub(destination) == value || value == destination {
            return;
        }
        match slot {
            TariffSlot::Today => tariff.yesterday = value,
            TariffSlot::Yesterday => tariff.day_m2 = value,
            TariffSlot::ThisMonth => tariff.last_month = value,
            TariffSlot::LastMonth => tariff.month_m2 = value,
            TariffSlot::ThisYear => tariff.last_year = value,
            TariffSlot::LastYear => tariff.year_m2 = value,
        }
        self.resync_datapoints(bus);

        let tariff = &self.tariff[bucket as usize];
        match slot {
            TariffSlot::Today | TariffSlot::Yesterday => {
                if tariff.index != 0 && tariff.yesterday != 0 {
                    bus.publish(
                        DatapointId::Tariff(bucket, TariffSlot::Today),
                        DpValue::U32(tariff.delta(TariffSlot::Today)),
                    );
                }
                if tariff.yesterday != 0 && tariff.day_m2 != 0 {
                    bus.publish(
                        DatapointId::Tariff(bucket, TariffSlot::Yesterday),
                        DpValue::U32(tariff.delta(TariffSlot::Yesterday)),
                    );
                }
            }
            TariffSlot::ThisMonth | TariffSlot::LastMonth => {
                if tariff.index != 0 && tariff.last_month != 0 {
                    bus.publish(
                        DatapointId::Tariff(bucket, TariffSlot::ThisMonth),
                        DpValue::U32(tariff.delta(TariffSlot::ThisMonth)),
                    );
                }
                if tariff.last_month != 0 && tariff.month_m2 != 0 {
                    bus.publish(
                        DatapointId::Tariff(bucket, TariffSlot::LastMonth),
                        DpValue::U32(tariff.delta(TariffSlot::LastMonth)),
                    );
                }
            }
            TariffSlot::ThisYear | TariffSlot::LastYear => {
                if tariff.index != 0 && tariff.last_year != 0 {
                    bus.publish(
                        DatapointId::Tariff(bucket, TariffSlot::ThisYear),
                        DpValue::U32(tariff.delta(TariffSlot::ThisYear)),
                    );
                }
                if tariff.last_year != 0 && tariff.year_m2 != 0 {
                    bus.publish(
                        DatapointId::Tariff(bucket, TariffSlot::LastYear),
                        DpValue::U32(tariff.delta(TariffSlot::LastYear)),
                    );
                }
            }
        }
        self.manual_override = Some(now);
    }

    /// Debounced save trigger pending from a manual override
    pub fn manual_save_due(&mut self, now: u64) -> bool {
        match self.manual_override {
            Some(at) if now.saturating_sub(at) > MANUAL_SAVE_DELAY_MS => {
                self.manual_override = None;
                true
            }
            _ => false,
        }
    }

    /// Mirror every tariff datapoint from the stored baselines
    pub fn resync_datapoints(&self, bus: &mut dyn FieldBus) {
        for bucket in TariffBucket::ALL {
            let tariff = &self.tariff[bucket as usize];
            for slot in TariffSlot::ALL {
                bus.update(
                    DatapointId::Tariff(bucket, slot),
                    DpValue::U32(tariff.delta(slot)),
                );
            }
        }
    }

    /// Wipe the record back to the fully unset state
    pub fn clear(&mut self) {
        self.last_save = DateTime::default();
        self.tariff = [BucketHistory::default(); TariffBucket::COUNT];
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        self.last_save.encode(out);
        for tariff in &self.tariff {
            for word in [
                tariff.index,
                tariff.yesterday,
                tariff.last_month,
                tariff.last_year,
                tariff.day_m2,
                tariff.month_m2,
                tariff.year_m2,
            ] {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
    }

    pub(crate) fn decode(raw: &[u8]) -> TariffHistory {
        let word = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&raw[at..at + 4]);
            u32::from_le_bytes(bytes)
        };
        let mut history = TariffHistory {
            last_save: DateTime::decode(&raw[0..12]),
            ..Default::default()
        };
        let mut at = 12;
        for tariff in &mut history.tariff {
            tariff.index = word(at);
            tariff.yesterday = word(at + 4);
            tariff.last_month = word(at + 8);
            tariff.last_year = word(at + 12);
            tariff.day_m2 = word(at + 16);
            tariff.month_m2 = word(at + 20);
            tariff.year_m2 = word(at + 24);
            at += 28;
        }
        history
    }

    /// Restore the record from storage
    ///
    /// Erased flash patterns (all 0xFF or all 0x00) and a mismatching
    /// trailing checksum are handled the same way: start from scratch.
    pub fn restore(&mut self, storage: &mut dyn NvStorage) {
        let mut raw = [0u8; RECORD_LEN];
        let mut and_mask = 0xFFu8;
        let mut or_mask = 0x00u8;
        let mut checksum = 0u8;
        for (at, byte) in raw.iter_mut().enumerate() {
            let value = storage.read(HISTORY_BASE + at);
            *byte = value;
            and_mask &= value;
            or_mask |= value;
            checksum ^= value;
        }
        if and_mask == 0xFF || or_mask == 0x00 || checksum != storage.read(HISTORY_BASE + RECORD_LEN)
        {
            if and_mask != 0xFF && or_mask != 0x00 {
                warn!("corrupted tariff history record, starting from scratch");
            }
            self.clear();
        } else {
            *self = TariffHistory::decode(&raw);
        }
    }

    /// Persist the record under `stamp`
    ///
    /// Skipped entirely while nothing has ever been published (no data,
    /// nothing to persist); the durable commit only happens when the
    /// trailing checksum actually changed.
    pub fn save(&mut self, storage: &mut dyn NvStorage, stamp: DateTime, published: bool) {
        if !published {
            return;
        }
        self.last_save = stamp;
        let mut raw = Vec::with_capacity(RECORD_LEN);
        self.encode(&mut raw);
        let mut checksum = 0u8;
        for (at, &byte) in raw.iter().enumerate() {
            storage.write(HISTORY_BASE + at, byte);
            checksum ^= byte;
        }
        if checksum != storage.read(HISTORY_BASE + RECORD_LEN) {
            storage.write(HISTORY_BASE + RECORD_LEN, checksum);
            storage.commit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TariffSlot;
    use crate::storage::MemStorage;
    use crate::testutil::{frame_line, RecordingBus, ScriptedSerial};

    fn telemetry(lines: &[&str]) -> Teleinfo {
        let mut tele = Teleinfo::new();
        let mut serial = ScriptedSerial::default();
        for body in lines {
            serial.feed(&frame_line(body));
        }
        tele.pump(&mut serial, &mut RecordingBus::default(), 1_000);
        tele
    }

    fn stamp(year: u16, month: u16, day: u16) -> DateTime {
        DateTime {
            sec: 0,
            min: 0,
            hour: 12,
            day,
            month,
            year,
        }
    }

    #[test]
    fn two_rate_plan_indexes() {
        let tele = telemetry(&["OPTARIF HC..", "HCHC 000000100", "HCHP 000000050"]);
        let index = current_indexes(&tele);
        assert_eq!(150, index[TariffBucket::Base as usize]);
        assert_eq!(100, index[TariffBucket::HC as usize]);
        assert_eq!(50, index[TariffBucket::HP as usize]);
    }

    #[test]
    fn base_plan_indexes() {
        let tele = telemetry(&["OPTARIF BASE", "BASE 000002809"]);
        let index = current_indexes(&tele);
        assert_eq!([2809, 0, 0], index);
    }

    #[test]
    fn ejp_plan_indexes() {
        let tele = telemetry(&["OPTARIF EJP.", "EJPHN 000000300", "EJPHPM 000000070"]);
        let index = current_indexes(&tele);
        assert_eq!([370, 300, 70], index);
    }

    #[test]
    fn tempo_and_unknown_plans_sum_the_colors() {
        let colors = [
            "BBRHCJB 000000010",
            "BBRHPJB 000000020",
            "BBRHCJW 000000001",
            "BBRHPJW 000000002",
            "BBRHCJR 000000100",
            "BBRHPJR 000000200",
        ];
        let mut lines = vec!["OPTARIF BBR("];
        lines.extend_from_slice(&colors);
        let index = current_indexes(&telemetry(&lines));
        assert_eq!([333, 111, 222], index);

        let mut lines = vec!["OPTARIF XXX."];
        lines.extend_from_slice(&colors);
        assert_eq!(index, current_indexes(&telemetry(&lines)));
    }

    #[test]
    fn first_seen_index_becomes_its_own_baseline() {
        let mut history = TariffHistory::default();
        let mut bus = RecordingBus::default();
        history.refresh([150, 100, 50], true, &mut bus);
        assert_eq!(150, history.bucket(TariffBucket::Base).yesterday);
        assert_eq!(
            Some(&DpValue::U32(0)),
            bus.last_update(DatapointId::Tariff(TariffBucket::Base, TariffSlot::Today))
        );

        history.refresh([180, 120, 60], true, &mut bus);
        assert_eq!(150, history.bucket(TariffBucket::Base).yesterday);
        assert_eq!(
            Some(&DpValue::U32(30)),
            bus.last_update(DatapointId::Tariff(TariffBucket::Base, TariffSlot::Today))
        );
    }

    #[test]
    fn zero_index_is_treated_as_unset() {
        // A true meter index of 0 cannot be told apart from "no data yet"
        let mut history = TariffHistory::default();
        let mut bus = RecordingBus::default();
        history.refresh([0, 0, 0], true, &mut bus);
        assert_eq!(0, history.bucket(TariffBucket::Base).yesterday);
        assert!(bus.updates.is_empty());
    }

    #[test]
    fn index_below_baseline_leaves_it_untouched() {
        let mut history = TariffHistory::default();
        let mut bus = RecordingBus::default();
        history.refresh([150, 0, 0], true, &mut bus);
        bus.updates.clear();
        history.refresh([120, 0, 0], true, &mut bus);
        assert_eq!(150, history.bucket(TariffBucket::Base).yesterday);
        assert!(bus
            .last_update(DatapointId::Tariff(TariffBucket::Base, TariffSlot::Today))
            .is_none());
    }

    #[test]
    fn invalid_clock_blocks_baselines() {
        let mut history = TariffHistory::default();
        let mut bus = RecordingBus::default();
        history.refresh([150, 0, 0], false, &mut bus);
        assert_eq!(150, history.bucket(TariffBucket::Base).index);
        assert_eq!(0, history.bucket(TariffBucket::Base).yesterday);
    }

    #[test]
    fn day_rollover_shifts_and_publishes() {
        let mut history = TariffHistory::default();
        let mut bus = RecordingBus::default();
        history.refresh([100, 0, 0], true, &mut bus);
        history.refresh([130, 0, 0], true, &mut bus);

        assert!(!history.rollover(DateChange::Day, &mut bus));
        let base = history.bucket(TariffBucket::Base);
        assert_eq!(100, base.day_m2);
        assert_eq!(130, base.yesterday);
        assert_eq!(
            Some(&DpValue::U32(30)),
            bus.last_published(DatapointId::Tariff(TariffBucket::Base, TariffSlot::Yesterday))
        );
    }

    #[test]
    fn day_rollover_is_idempotent() {
        let mut history = TariffHistory::default();
        let mut bus = RecordingBus::default();
        history.refresh([100, 0, 0], true, &mut bus);
        history.refresh([130, 0, 0], true, &mut bus);
        history.rollover(DateChange::Day, &mut bus);
        let before = *history.bucket(TariffBucket::Base);

        // Same event again without any index change: nothing may rotate
        history.rollover(DateChange::Day, &mut bus);
        assert_eq!(before, *history.bucket(TariffBucket::Base));
    }

    #[test]
    fn year_rollover_cascades_and_requests_a_save() {
        let mut history = TariffHistory::default();
        let mut bus = RecordingBus::default();
        history.refresh([100, 0, 0], true, &mut bus);
        history.refresh([130, 0, 0], true, &mut bus);

        assert!(history.rollover(DateChange::Year, &mut bus));
        let base = history.bucket(TariffBucket::Base);
        assert_eq!(130, base.last_year);
        assert_eq!(130, base.last_month);
        assert_eq!(130, base.yesterday);
        assert_eq!(100, base.year_m2);
        assert_eq!(100, base.month_m2);
        assert_eq!(100, base.day_m2);

        // A plain month rollover also saves, a day one does not
        assert!(history.rollover(DateChange::Month, &mut bus));
        assert!(!history.rollover(DateChange::Day, &mut bus));
    }

    #[test]
    fn reconcile_tiers() {
        let mut seeded = TariffHistory::default();
        let mut bus = RecordingBus::default();
        seeded.refresh([100, 0, 0], true, &mut bus);
        seeded.refresh([130, 0, 0], true, &mut bus);
        seeded.rollover(DateChange::Year, &mut bus);
        seeded.last_save = stamp(2024, 5, 15);

        // Same date: everything kept
        let mut history = seeded.clone();
        history.reconcile(stamp(2024, 5, 15));
        assert_eq!(seeded.tariff, history.tariff);

        // Same month, other day: day baselines dropped
        let mut history = seeded.clone();
        history.reconcile(stamp(2024, 5, 17));
        let base = history.bucket(TariffBucket::Base);
        assert_eq!((0, 0), (base.yesterday, base.day_m2));
        assert_eq!(130, base.last_month);
        assert_eq!(130, base.last_year);

        // Same year, other month: month and day baselines dropped
        let mut history = seeded.clone();
        history.reconcile(stamp(2024, 7, 15));
        let base = history.bucket(TariffBucket::Base);
        assert_eq!((0, 0, 0, 0), (base.yesterday, base.day_m2, base.last_month, base.month_m2));
        assert_eq!(130, base.last_year);

        // Other year: everything dropped
        let mut history = seeded.clone();
        history.reconcile(stamp(2025, 5, 15));
        assert_eq!(BucketHistory::default(), *history.bucket(TariffBucket::Base));

        // Nothing restored: nothing to check
        let mut history = TariffHistory::default();
        history.reconcile(stamp(2025, 5, 15));
        assert_eq!(TariffHistory::default(), history);
    }

    #[test]
    fn persistence_round_trip() {
        let mut history = TariffHistory::default();
        let mut bus = RecordingBus::default();
        history.refresh([150, 100, 50], true, &mut bus);
        history.refresh([180, 120, 60], true, &mut bus);
        history.rollover(DateChange::Day, &mut bus);

        let mut storage = MemStorage::new(STORAGE_LEN);
        history.save(&mut storage, stamp(2024, 5, 15), true);

        let mut restored = TariffHistory::default();
        restored.restore(&mut storage);
        assert_eq!(history.tariff, restored.tariff);
        assert_eq!(stamp(2024, 5, 15), restored.last_save());
    }

    #[test]
    fn corrupted_record_restores_as_unset() {
        let mut history = TariffHistory::default();
        let mut bus = RecordingBus::default();
        history.refresh([150, 100, 50], true, &mut bus);
        let mut storage = MemStorage::new(STORAGE_LEN);
        history.save(&mut storage, stamp(2024, 5, 15), true);

        let flipped = storage.read(20) ^ 0x01;
        storage.write(20, flipped);
        let mut restored = TariffHistory::default();
        restored.restore(&mut storage);
        assert_eq!(TariffHistory::default(), restored);
    }

    #[test]
    fn erased_storage_restores_as_unset() {
        let mut restored = TariffHistory::default();
        restored.restore(&mut MemStorage::new(STORAGE_LEN));
        assert_eq!(TariffHistory::default(), restored);

        let mut zeroed = MemStorage::new(STORAGE_LEN);
        for at in 0..STORAGE_LEN {
            zeroed.write(at, 0x00);
        }
        restored.restore(&mut zeroed);
        assert_eq!(TariffHistory::default(), restored);
    }

    #[test]
    fn nothing_published_nothing_saved() {
        let mut history = TariffHistory::default();
        let mut storage = MemStorage::new(STORAGE_LEN);
        history.save(&mut storage, stamp(2024, 5, 15), false);
        assert_eq!(0xFF, storage.read(0));
    }

    #[test]
    fn manual_override_debounces_the_save() {
        let mut history = TariffHistory::default();
        let mut bus = RecordingBus::default();
        history.refresh([150, 0, 0], true, &mut bus);
        history.refresh([180, 0, 0], true, &mut bus);

        history.set_override(TariffBucket::Base, TariffSlot::Today, 120, &mut bus, 10_000);
        assert_eq!(120, history.bucket(TariffBucket::Base).yesterday);
        assert_eq!(
            Some(&DpValue::U32(60)),
            bus.last_published(DatapointId::Tariff(TariffBucket::Base, TariffSlot::Today))
        );

        assert!(!history.manual_save_due(10_000 + 60_000));
        assert!(history.manual_save_due(10_000 + 60 * 60 * 1000 + 1));
        assert!(!history.manual_save_due(24 * 60 * 60 * 1000));
    }

    #[test]
    fn matching_override_is_a_no_op() {
        let mut history = TariffHistory::default();
        let mut bus = RecordingBus::default();
        history.refresh([150, 0, 0], true, &mut bus);
        history.refresh([180, 0, 0], true, &mut bus);
        bus.published.clear();

        // 30 is exactly the current today delta: nothing to correct
        history.set_override(TariffBucket::Base, TariffSlot::Today, 30, &mut bus, 10_000);
        assert_eq!(150, history.bucket(TariffBucket::Base).yesterday);
        assert!(bus.published.is_empty());
        assert!(!history.manual_save_due(10_000 + 2 * 60 * 60 * 1000));
    }
}
