//! Publication scheduler deciding what is pushed on the bus each tick
use crate::bus::{DatapointId, DpValue, FieldBus, TariffSlot};
use crate::history::{TariffBucket, TariffHistory};
use crate::teleinfo::{FieldId, Teleinfo};

/// Forced repeat period of an active overrun alarm
const ADPS_REPEAT_MS: u64 = 10 * 1000;

/// Publication state driving the bus traffic
///
/// A field goes out when its decoded value changed since the last send and
/// either the real time mode is active or its minimum publish period has
/// elapsed; a cheap value checksum filters out changes that cancelled each
/// other in between.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Publisher {
    period_ms: u64,
    realtime_timeout_ms: u64,
    realtime_since: Option<u64>,
    realtime_state: bool,
    history_last_sent: Option<u64>,
    history_last_value: [u32; TariffBucket::COUNT],
}

impl Publisher {
    /// Publication state from the collaborator supplied periods
    /// (0 disables the matching throttle or timeout)
    pub(crate) fn new(period_s: u32, realtime_timeout_min: u32) -> Publisher {
        Publisher {
            period_ms: period_s as u64 * 1000,
            realtime_timeout_ms: realtime_timeout_min as u64 * 60 * 1000,
            ..Default::default()
        }
    }

    /// Real time switch received from the bus
    pub(crate) fn set_realtime(&mut self, on: bool, now: u64) {
        self.realtime_since = on.then_some(now);
    }

    /// Whether the real time mode is currently active
    pub fn realtime_active(&self) -> bool {
        self.realtime_state
    }

    /// Whether any tariff index was ever published (persistence guard)
    pub(crate) fn history_published(&self) -> bool {
        self.history_last_value[TariffBucket::Base as usize] != 0
    }

    fn period_elapsed(&self, since: Option<u64>, now: u64) -> bool {
        since.map_or(true, |at| now.saturating_sub(at) > self.period_ms)
    }

    /// Re-derive the real time mode, mirroring transitions on the bus
    fn derive_realtime(&mut self, now: u64, bus: &mut dyn FieldBus) -> bool {
        let active = matches!(
            self.realtime_since,
            Some(at) if self.realtime_timeout_ms == 0
                || now.saturating_sub(at) < self.realtime_timeout_ms
        );
        if active != self.realtime_state {
            self.realtime_state = active;
            bus.publish(DatapointId::RealTimeOnOffState, DpValue::Bool(active));
        }
        if !active {
            self.realtime_since = None;
        }
        active
    }

    /// One scheduling pass over the alarm and the field slots
    pub(crate) fn tick(&mut self, now: u64, tele: &mut Teleinfo, bus: &mut dyn FieldBus) {
        let realtime = self.derive_realtime(now, bus);
        self.update_overrun(now, tele, bus);
        self.publish_fields(now, realtime, tele, bus);
    }

    /// Recompute and force publish the current overrun alarm
    ///
    /// ADPS = max(0, max(IINST, IINST1-3) - ISOUSC), refreshed whenever
    /// the subscription or the highest instantaneous current changed this
    /// tick. While non zero it is retransmitted at least every
    /// [`ADPS_REPEAT_MS`] even with a stable value: an active overrun must
    /// never silently drop off the bus.
    fn update_overrun(&mut self, now: u64, tele: &mut Teleinfo, bus: &mut dyn FieldBus) {
        let isousc_change = tele.slot(FieldId::Isousc).last_change;
        if isousc_change.is_none() {
            return;
        }
        let subscribed = tele.slot(FieldId::Isousc).num();
        let mut peak = FieldId::Iinst;
        for id in [FieldId::Iinst1, FieldId::Iinst2, FieldId::Iinst3] {
            if tele.slot(id).num() > tele.slot(peak).num() {
                peak = id;
            }
        }
        let peak_change = tele.slot(peak).last_change;
        let peak_value = tele.slot(peak).num();
        if peak_change.is_some() && (peak_change == Some(now) || isousc_change == Some(now)) {
            let overrun = peak_value.saturating_sub(subscribed);
            let adps = tele.slot_mut(FieldId::Adps);
            if adps.num() != overrun {
                adps.set_num(overrun);
                adps.last_change = Some(now);
                bus.update(DatapointId::Field(FieldId::Adps), DpValue::U32(overrun));
            }
        }
        let adps = tele.slot_mut(FieldId::Adps);
        let overrun = adps.num();
        if adps.last_change == Some(now)
            || (overrun > 0 && adps.last_send.map_or(true, |at| now.saturating_sub(at) > ADPS_REPEAT_MS))
        {
            adps.last_sent_checksum = overrun;
            adps.last_send = Some(now);
            bus.publish(DatapointId::Field(FieldId::Adps), DpValue::U32(overrun));
        }
    }

    /// Transmit the changed slots, honoring the period or real time mode
    fn publish_fields(&mut self, now: u64, realtime: bool, tele: &mut Teleinfo, bus: &mut dyn FieldBus) {
        for id in FieldId::ALL {
            let slot = tele.slot(id);
            if slot.last_change == slot.last_send {
                continue;
            }
            if !(realtime || self.period_elapsed(slot.last_send, now)) {
                continue;
            }
            let checksum = slot.send_checksum();
            if checksum == slot.last_sent_checksum {
                continue;
            }
            let value = tele.value(id);
            let slot = tele.slot_mut(id);
            slot.last_sent_checksum = checksum;
            slot.last_send = Some(now);
            bus.publish(DatapointId::Field(id), value);
        }
    }

    /// Transmit the live tariff deltas of the buckets whose index moved
    pub(crate) fn publish_history(
        &mut self,
        now: u64,
        indexes: [u32; TariffBucket::COUNT],
        history: &TariffHistory,
        clock_valid: bool,
        bus: &mut dyn FieldBus,
    ) {
        if !clock_valid || !(self.realtime_state || self.period_elapsed(self.history_last_sent, now)) {
            return;
        }
        for bucket in TariffBucket::ALL {
            let at = bucket as usize;
            if indexes[at] != self.history_last_value[at] {
                let tariff = history.bucket(bucket);
                bus.publish(
                    DatapointId::Tariff(bucket, TariffSlot::Today),
                    DpValue::U32(tariff.delta(TariffSlot::Today)),
                );
                bus.publish(
                    DatapointId::Tariff(bucket, TariffSlot::ThisMonth),
                    DpValue::U32(tariff.delta(TariffSlot::ThisMonth)),
                );
                bus.publish(
                    DatapointId::Tariff(bucket, TariffSlot::ThisYear),
                    DpValue::U32(tariff.delta(TariffSlot::ThisYear)),
                );
                self.history_last_sent = Some(now);
                self.history_last_value[at] = indexes[at];
            }
        }
    }
}
