//! Assembly of the bridge engines behind one cooperative tick
use std::time::Instant;

use teleinfo_knx_macros::fourcc;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, interval_at, Duration},
};
use tracing::warn;

use crate::bus::{BusUpdate, DatapointId, DpValue, FieldBus};
use crate::clock::{BusClock, DateChange};
use crate::history::{current_indexes, BucketHistory, TariffBucket, TariffHistory};
use crate::scheduler::Publisher;
use crate::storage::NvStorage;
use crate::teleinfo::{FieldId, OpTarif, RateColor, RatePeriod, SerialSource, Teleinfo};
use crate::BridgeEvent;

/// Externally supplied periods, zero disabling the matching feature
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BridgeParams {
    /// Clock resync request period, in minutes
    pub clock_resync_min: u32,
    /// Minimum telemetry publish period, in seconds
    pub publish_period_s: u32,
    /// Real time mode auto expiry, in minutes
    pub realtime_timeout_min: u32,
}

impl Default for BridgeParams {
    fn default() -> Self {
        BridgeParams {
            clock_resync_min: 60,
            publish_period_s: 60,
            realtime_timeout_min: 60,
        }
    }
}

/// Monotonic millisecond counter, carried over warm restarts through the
/// retained image offset
#[derive(Debug)]
struct UptimeMillis {
    origin: Instant,
    offset: u64,
}

impl UptimeMillis {
    fn new(offset: u64) -> UptimeMillis {
        UptimeMillis {
            origin: Instant::now(),
            offset,
        }
    }

    fn now(&self) -> u64 {
        self.offset + self.origin.elapsed().as_millis() as u64
    }
}

/// Sentinel marking a retained image produced by this state layout
const RETAIN_SENTINEL: u32 = fourcc!("TKNX");

/// Retained image length: sentinel, counter offset, clock state, history
/// record and trailing checksum
const RETAINED_LEN: usize =
    4 + 8 + BusClock::ENCODED_LEN + crate::history::RECORD_LEN + 1;

/// Bridge core: parser, clock, history and scheduler behind one tick
///
/// The collaborators are injected once: the serial byte source of the
/// meter, the field bus stack and the persistent byte storage. The host
/// loop then only calls [`Bridge::tick`] and feeds inbound bus traffic
/// through [`Bridge::on_bus_update`].
pub struct Bridge<U, B, S> {
    serial: U,
    bus: B,
    storage: S,
    millis: UptimeMillis,
    clock: BusClock,
    tele: Teleinfo,
    history: TariffHistory,
    publisher: Publisher,
}

impl<U: SerialSource, B: FieldBus, S: NvStorage> Bridge<U, B, S> {
    /// Cold boot: restore the history from storage, start unsynchronized
    pub fn cold_start(params: BridgeParams, serial: U, bus: B, storage: S) -> Bridge<U, B, S> {
        Self::start(params, serial, bus, storage, None)
    }

    /// Warm restart from a retained image
    ///
    /// Falls back to a cold start when the image sentinel or checksum does
    /// not match (real cold boot, or a layout change).
    pub fn resume(
        params: BridgeParams,
        image: &[u8],
        serial: U,
        bus: B,
        storage: S,
    ) -> Bridge<U, B, S> {
        Self::start(params, serial, bus, storage, check_retained(image))
    }

    fn start(
        params: BridgeParams,
        serial: U,
        bus: B,
        storage: S,
        retained: Option<&[u8]>,
    ) -> Bridge<U, B, S> {
        let mut clock = BusClock::new(params.clock_resync_min);
        let mut history = TariffHistory::default();
        let offset = match retained {
            Some(image) => {
                let mut at = 4;
                let offset = read_u64(image, at);
                at += 8;
                clock.restore(&image[at..at + BusClock::ENCODED_LEN]);
                at += BusClock::ENCODED_LEN;
                history = TariffHistory::decode(&image[at..at + crate::history::RECORD_LEN]);
                offset
            }
            None => 0,
        };
        let mut bridge = Bridge {
            serial,
            bus,
            storage,
            millis: UptimeMillis::new(offset),
            clock,
            tele: Teleinfo::new(),
            history,
            publisher: Publisher::new(params.publish_period_s, params.realtime_timeout_min),
        };
        if retained.is_none() {
            bridge.history.restore(&mut bridge.storage);
        }

        // Push the initial mirrors so the bus answers reads right away
        bridge
            .bus
            .update(DatapointId::RealTimeOnOffState, DpValue::Bool(false));
        bridge.history.resync_datapoints(&mut bridge.bus);
        for id in FieldId::ALL {
            bridge.bus.update(DatapointId::Field(id), bridge.tele.value(id));
        }
        if bridge.clock.is_valid() {
            bridge.bus.update(
                DatapointId::DateTimeStatus,
                DpValue::Stamp(bridge.clock.status_stamp()),
            );
        }
        bridge
    }

    /// Serialize the reset surviving state; the host owns where it lives
    pub fn retained(&self) -> Vec<u8> {
        let mut image = Vec::with_capacity(RETAINED_LEN);
        image.extend_from_slice(&RETAIN_SENTINEL.to_le_bytes());
        image.extend_from_slice(&self.millis.now().to_le_bytes());
        self.clock.encode(&mut image);
        self.history.encode(&mut image);
        let mut checksum = 0u8;
        for &byte in &image {
            checksum ^= byte;
        }
        image.push(checksum);
        image
    }

    /// Feed an inbound bus event (datapoint write received from the bus)
    pub fn on_bus_update(&mut self, update: BusUpdate) {
        let now = self.millis.now();
        let init = match update {
            BusUpdate::Date { year, month, day } => self.clock.set_date(now, year, month, day),
            BusUpdate::Time { hour, min, sec } => self.clock.set_time(now, hour, min, sec),
            BusUpdate::DateTime {
                year,
                month,
                day,
                hour,
                min,
                sec,
            } => self
                .clock
                .set_date_time(now, year, month, day, hour, min, sec),
            BusUpdate::RealTimeMode(on) => {
                self.publisher.set_realtime(on, now);
                None
            }
            BusUpdate::TariffOverride {
                bucket,
                slot,
                value,
            } => {
                self.history
                    .set_override(bucket, slot, value, &mut self.bus, now);
                None
            }
        };
        if init == Some(DateChange::Init) {
            // First calibration: the restored baselines meet the real date
            let current = self.clock.current(now);
            self.history.reconcile(current);
        }
    }

    /// One cooperative pass: pump the serial stream, run the scheduler,
    /// maintain the clock. Returns a crossed calendar boundary, if any.
    pub fn tick(&mut self) -> Option<DateChange> {
        let now = self.millis.now();

        if self.history.manual_save_due(now) {
            let stamp = self.clock.current(now);
            let published = self.publisher.history_published();
            self.history.save(&mut self.storage, stamp, published);
        }

        self.tele.pump(&mut self.serial, &mut self.bus, now);

        self.publisher.tick(now, &mut self.tele, &mut self.bus);

        // The tariff engine runs once the tariff option has been observed
        if self.tele.slot(FieldId::Optarif).last_change.is_some() {
            let indexes = current_indexes(&self.tele);
            self.history
                .refresh(indexes, self.clock.is_valid(), &mut self.bus);
            self.publisher.publish_history(
                now,
                indexes,
                &self.history,
                self.clock.is_valid(),
                &mut self.bus,
            );
        }

        let outcome = self.clock.tick(now);
        if outcome.resync_request {
            self.bus.request_read(DatapointId::Date);
            self.bus.request_read(DatapointId::Time);
            self.bus.request_read(DatapointId::DateTime);
        }
        if let Some(status) = outcome.status {
            self.bus
                .update(DatapointId::DateTimeStatus, DpValue::Stamp(status));
        }
        if let Some(change) = outcome.rollover {
            if self.history.rollover(change, &mut self.bus) {
                let stamp = self.clock.current(now);
                let published = self.publisher.history_published();
                self.history.save(&mut self.storage, stamp, published);
            }
        }
        outcome.rollover
    }

    /// Wipe the tariff history (wired to a long prog button press)
    pub fn reset_history(&mut self) {
        let now = self.millis.now();
        self.history.clear();
        let stamp = self.clock.current(now);
        let published = self.publisher.history_published();
        self.history.save(&mut self.storage, stamp, published);
        self.history.resync_datapoints(&mut self.bus);
    }

    /// Local time a valid line was last received (activity LED hook)
    pub fn last_reception(&self) -> Option<u64> {
        self.tele.last_reception()
    }

    /// Decoded tariff option
    pub fn tarif_option(&self) -> OpTarif {
        self.tele.tarif_option()
    }

    /// Decoded current rate period
    pub fn rate_period(&self) -> RatePeriod {
        self.tele.rate_period()
    }

    /// Decoded color of tomorrow
    pub fn tomorrow_color(&self) -> RateColor {
        self.tele.tomorrow_color()
    }

    /// Current cumulative index of each tariff bucket
    pub fn current_indexes(&self) -> [u32; TariffBucket::COUNT] {
        current_indexes(&self.tele)
    }

    /// Baselines of one tariff bucket
    pub fn bucket(&self, bucket: TariffBucket) -> &BucketHistory {
        self.history.bucket(bucket)
    }

    /// Slot of one telemetry field
    pub fn slot(&self, id: FieldId) -> &crate::teleinfo::FieldSlot {
        self.tele.slot(id)
    }

    /// Method to get a task polling the bridge
    ///
    /// The tick keeps running at `tick_period`; a tariff index measure is
    /// sent every `measure_period` and rate period changes, color advices
    /// and calendar rollovers are notified as they happen.
    pub async fn into_task(
        mut self,
        event_queue: mpsc::Sender<BridgeEvent>,
        tick_period: Duration,
        measure_period: Duration,
    ) -> JoinHandle<()>
    where
        U: Send + 'static,
        B: Send + 'static,
        S: Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticks = interval(tick_period);
            let mut measures =
                interval_at(tokio::time::Instant::now() + measure_period, measure_period);
            let mut period_rate = self.rate_period();
            let mut tomorrow_advice = self.tomorrow_color();
            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        if let Some(change) = self.tick() {
                            if event_queue.send(BridgeEvent::DateRollover(change)).await.is_err() {
                                break;
                            }
                        }
                        if self.rate_period() != period_rate {
                            period_rate = self.rate_period();
                            if event_queue.send(BridgeEvent::PriceRatePeriodChange(period_rate)).await.is_err() {
                                break;
                            }
                        }
                        if self.tomorrow_color() != tomorrow_advice {
                            tomorrow_advice = self.tomorrow_color();
                            if event_queue.send(BridgeEvent::ColorAdvice(tomorrow_advice)).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ = measures.tick() => {
                        if event_queue.send(BridgeEvent::TariffMeasure(self.current_indexes())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Validate a retained image, returning it when usable
fn check_retained(image: &[u8]) -> Option<&[u8]> {
    if image.len() != RETAINED_LEN {
        return None;
    }
    let sentinel = u32::from_le_bytes([image[0], image[1], image[2], image[3]]);
    if sentinel != RETAIN_SENTINEL {
        return None;
    }
    let mut checksum = 0u8;
    for &byte in &image[..RETAINED_LEN - 1] {
        checksum ^= byte;
    }
    if checksum != image[RETAINED_LEN - 1] {
        warn!("retained state checksum mismatch, cold start");
        return None;
    }
    Some(image)
}

fn read_u64(raw: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(word)
}
