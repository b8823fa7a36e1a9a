//! Field bus collaborator surface of the bridge
use crate::clock::DateTime;
use crate::history::TariffBucket;
use crate::teleinfo::FieldId;

/// KNX datapoint type identifier (main group / sub group)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Dpt {
    /// Main group of the datapoint type
    pub main: u16,
    /// Sub group of the datapoint type
    pub sub: u16,
}

impl Dpt {
    /// On/Off switch
    pub const SWITCH: Dpt = Dpt::new(1, 1);
    /// One ASCII character
    pub const CHAR_ASCII: Dpt = Dpt::new(4, 1);
    /// 8 bit unsigned counter
    pub const VALUE_1_UCOUNT: Dpt = Dpt::new(5, 10);
    /// Time period in minutes
    pub const TIME_PERIOD_MIN: Dpt = Dpt::new(7, 6);
    /// Electric current (A)
    pub const ELECTRIC_CURRENT: Dpt = Dpt::new(7, 12);
    /// 16 bit counter
    pub const VALUE_2_COUNT: Dpt = Dpt::new(8, 1);
    /// Power (W)
    pub const VALUE_POWER: Dpt = Dpt::new(9, 24);
    /// Time of day
    pub const TIME_OF_DAY: Dpt = Dpt::new(10, 1);
    /// Date
    pub const DATE: Dpt = Dpt::new(11, 1);
    /// Active energy (Wh)
    pub const ACTIVE_ENERGY: Dpt = Dpt::new(13, 10);
    /// ASCII string
    pub const STRING_ASCII: Dpt = Dpt::new(16, 0);
    /// Combined date and time
    pub const DATE_TIME: Dpt = Dpt::new(19, 1);

    /// Build a datapoint type identifier
    pub const fn new(main: u16, sub: u16) -> Dpt {
        Dpt { main, sub }
    }
}

/// Reported period of a tariff bucket datapoint
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TariffSlot {
    /// Consumption since the start of the day
    Today,
    /// Consumption of the previous day
    Yesterday,
    /// Consumption since the start of the month
    ThisMonth,
    /// Consumption of the previous month
    LastMonth,
    /// Consumption since the start of the year
    ThisYear,
    /// Consumption of the previous year
    LastYear,
}

impl TariffSlot {
    /// All reported periods
    pub const ALL: [TariffSlot; 6] = [
        TariffSlot::Today,
        TariffSlot::Yesterday,
        TariffSlot::ThisMonth,
        TariffSlot::LastMonth,
        TariffSlot::ThisYear,
        TariffSlot::LastYear,
    ];
}

/// Address of a datapoint exposed or consumed by the bridge
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DatapointId {
    /// Date received from the bus
    Date,
    /// Time of day received from the bus
    Time,
    /// Combined date and time received from the bus
    DateTime,
    /// Status mirror of the internal clock
    DateTimeStatus,
    /// Real time mode switch received from the bus
    RealTimeOnOff,
    /// State mirror of the real time mode
    RealTimeOnOffState,
    /// One period of one tariff bucket history
    Tariff(TariffBucket, TariffSlot),
    /// One decoded telemetry field
    Field(FieldId),
}

impl DatapointId {
    /// Datapoint type to bind on the bus stack
    pub fn dpt(&self) -> Dpt {
        match self {
            DatapointId::Date => Dpt::DATE,
            DatapointId::Time => Dpt::TIME_OF_DAY,
            DatapointId::DateTime | DatapointId::DateTimeStatus => Dpt::DATE_TIME,
            DatapointId::RealTimeOnOff | DatapointId::RealTimeOnOffState => Dpt::SWITCH,
            DatapointId::Tariff(_, _) => Dpt::ACTIVE_ENERGY,
            DatapointId::Field(id) => id.config().dpt,
        }
    }

    /// Every datapoint of the bridge, for bind time registration
    pub fn all() -> impl Iterator<Item = DatapointId> {
        [
            DatapointId::Date,
            DatapointId::Time,
            DatapointId::DateTime,
            DatapointId::DateTimeStatus,
            DatapointId::RealTimeOnOff,
            DatapointId::RealTimeOnOffState,
        ]
        .into_iter()
        .chain(TariffBucket::ALL.into_iter().flat_map(|bucket| {
            TariffSlot::ALL
                .into_iter()
                .map(move |slot| DatapointId::Tariff(bucket, slot))
        }))
        .chain(FieldId::ALL.into_iter().map(DatapointId::Field))
    }
}

/// Value carried by a datapoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DpValue {
    /// Switch state
    Bool(bool),
    /// Small enumeration code
    U8(u8),
    /// Counter or energy index
    U32(u32),
    /// Bounded ASCII text
    Text(String),
    /// Calendar stamp (month 1 based on the bus)
    Stamp(DateTime),
}

/// Outbound access to the field bus stack
///
/// The stack is expected to hold one addressable object per
/// [`DatapointId`]; [`FieldBus::update`] refreshes its value without
/// traffic while [`FieldBus::publish`] also transmits it.
pub trait FieldBus {
    /// Set the value of a datapoint without transmitting it
    fn update(&mut self, id: DatapointId, value: DpValue);
    /// Set the value of a datapoint and transmit it on the bus
    fn publish(&mut self, id: DatapointId, value: DpValue);
    /// Ask the bus for a remote read of a datapoint
    fn request_read(&mut self, id: DatapointId);
}

/// Inbound datapoint write received from the bus
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusUpdate {
    /// Date broadcast (month 1 based)
    Date {
        /// Absolute year
        year: u16,
        /// Month [1-12]
        month: u16,
        /// Day of month [1-31]
        day: u16,
    },
    /// Time of day broadcast
    Time {
        /// Hours [0-23]
        hour: u16,
        /// Minutes [0-59]
        min: u16,
        /// Seconds [0-59]
        sec: u16,
    },
    /// Combined date and time broadcast (month 1 based)
    DateTime {
        /// Absolute year
        year: u16,
        /// Month [1-12]
        month: u16,
        /// Day of month [1-31]
        day: u16,
        /// Hours [0-23]
        hour: u16,
        /// Minutes [0-59]
        min: u16,
        /// Seconds [0-59]
        sec: u16,
    },
    /// Real time mode switch
    RealTimeMode(bool),
    /// Out of band correction of a stored history baseline
    TariffOverride {
        /// Corrected bucket
        bucket: TariffBucket,
        /// Corrected period
        slot: TariffSlot,
        /// New absolute meter index of the backing baseline (Wh)
        value: u32,
    },
}
