//! Teleinfo module to handle the meter telemetry stream
use std::{fmt, path::Path, time::Duration};

use bytes::{Buf, BytesMut};
use rppal::uart::{self, Parity, Uart};
use teleinfo_knx_macros::fourcc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::{DatapointId, DpValue, Dpt, FieldBus};

/// Buffer capacity; filling it without a terminator means stream desync
const BUFFER_SIZE: usize = 512;

const OPTARIF_BASE: u32 = fourcc!("BAS");
const OPTARIF_HC: u32 = fourcc!("HC.");
const OPTARIF_EJP: u32 = fourcc!("EJP");
const OPTARIF_BBR: u32 = fourcc!("BBR");

const PTEC_HC: u32 = fourcc!("HC..");
const PTEC_HP: u32 = fourcc!("HP..");
const PTEC_HN: u32 = fourcc!("HN..");
const PTEC_PM: u32 = fourcc!("PM..");
const PTEC_HCJB: u32 = fourcc!("HCJB");
const PTEC_HCJW: u32 = fourcc!("HCJW");
const PTEC_HCJR: u32 = fourcc!("HCJR");
const PTEC_HPJB: u32 = fourcc!("HPJB");
const PTEC_HPJW: u32 = fourcc!("HPJW");
const PTEC_HPJR: u32 = fourcc!("HPJR");

const DEMAIN_BLEU: u32 = fourcc!("BLEU");
const DEMAIN_BLAN: u32 = fourcc!("BLAN");
const DEMAIN_ROUG: u32 = fourcc!("ROUG");

/// List of Tarif options
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpTarif {
    /// Base option
    #[default]
    BASE,
    /// Dig/Full hour option
    HC,
    /// EJP option
    EJP,
    /// Tempo option
    BBRx(u8),
    /// Unrecognized option, metered like the richest plan
    UNKNOWN,
}

impl From<u32> for OpTarif {
    fn from(code: u32) -> Self {
        match code & 0xFFFF_FF00 {
            OPTARIF_BASE => OpTarif::BASE,
            OPTARIF_HC => OpTarif::HC,
            OPTARIF_EJP => OpTarif::EJP,
            OPTARIF_BBR => OpTarif::BBRx((code & 0x3F) as u8),
            _ => OpTarif::UNKNOWN,
        }
    }
}

impl OpTarif {
    /// Code exposed on the bus datapoint
    pub fn code(&self) -> u8 {
        match self {
            OpTarif::BASE | OpTarif::UNKNOWN => 0,
            OpTarif::HC => 1,
            OpTarif::EJP => 2,
            OpTarif::BBRx(program) => *program,
        }
    }
}

impl fmt::Display for OpTarif {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpTarif::BASE => write!(f, "Base"),
            OpTarif::HC => write!(f, "Dig/Full hours"),
            OpTarif::EJP => write!(f, "EJP"),
            OpTarif::BBRx(program) => write!(f, "Tempo (program {})", program),
            OpTarif::UNKNOWN => write!(f, "Unknown"),
        }
    }
}

/// Rate period useful to know the current price
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RatePeriod {
    /// Every hours
    #[default]
    TH,
    /// Dig hours
    HC,
    /// Full hours
    HP,
    /// Standard hours
    HN,
    /// Mobile spike hours
    PM,
    /// Dig hours on blue days
    HCJB,
    /// Dig hours on white days
    HCJW,
    /// Dig hours on red days
    HCJR,
    /// Full hours on blue days
    HPJB,
    /// Full hours on white days
    HPJW,
    /// Full hours on red days
    HPJR,
}

impl From<u32> for RatePeriod {
    fn from(code: u32) -> Self {
        match code {
            PTEC_HC => RatePeriod::HC,
            PTEC_HP => RatePeriod::HP,
            PTEC_HN => RatePeriod::HN,
            PTEC_PM => RatePeriod::PM,
            PTEC_HCJB => RatePeriod::HCJB,
            PTEC_HCJW => RatePeriod::HCJW,
            PTEC_HCJR => RatePeriod::HCJR,
            PTEC_HPJB => RatePeriod::HPJB,
            PTEC_HPJW => RatePeriod::HPJW,
            PTEC_HPJR => RatePeriod::HPJR,
            _ => RatePeriod::TH,
        }
    }
}

impl RatePeriod {
    /// Code exposed on the bus datapoint
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for RatePeriod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RatePeriod::TH => write!(f, "Every hours"),
            RatePeriod::HC => write!(f, "Dig hours"),
            RatePeriod::HP => write!(f, "Full hours"),
            RatePeriod::HN => write!(f, "Standard hours"),
            RatePeriod::PM => write!(f, "Mobile spike hours"),
            RatePeriod::HCJB => write!(f, "Dig hours, blue day"),
            RatePeriod::HCJW => write!(f, "Dig hours, white day"),
            RatePeriod::HCJR => write!(f, "Dig hours, red day"),
            RatePeriod::HPJB => write!(f, "Full hours, blue day"),
            RatePeriod::HPJW => write!(f, "Full hours, white day"),
            RatePeriod::HPJR => write!(f, "Full hours, red day"),
        }
    }
}

/// Rate color useful to know the price of tomorrow
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RateColor {
    /// Unknown color (or not applicable)
    #[default]
    UNKNOWN,
    /// Blue price (lower)
    BLUE,
    /// White price (middle price)
    WHITE,
    /// Red price (most expansive)
    RED,
}

impl From<u32> for RateColor {
    fn from(code: u32) -> Self {
        match code {
            DEMAIN_BLEU => RateColor::BLUE,
            DEMAIN_BLAN => RateColor::WHITE,
            DEMAIN_ROUG => RateColor::RED,
            _ => RateColor::UNKNOWN,
        }
    }
}

impl RateColor {
    /// Code exposed on the bus datapoint
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for RateColor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RateColor::UNKNOWN => write!(f, "Unknown"),
            RateColor::BLUE => write!(f, "Blue"),
            RateColor::WHITE => write!(f, "White"),
            RateColor::RED => write!(f, "Red"),
        }
    }
}

/// Decoded representation of a field payload
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueKind {
    /// Decimal integer
    Int,
    /// Fixed width ASCII text
    Text,
    /// Tariff option code
    Optarif,
    /// Current rate period code
    Ptec,
    /// Tomorrow color code
    Demain,
    /// Low/High period group letter
    Hhphc,
}

/// Identifier of a telemetry field slot
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum FieldId {
    /// Address of the meter
    Adco,
    /// Tarif option
    Optarif,
    /// Subscribed amps
    Isousc,
    /// Base index option (Wh)
    Base,
    /// Dig index option (Wh)
    Hchc,
    /// Full index option (Wh)
    Hchp,
    /// EJP normal index (Wh)
    Ejphn,
    /// EJP mobile peak index (Wh)
    Ejphpm,
    /// Blue day dig index (Wh)
    Bbrhcjb,
    /// Blue day full index (Wh)
    Bbrhpjb,
    /// White day dig index (Wh)
    Bbrhcjw,
    /// White day full index (Wh)
    Bbrhpjw,
    /// Red day dig index (Wh)
    Bbrhcjr,
    /// Red day full index (Wh)
    Bbrhpjr,
    /// EJP start notice (30 minutes)
    Pejp,
    /// Current period pricing
    Ptec,
    /// Color of tomorrow pricing day
    Demain,
    /// Instantaneous current (A)
    Iinst,
    /// Current overrun over the subscription (A)
    Adps,
    /// Maximum current (A)
    Imax,
    /// Appear power (VA)
    Papp,
    /// Low/High period
    Hhphc,
    /// Instantaneous current phase 1 (A)
    Iinst1,
    /// Instantaneous current phase 2 (A)
    Iinst2,
    /// Instantaneous current phase 3 (A)
    Iinst3,
    /// Maximum current phase 1 (A)
    Imax1,
    /// Maximum current phase 2 (A)
    Imax2,
    /// Maximum current phase 3 (A)
    Imax3,
    /// Max power reached (W)
    Pmax,
}

impl FieldId {
    /// Number of handled telemetry fields
    pub const COUNT: usize = 29;

    /// All fields, in table order
    pub const ALL: [FieldId; FieldId::COUNT] = [
        FieldId::Adco,
        FieldId::Optarif,
        FieldId::Isousc,
        FieldId::Base,
        FieldId::Hchc,
        FieldId::Hchp,
        FieldId::Ejphn,
        FieldId::Ejphpm,
        FieldId::Bbrhcjb,
        FieldId::Bbrhpjb,
        FieldId::Bbrhcjw,
        FieldId::Bbrhpjw,
        FieldId::Bbrhcjr,
        FieldId::Bbrhpjr,
        FieldId::Pejp,
        FieldId::Ptec,
        FieldId::Demain,
        FieldId::Iinst,
        FieldId::Adps,
        FieldId::Imax,
        FieldId::Papp,
        FieldId::Hhphc,
        FieldId::Iinst1,
        FieldId::Iinst2,
        FieldId::Iinst3,
        FieldId::Imax1,
        FieldId::Imax2,
        FieldId::Imax3,
        FieldId::Pmax,
    ];

    /// Static decode configuration of the field
    pub fn config(self) -> &'static FieldConfig {
        &FIELD_TABLE[self as usize]
    }
}

/// Static decode configuration of a telemetry field
#[derive(Debug)]
pub struct FieldConfig {
    /// Line prefix, separator included
    pub key: &'static str,
    /// Payload representation
    pub kind: ValueKind,
    /// Payload width in characters
    pub width: u8,
    /// Datapoint type exposed on the bus
    pub dpt: Dpt,
}

const fn conf(key: &'static str, kind: ValueKind, width: u8, dpt: Dpt) -> FieldConfig {
    FieldConfig {
        key,
        kind,
        width,
        dpt,
    }
}

const FIELD_TABLE: [FieldConfig; FieldId::COUNT] = [
    conf("ADCO ", ValueKind::Text, 12, Dpt::STRING_ASCII),
    conf("OPTARIF ", ValueKind::Optarif, 4, Dpt::VALUE_1_UCOUNT),
    conf("ISOUSC ", ValueKind::Int, 2, Dpt::ELECTRIC_CURRENT),
    conf("BASE ", ValueKind::Int, 9, Dpt::ACTIVE_ENERGY),
    conf("HCHC ", ValueKind::Int, 9, Dpt::ACTIVE_ENERGY),
    conf("HCHP ", ValueKind::Int, 9, Dpt::ACTIVE_ENERGY),
    conf("EJPHN ", ValueKind::Int, 9, Dpt::ACTIVE_ENERGY),
    conf("EJPHPM ", ValueKind::Int, 9, Dpt::ACTIVE_ENERGY),
    conf("BBRHCJB ", ValueKind::Int, 9, Dpt::ACTIVE_ENERGY),
    conf("BBRHPJB ", ValueKind::Int, 9, Dpt::ACTIVE_ENERGY),
    conf("BBRHCJW ", ValueKind::Int, 9, Dpt::ACTIVE_ENERGY),
    conf("BBRHPJW ", ValueKind::Int, 9, Dpt::ACTIVE_ENERGY),
    conf("BBRHCJR ", ValueKind::Int, 9, Dpt::ACTIVE_ENERGY),
    conf("BBRHPJR ", ValueKind::Int, 9, Dpt::ACTIVE_ENERGY),
    conf("PEJP ", ValueKind::Int, 2, Dpt::TIME_PERIOD_MIN),
    conf("PTEC ", ValueKind::Ptec, 4, Dpt::VALUE_1_UCOUNT),
    conf("DEMAIN ", ValueKind::Demain, 4, Dpt::VALUE_1_UCOUNT),
    conf("IINST ", ValueKind::Int, 3, Dpt::ELECTRIC_CURRENT),
    conf("ADPS ", ValueKind::Int, 3, Dpt::ELECTRIC_CURRENT),
    conf("IMAX ", ValueKind::Int, 3, Dpt::ELECTRIC_CURRENT),
    conf("PAPP ", ValueKind::Int, 5, Dpt::VALUE_2_COUNT),
    conf("HHPHC ", ValueKind::Hhphc, 1, Dpt::CHAR_ASCII),
    conf("IINST1 ", ValueKind::Int, 3, Dpt::ELECTRIC_CURRENT),
    conf("IINST2 ", ValueKind::Int, 3, Dpt::ELECTRIC_CURRENT),
    conf("IINST3 ", ValueKind::Int, 3, Dpt::ELECTRIC_CURRENT),
    conf("IMAX1 ", ValueKind::Int, 3, Dpt::ELECTRIC_CURRENT),
    conf("IMAX2 ", ValueKind::Int, 3, Dpt::ELECTRIC_CURRENT),
    conf("IMAX3 ", ValueKind::Int, 3, Dpt::ELECTRIC_CURRENT),
    conf("PMAX ", ValueKind::Int, 5, Dpt::VALUE_POWER),
];

/// Reason a received line was discarded
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LineError {
    /// The trailing checksum character does not match the line content
    #[error("wrong checksum for line `{0}`")]
    Checksum(String),
    /// The line is well formed but matches no known field key
    #[error("unhandled teleinfo key in line `{0}`")]
    UnknownKey(String),
    /// The line ends before the declared payload width
    #[error("truncated value for field `{0}`")]
    Truncated(&'static str),
}

/// Decoded value of a slot, tagged by the field kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotValue {
    /// Bounded ASCII text
    Text(String),
    /// Unsigned number or packed enumeration code
    Num(u32),
}

/// Mutable state of one telemetry field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSlot {
    value: SlotValue,
    /// Local time of the last decoded change
    pub last_change: Option<u64>,
    /// Local time of the last transmission
    pub last_send: Option<u64>,
    /// Checksum of the last transmitted value
    pub last_sent_checksum: u32,
}

impl FieldSlot {
    fn new(kind: ValueKind) -> FieldSlot {
        let value = match kind {
            ValueKind::Text => SlotValue::Text(String::with_capacity(12)),
            _ => SlotValue::Num(0),
        };
        FieldSlot {
            value,
            last_change: None,
            last_send: None,
            last_sent_checksum: 0,
        }
    }

    /// Numeric value of the slot (0 for text slots)
    pub fn num(&self) -> u32 {
        match &self.value {
            SlotValue::Num(num) => *num,
            SlotValue::Text(_) => 0,
        }
    }

    /// Text value of the slot (empty for numeric slots)
    pub fn text(&self) -> &str {
        match &self.value {
            SlotValue::Text(text) => text,
            SlotValue::Num(_) => "",
        }
    }

    pub(crate) fn set_num(&mut self, num: u32) {
        self.value = SlotValue::Num(num);
    }

    /// Cheap checksum used to detect effective changes before sending
    pub(crate) fn send_checksum(&self) -> u32 {
        match &self.value {
            SlotValue::Num(num) => *num,
            SlotValue::Text(text) => rolling_checksum(text),
        }
    }

    fn decode(&mut self, kind: ValueKind, payload: &[u8]) -> bool {
        match (&mut self.value, kind) {
            (SlotValue::Text(text), _) => {
                if text.as_bytes() != payload {
                    text.clear();
                    text.push_str(&String::from_utf8_lossy(payload));
                    true
                } else {
                    false
                }
            }
            (SlotValue::Num(num), ValueKind::Int) => {
                let mut value = 0u32;
                for &c in payload {
                    if !c.is_ascii_digit() {
                        break;
                    }
                    value = value * 10 + (c - b'0') as u32;
                }
                if *num != value {
                    *num = value;
                    true
                } else {
                    false
                }
            }
            (SlotValue::Num(num), _) => {
                // Opaque packed code, order preserving
                let mut value = 0u32;
                for &c in payload {
                    value = (value << 8) | c as u32;
                }
                if *num != value {
                    *num = value;
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Validate the trailing checksum character of a line
///
/// The running sum covers every byte up to and including the second space;
/// the expected character sits right after that space. A line with fewer
/// than two spaces never validates.
fn valid_checksum(line: &[u8]) -> bool {
    let mut sum = 0u16;
    let mut spaces = 0u8;
    for &c in line {
        if c == b' ' {
            spaces += 1;
        } else if spaces == 2 {
            return ((sum.wrapping_sub(b' ' as u16) as u8) & 0x3F) + 0x20 == c;
        }
        sum = sum.wrapping_add(c as u16);
    }
    false
}

fn rolling_checksum(text: &str) -> u32 {
    let mut sum = 0u32;
    for c in text.bytes() {
        sum = sum.wrapping_add(sum).wrapping_add(c as u32);
    }
    sum
}

/// Non blocking byte source feeding the parser
pub trait SerialSource {
    /// Number of bytes ready to be read
    fn available(&mut self) -> usize;
    /// Read up to `buf.len()` bytes without blocking, returning the count
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// Serial link of the meter, historic TeleInfo framing (7E1)
#[derive(Debug)]
pub struct UartSource {
    serial: Uart,
}

impl UartSource {
    /// Open the default Raspberry Pi serial port
    pub fn new(legacy: bool) -> uart::Result<UartSource> {
        Self::with_path("/dev/serial0", legacy)
    }

    /// Open the specified serial port (1200 Bd for legacy meters, 9600 Bd
    /// otherwise)
    pub fn with_path<P: AsRef<Path>>(path: P, legacy: bool) -> uart::Result<UartSource> {
        let mut serial = if legacy {
            Uart::with_path(path, 1200, Parity::Even, 7, 1)
        } else {
            Uart::with_path(path, 9600, Parity::Even, 7, 1)
        }?;

        serial.set_read_mode(0, Duration::default())?;
        Ok(UartSource { serial })
    }
}

impl SerialSource for UartSource {
    fn available(&mut self) -> usize {
        self.serial.input_len().unwrap_or_else(|e| {
            warn!("teleinfo serial status error: {}", e);
            0
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.serial.read(buf).unwrap_or_else(|e| {
            warn!("teleinfo serial read error: {}", e);
            0
        })
    }
}

/// Telemetry state reassembled from the serial stream
#[derive(Debug)]
pub struct Teleinfo {
    slots: [FieldSlot; FieldId::COUNT],
    read_data: BytesMut,
    last_reception: Option<u64>,
}

impl Teleinfo {
    pub(crate) fn new() -> Teleinfo {
        Teleinfo {
            slots: core::array::from_fn(|at| FieldSlot::new(FIELD_TABLE[at].kind)),
            read_data: BytesMut::with_capacity(BUFFER_SIZE),
            last_reception: None,
        }
    }

    /// Slot of a telemetry field
    pub fn slot(&self, id: FieldId) -> &FieldSlot {
        &self.slots[id as usize]
    }

    pub(crate) fn slot_mut(&mut self, id: FieldId) -> &mut FieldSlot {
        &mut self.slots[id as usize]
    }

    /// Local time a valid line was last received
    pub fn last_reception(&self) -> Option<u64> {
        self.last_reception
    }

    /// Decoded tariff option
    pub fn tarif_option(&self) -> OpTarif {
        OpTarif::from(self.slot(FieldId::Optarif).num())
    }

    /// Decoded current rate period
    pub fn rate_period(&self) -> RatePeriod {
        RatePeriod::from(self.slot(FieldId::Ptec).num())
    }

    /// Decoded color of tomorrow
    pub fn tomorrow_color(&self) -> RateColor {
        RateColor::from(self.slot(FieldId::Demain).num())
    }

    /// Bus value of a field slot
    pub fn value(&self, id: FieldId) -> DpValue {
        let slot = self.slot(id);
        match id.config().kind {
            ValueKind::Int => DpValue::U32(slot.num()),
            ValueKind::Text => DpValue::Text(slot.text().to_owned()),
            ValueKind::Optarif => DpValue::U8(OpTarif::from(slot.num()).code()),
            ValueKind::Ptec => DpValue::U8(RatePeriod::from(slot.num()).code()),
            ValueKind::Demain => DpValue::U8(RateColor::from(slot.num()).code()),
            ValueKind::Hhphc => DpValue::U8(slot.num() as u8),
        }
    }

    /// Pump every pending serial byte and decode the completed lines
    ///
    /// Decoded changes are mirrored on the bus without transmission, the
    /// publication decision belongs to the scheduler.
    pub(crate) fn pump(&mut self, serial: &mut dyn SerialSource, bus: &mut dyn FieldBus, now: u64) {
        let mut chunk = [0u8; 64];
        loop {
            let pending = serial.available();
            if pending == 0 {
                break;
            }
            if self.read_data.len() == BUFFER_SIZE {
                // Desynced stream, drop everything and catch the next line
                warn!("teleinfo buffer full without terminator, reset");
                self.read_data.clear();
            }
            let want = pending.min(chunk.len()).min(BUFFER_SIZE - self.read_data.len());
            let received = serial.read(&mut chunk[..want]);
            if received == 0 {
                break;
            }
            self.read_data.extend_from_slice(&chunk[..received]);
            self.drain_lines(bus, now);
        }
    }

    fn drain_lines(&mut self, bus: &mut dyn FieldBus, now: u64) {
        while let Some(eol) = self.read_data.iter().position(|&c| c == b'\r') {
            // Tolerate a leading start/control marker before the key
            let start = self.read_data[..eol]
                .iter()
                .position(|&c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == b' ')
                .unwrap_or(eol);
            match self.decode_line(start, eol, now) {
                Ok(changed) => {
                    self.last_reception = Some(now);
                    if let Some(id) = changed {
                        bus.update(DatapointId::Field(id), self.value(id));
                    }
                }
                Err(err @ LineError::Checksum(_)) => debug!("{}", err),
                Err(err) => {
                    // Valid line, just nothing we handle
                    self.last_reception = Some(now);
                    debug!("{}", err);
                }
            }
            self.read_data.advance(eol + 1);
        }
    }

    fn decode_line(&mut self, start: usize, eol: usize, now: u64) -> Result<Option<FieldId>, LineError> {
        let line = &self.read_data[start..eol];
        if !valid_checksum(line) {
            return Err(LineError::Checksum(String::from_utf8_lossy(line).into_owned()));
        }
        for id in FieldId::ALL {
            let conf = id.config();
            let key = conf.key.as_bytes();
            if line.len() > key.len() && line.starts_with(key) {
                let payload_end = key.len() + conf.width as usize;
                if payload_end >= line.len() {
                    return Err(LineError::Truncated(conf.key));
                }
                let payload = &line[key.len()..payload_end];
                let slot = &mut self.slots[id as usize];
                if slot.decode(conf.kind, payload) {
                    slot.last_change = Some(now);
                    return Ok(Some(id));
                }
                return Ok(None);
            }
        }
        Err(LineError::UnknownKey(String::from_utf8_lossy(line).into_owned()))
    }
}
