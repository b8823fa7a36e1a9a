//! Rust library bridging the TeleInfo stream of a French electricity meter
//! onto a KNX field bus.
//! The core keeps its own software real-time clock disciplined by the
//! date/time broadcasts of the bus (no RTC hardware), decodes the meter
//! telemetry into typed datapoints and maintains a persisted day/month/year
//! consumption history per tariff bucket.
//!
//! Everything runs from a single cooperative [`bridge::Bridge::tick`]
//! invoked by the host loop; the bus stack, the serial port and the
//! persistent byte storage are collaborators injected behind small traits.

#![warn(missing_docs)]

use clock::DateChange;
use history::TariffBucket;
use teleinfo::{RateColor, RatePeriod};

pub mod bridge;
pub mod bus;
pub mod clock;
pub mod history;
pub mod scheduler;
pub mod storage;
pub mod teleinfo;

#[cfg(test)]
pub(crate) mod testutil;

/// Enum that lists all bridge events to process them asynchronously
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub enum BridgeEvent {
    /// No event
    #[default]
    None,
    /// Periodic measure of the tariff bucket indexes (Wh)
    TariffMeasure([u32; TariffBucket::COUNT]),
    /// Price rate period is changing
    PriceRatePeriodChange(RatePeriod),
    /// Color change advice (for EJP or Tempo)
    ColorAdvice(RateColor),
    /// A calendar day, month or year boundary was crossed
    DateRollover(DateChange),
}
