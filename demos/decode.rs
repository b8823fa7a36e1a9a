use std::{env, fs};

use teleinfo_knx::bridge::{Bridge, BridgeParams};
use teleinfo_knx::bus::{BusUpdate, DatapointId, DpValue, FieldBus};
use teleinfo_knx::history::{TariffBucket, STORAGE_LEN};
use teleinfo_knx::storage::MemStorage;
use teleinfo_knx::teleinfo::{FieldId, SerialSource};

/// Byte source replaying a captured TeleInfo stream
struct CapturedSerial {
    data: Vec<u8>,
    at: usize,
}

impl SerialSource for CapturedSerial {
    fn available(&mut self) -> usize {
        self.data.len() - self.at
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.data.len() - self.at);
        buf[..count].copy_from_slice(&self.data[self.at..self.at + count]);
        self.at += count;
        count
    }
}

struct ConsoleBus;

impl FieldBus for ConsoleBus {
    fn update(&mut self, id: DatapointId, value: DpValue) {
        if let DatapointId::Field(_) = id {
            println!("decoded {:?} = {:?}", id, value);
        }
    }

    fn publish(&mut self, _id: DatapointId, _value: DpValue) {}

    fn request_read(&mut self, _id: DatapointId) {}
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = env::args().nth(1).unwrap_or_else(|| String::from("capture.bin"));
    let data = fs::read(&path)?;

    let serial = CapturedSerial { data, at: 0 };
    let mut bridge = Bridge::cold_start(
        BridgeParams {
            publish_period_s: 0,
            ..Default::default()
        },
        serial,
        ConsoleBus,
        MemStorage::new(STORAGE_LEN),
    );

    // Pretend the bus already broadcast the date so the history engine runs
    bridge.on_bus_update(BusUpdate::DateTime {
        year: 2024,
        month: 6,
        day: 15,
        hour: 12,
        min: 0,
        sec: 0,
    });
    bridge.tick();

    println!();
    println!("Meter        : {}", bridge.slot(FieldId::Adco).text());
    println!("Tarif option : {}", bridge.tarif_option());
    println!("Rate period  : {}", bridge.rate_period());
    println!("Tomorrow     : {}", bridge.tomorrow_color());
    let index = bridge.current_indexes();
    println!(
        "Indexes      : base {} Wh, dig {} Wh, full {} Wh",
        index[TariffBucket::Base as usize],
        index[TariffBucket::HC as usize],
        index[TariffBucket::HP as usize]
    );

    Ok(())
}
