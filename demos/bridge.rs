use std::time::Duration;

use teleinfo_knx::bridge::{Bridge, BridgeParams};
use teleinfo_knx::bus::{DatapointId, DpValue, FieldBus};
use teleinfo_knx::history::STORAGE_LEN;
use teleinfo_knx::storage::FileStorage;
use teleinfo_knx::teleinfo::UartSource;
use tokio::sync::mpsc;

/// Bus stub printing the traffic instead of handing it to a KNX stack
struct ConsoleBus;

impl FieldBus for ConsoleBus {
    fn update(&mut self, _id: DatapointId, _value: DpValue) {}

    fn publish(&mut self, id: DatapointId, value: DpValue) {
        println!("publish {:?} = {:?}", id, value);
    }

    fn request_read(&mut self, id: DatapointId) {
        println!("request read {:?}", id);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Legacy historic framing (1200 Bd) on the Pi serial port
    let serial = UartSource::new(true)?;
    let storage = FileStorage::open("teleinfo-history.bin", STORAGE_LEN)?;
    let bridge = Bridge::cold_start(BridgeParams::default(), serial, ConsoleBus, storage);

    for id in DatapointId::all() {
        println!("datapoint {:?} bound as DPT {}.{:03}", id, id.dpt().main, id.dpt().sub);
    }

    let (tx, mut rx) = mpsc::channel(100);
    let _ = bridge
        .into_task(tx, Duration::from_millis(100), Duration::from_secs(60))
        .await;
    while let Some(event) = rx.recv().await {
        println!("event: {:?}", event);
    }

    Ok(())
}
