//! Shared doubles for the module tests
use std::collections::VecDeque;

use crate::bus::{DatapointId, DpValue, FieldBus};
use crate::teleinfo::SerialSource;

/// Bus double recording every call
#[derive(Debug, Default)]
pub struct RecordingBus {
    /// Mirrored values (no transmission)
    pub updates: Vec<(DatapointId, DpValue)>,
    /// Transmitted values
    pub published: Vec<(DatapointId, DpValue)>,
    /// Remote read requests
    pub read_requests: Vec<DatapointId>,
}

impl RecordingBus {
    /// Last mirrored value of a datapoint
    pub fn last_update(&self, id: DatapointId) -> Option<&DpValue> {
        self.updates
            .iter()
            .rev()
            .find(|(dp, _)| *dp == id)
            .map(|(_, value)| value)
    }

    /// Last transmitted value of a datapoint
    pub fn last_published(&self, id: DatapointId) -> Option<&DpValue> {
        self.published
            .iter()
            .rev()
            .find(|(dp, _)| *dp == id)
            .map(|(_, value)| value)
    }

    /// Number of transmissions of a datapoint
    pub fn published_count(&self, id: DatapointId) -> usize {
        self.published.iter().filter(|(dp, _)| *dp == id).count()
    }
}

impl FieldBus for RecordingBus {
    fn update(&mut self, id: DatapointId, value: DpValue) {
        self.updates.push((id, value));
    }

    fn publish(&mut self, id: DatapointId, value: DpValue) {
        self.published.push((id, value));
    }

    fn request_read(&mut self, id: DatapointId) {
        self.read_requests.push(id);
    }
}

/// Serial double yielding a scripted byte stream
#[derive(Debug, Default)]
pub struct ScriptedSerial {
    pending: VecDeque<u8>,
}

impl ScriptedSerial {
    /// Queue bytes for the next reads
    pub fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes.iter().copied());
    }
}

impl SerialSource for ScriptedSerial {
    fn available(&mut self) -> usize {
        self.pending.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut count = 0;
        while count < buf.len() {
            match self.pending.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }
}

/// Frame a `KEY value` body into a full line with checksum and terminator
pub fn frame_line(body: &str) -> Vec<u8> {
    let sum = body
        .bytes()
        .fold(0u16, |sum, c| sum.wrapping_add(c as u16))
        .wrapping_add(0x20);
    let checksum = ((sum.wrapping_sub(0x20) as u8) & 0x3F) + 0x20;
    let mut line = body.as_bytes().to_vec();
    line.push(b' ');
    line.push(checksum);
    line.push(b'\r');
    line
}
