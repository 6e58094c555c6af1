//! Common test utilities: an in-memory device speaking the wire protocol.

// Shared across several test files; not every item is used by each of them.
#![allow(dead_code)]

use bytes::{Buf, Bytes, BytesMut};
use radiacode_lib::command::{Opcode, Vs, Vsfr};
use radiacode_lib::error::Error;
use radiacode_lib::frame::{Decoded, Frame, decode};
use radiacode_lib::transport::Transport;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SERIAL: &str = "RC-102-004711";
pub const MAX_FRAME: usize = 16 * 1024;

/// Device-side state, shared with the test through `FakeHandle`.
#[derive(Debug)]
pub struct FakeState {
    pub firmware: (u16, u16),
    pub strings: HashMap<u32, Vec<u8>>,
    /// Successive `DataBuf` contents; an empty queue reads as an empty buffer.
    pub data_buffers: VecDeque<Vec<u8>>,
    pub registers: HashMap<u32, u32>,
    /// `(register, value)` for every acknowledged register write.
    pub register_writes: Vec<(u32, Option<u32>)>,
    pub string_writes: Vec<(u32, Vec<u8>)>,
    /// Commands answered with silence.
    pub mute: HashSet<u16>,
    pub mute_all: bool,
    /// Every read fails as if the cable had been pulled.
    pub fail_reads: bool,
    /// Registers whose writes are refused with return code 0.
    pub refuse: HashSet<u32>,
    /// Noise sent ahead of every reply.
    pub noise: Vec<u8>,
    pub frames_received: usize,
    pub opcodes_received: Vec<Opcode>,
    pub closes: usize,
}

pub type FakeHandle = Arc<Mutex<FakeState>>;

pub struct FakeDevice {
    state: FakeHandle,
    outgoing: BytesMut,
    chunk: usize,
}

impl FakeDevice {
    /// A device with firmware 4.12, plain spectra and calibration (0, 3, 0).
    pub fn new() -> (Self, FakeHandle) {
        let mut strings = HashMap::new();
        strings.insert(
            u32::from(Vs::Configuration),
            b"DeviceName=RadiaCode-102\nSpecFormatVersion=0\n".to_vec(),
        );
        strings.insert(u32::from(Vs::SerialNumber), SERIAL.as_bytes().to_vec());
        strings.insert(u32::from(Vs::EnergyCalib), calibration_bytes(0.0, 3.0, 0.0));

        let state = Arc::new(Mutex::new(FakeState {
            firmware: (4, 12),
            strings,
            data_buffers: VecDeque::new(),
            registers: HashMap::new(),
            register_writes: Vec::new(),
            string_writes: Vec::new(),
            mute: HashSet::new(),
            mute_all: false,
            fail_reads: false,
            refuse: HashSet::new(),
            noise: Vec::new(),
            frames_received: 0,
            opcodes_received: Vec::new(),
            closes: 0,
        }));
        let device = Self {
            state: state.clone(),
            outgoing: BytesMut::new(),
            chunk: 64,
        };
        (device, state)
    }

    /// Deliver replies in reads of at most `chunk` bytes.
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }
}

impl Transport for FakeDevice {
    fn max_packet_len(&self) -> usize {
        256
    }

    fn max_frame_len(&self) -> usize {
        MAX_FRAME
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let Decoded::Frame(request) = decode(data, MAX_FRAME).0 else {
            panic!("client wrote a malformed frame: {}", hex::encode(data));
        };
        let mut state = self.state.lock().unwrap();
        state.frames_received += 1;
        state.opcodes_received.push(request.opcode());
        if state.mute_all || state.mute.contains(&u16::from(request.opcode())) {
            return Ok(());
        }
        let payload = respond(&mut state, &request);
        self.outgoing.extend_from_slice(&state.noise);
        let reply = Frame {
            header: request.header,
            payload: Bytes::from(payload),
        };
        self.outgoing.extend_from_slice(&reply.encode());
        Ok(())
    }

    async fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Bytes, Error> {
        if self.state.lock().unwrap().fail_reads {
            return Err(Error::Channel("device unplugged".to_string()));
        }
        if self.outgoing.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(Bytes::new());
        }
        let n = self.outgoing.len().min(max_len).min(self.chunk);
        Ok(self.outgoing.split_to(n).freeze())
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

fn ok_with(data: &[u8]) -> Vec<u8> {
    let mut out = 1u32.to_le_bytes().to_vec();
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

fn short_string(out: &mut Vec<u8>, s: &str) {
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

fn respond(state: &mut FakeState, request: &Frame) -> Vec<u8> {
    let mut args = request.payload.clone();
    match request.opcode() {
        Opcode::SetExchange => vec![0x01, 0x00, 0x00, 0x00],
        Opcode::SetTime => Vec::new(),
        Opcode::GetVersion => {
            let mut out = Vec::new();
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&4u16.to_le_bytes());
            short_string(&mut out, "Jan 10 2023");
            let (major, minor) = state.firmware;
            out.extend_from_slice(&minor.to_le_bytes());
            out.extend_from_slice(&major.to_le_bytes());
            short_string(&mut out, "Mar 14 2024\0");
            out
        }
        Opcode::GetStatus => 0x0000_0003u32.to_le_bytes().to_vec(),
        Opcode::GetSerial => {
            let mut out = 8u32.to_le_bytes().to_vec();
            out.extend_from_slice(&0x0012_3456u32.to_le_bytes());
            out.extend_from_slice(&0x89AB_CDEFu32.to_le_bytes());
            out
        }
        Opcode::FwSignature => {
            let mut out = 0xDEAD_BEEFu32.to_le_bytes().to_vec();
            short_string(&mut out, "rc-102.bin");
            short_string(&mut out, "RadiaCode RC-102");
            out
        }
        Opcode::RdVirtString => {
            let id = args.get_u32_le();
            if id == u32::from(Vs::DataBuf) {
                let data = state.data_buffers.pop_front().unwrap_or_default();
                return ok_with(&data);
            }
            match state.strings.get(&id) {
                Some(data) => ok_with(data),
                None => vec![0, 0, 0, 0, 0, 0, 0, 0],
            }
        }
        Opcode::WrVirtString => {
            let id = args.get_u32_le();
            let len = args.get_u32_le() as usize;
            let data = args[..len].to_vec();
            state.string_writes.push((id, data.clone()));
            if id == u32::from(Vs::EnergyCalib) {
                state.strings.insert(id, data);
            }
            1u32.to_le_bytes().to_vec()
        }
        Opcode::WrVirtSfr => {
            let id = args.get_u32_le();
            let value = (args.remaining() >= 4).then(|| args.get_u32_le());
            if state.refuse.contains(&id) {
                return 0u32.to_le_bytes().to_vec();
            }
            state.register_writes.push((id, value));
            if let Some(value) = value {
                state.registers.insert(id, value);
            }
            1u32.to_le_bytes().to_vec()
        }
        Opcode::RdVirtSfrBatch => {
            let mut out = Vec::new();
            while args.remaining() >= 4 {
                let id = args.get_u32_le();
                let value = state.registers.get(&id).copied().unwrap_or(0);
                out.extend_from_slice(&value.to_le_bytes());
            }
            out
        }
        other => panic!("fake device has no answer for {other}"),
    }
}

pub fn calibration_bytes(a0: f32, a1: f32, a2: f32) -> Vec<u8> {
    [a0, a1, a2].iter().flat_map(|c| c.to_le_bytes()).collect()
}

/// Plain (format 0) spectrum contents.
pub fn spectrum_bytes(duration_s: u32, calibration: (f32, f32, f32), counts: &[u32]) -> Vec<u8> {
    let mut out = duration_s.to_le_bytes().to_vec();
    out.extend(calibration_bytes(calibration.0, calibration.1, calibration.2));
    for count in counts {
        out.extend_from_slice(&count.to_le_bytes());
    }
    out
}

fn record(seq: u8, gid: u8, ticks: i32, body: &[u8]) -> Vec<u8> {
    let mut out = vec![seq, 0, gid];
    out.extend_from_slice(&ticks.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Filtered real-time sample record.
pub fn realtime_record(seq: u8, ticks: i32, count_rate: f32, dose_rate: f32) -> Vec<u8> {
    let mut body = count_rate.to_le_bytes().to_vec();
    body.extend_from_slice(&dose_rate.to_le_bytes());
    body.extend_from_slice(&40u16.to_le_bytes());
    body.extend_from_slice(&80u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.push(0);
    record(seq, 0, ticks, &body)
}

pub fn rare_record(seq: u8, ticks: i32, duration_s: u32, dose: f32) -> Vec<u8> {
    let mut body = duration_s.to_le_bytes().to_vec();
    body.extend_from_slice(&dose.to_le_bytes());
    body.extend_from_slice(&4200u16.to_le_bytes());
    body.extend_from_slice(&9500u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    record(seq, 3, ticks, &body)
}

pub fn event_record(seq: u8, ticks: i32, event: u8, param: u8) -> Vec<u8> {
    record(seq, 7, ticks, &[event, param, 0, 0])
}

pub fn register(id: Vsfr) -> u32 {
    id.into()
}

/// Quiet unless `RUST_LOG` asks otherwise.
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_test_writer())
        .try_init();
}
