//! Binary trace records for the real-time nucleus.
//!
//! Records are small little-endian payloads tagged with a record id from
//! [`records`]. Each one is wrapped in an HDLC-like frame (sequence number,
//! record id, optional timestamp, payload, inverted checksum, `0x7E` flag)
//! and handed to a pluggable [`TraceBackend`].
//!
//! The nucleus never holds a [`Tracer`] directly. It receives a
//! [`TraceHook`] closure and calls it from a stack buffer so that emitting a
//! record in an interrupt path does not allocate on the caller side.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

pub mod records;

/// Maximum payload length for a single record (excluding header/checksum).
const DEFAULT_MAX_RECORD_LEN: usize = 64;

const FLAG: u8 = 0x7E;
const ESC: u8 = 0x7D;
const ESC_XOR: u8 = 0x20;

/// Configuration for the tracer.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub max_record_len: usize,
    pub include_timestamp: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            include_timestamp: true,
        }
    }
}

/// A single trace record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub seq: u8,
    pub record_type: u8,
    /// Microseconds since the tracer was created.
    pub timestamp: Option<u32>,
    pub payload: Vec<u8>,
}

/// Errors that can occur while emitting or decoding trace data.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("backend error: {0}")]
    Backend(#[from] io::Error),
}

/// Backend trait that consumes HDLC framed bytes.
pub trait TraceBackend: Send + Sync {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError>;
}

/// Backend writing frames to any `Write` implementation.
pub struct WriterBackend<W: Write + Send + 'static> {
    writer: Arc<Mutex<W>>,
}

impl<W: Write + Send + 'static> WriterBackend<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

impl<W: Write + Send + 'static> TraceBackend for WriterBackend<W> {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError> {
        self.writer.lock().write_all(frame).map_err(TraceError::from)
    }
}

/// Backend keeping every frame in memory, handy for tests and post-mortem
/// dumps.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    /// Decodes every captured frame, skipping malformed ones.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| decode_frame(frame, false).ok())
            .collect()
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

impl TraceBackend for MemoryBackend {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError> {
        self.frames.lock().push(frame.to_vec());
        Ok(())
    }
}

/// Convenience backend that writes frames to stdout.
pub fn stdout_backend() -> WriterBackend<io::Stdout> {
    WriterBackend::new(io::stdout())
}

/// Frame encoder.
pub struct Tracer<B: TraceBackend> {
    backend: B,
    cfg: TraceConfig,
    seq: u8,
    epoch: Instant,
}

#[derive(Clone)]
pub struct TracerHandle<B: TraceBackend> {
    inner: Arc<Mutex<Tracer<B>>>,
}

pub type TraceHook = Arc<dyn Fn(u8, &[u8], bool) -> Result<(), TraceError> + Send + Sync>;

impl<B: TraceBackend> Tracer<B> {
    pub fn new(cfg: TraceConfig, backend: B) -> Self {
        Self {
            backend,
            cfg,
            seq: 0,
            epoch: Instant::now(),
        }
    }

    pub fn into_handle(self) -> TracerHandle<B> {
        TracerHandle {
            inner: Arc::new(Mutex::new(self)),
        }
    }

    pub fn record(
        &mut self,
        record_type: u8,
        payload: &[u8],
        with_timestamp: bool,
    ) -> Result<TraceRecord, TraceError> {
        if payload.len() > self.cfg.max_record_len {
            return Err(TraceError::PayloadTooLarge(payload.len()));
        }

        let timestamp = if self.cfg.include_timestamp && with_timestamp {
            Some(micros(self.epoch.elapsed()))
        } else {
            None
        };

        self.seq = self.seq.wrapping_add(1);
        let record = TraceRecord {
            seq: self.seq,
            record_type,
            timestamp,
            payload: payload.to_vec(),
        };

        let frame = encode_frame(&record);
        self.backend.write_frame(&frame)?;
        Ok(record)
    }
}

impl<B: TraceBackend + 'static> TracerHandle<B> {
    pub fn emit(&self, record_type: u8, payload: &[u8]) -> Result<TraceRecord, TraceError> {
        self.inner.lock().record(record_type, payload, false)
    }

    pub fn emit_with_timestamp(
        &self,
        record_type: u8,
        payload: &[u8],
    ) -> Result<TraceRecord, TraceError> {
        self.inner.lock().record(record_type, payload, true)
    }

    pub fn hook(&self) -> TraceHook {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |record_type, payload, with_timestamp| {
            inner
                .lock()
                .record(record_type, payload, with_timestamp)
                .map(|_| ())
        })
    }
}

fn micros(elapsed: Duration) -> u32 {
    elapsed.as_micros().min(u32::MAX as u128) as u32
}

fn push_escaped(dest: &mut Vec<u8>, byte: u8) {
    if byte == FLAG || byte == ESC {
        dest.push(ESC);
        dest.push(byte ^ ESC_XOR);
    } else {
        dest.push(byte);
    }
}

/// Builds the escaped frame for `record`.
pub fn encode_frame(record: &TraceRecord) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(record.payload.len() + 12);
    let mut checksum: u8 = 0;

    let mut push = |dest: &mut Vec<u8>, byte: u8| {
        checksum = checksum.wrapping_add(byte);
        push_escaped(dest, byte);
    };

    push(&mut bytes, record.seq);
    push(&mut bytes, record.record_type);
    if let Some(ts) = record.timestamp {
        for byte in ts.to_le_bytes() {
            push(&mut bytes, byte);
        }
    }
    for &byte in &record.payload {
        push(&mut bytes, byte);
    }

    push_escaped(&mut bytes, !checksum);
    bytes.push(FLAG);
    bytes
}

/// Parses one frame produced by [`encode_frame`]. The caller states whether
/// the frame carries a timestamp since the wire format does not.
pub fn decode_frame(frame: &[u8], with_timestamp: bool) -> Result<TraceRecord, TraceError> {
    let body = match frame.split_last() {
        Some((&FLAG, body)) => body,
        _ => return Err(TraceError::Malformed("missing flag")),
    };

    let mut raw = Vec::with_capacity(body.len());
    let mut escaped = false;
    for &byte in body {
        if escaped {
            raw.push(byte ^ ESC_XOR);
            escaped = false;
        } else if byte == ESC {
            escaped = true;
        } else {
            raw.push(byte);
        }
    }
    if escaped {
        return Err(TraceError::Malformed("dangling escape"));
    }

    let header = if with_timestamp { 6 } else { 2 };
    if raw.len() < header + 1 {
        return Err(TraceError::Malformed("short frame"));
    }
    let (content, check) = raw.split_at(raw.len() - 1);
    let sum = content.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if !sum != check[0] {
        return Err(TraceError::Malformed("bad checksum"));
    }

    let timestamp = if with_timestamp {
        Some(u32::from_le_bytes([
            content[2], content[3], content[4], content[5],
        ]))
    } else {
        None
    };

    Ok(TraceRecord {
        seq: content[0],
        record_type: content[1],
        timestamp,
        payload: content[header..].to_vec(),
    })
}
