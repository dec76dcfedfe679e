#[cfg(feature = "trace")]
pub use nktrace::{records, TraceError, TraceHook};

#[cfg(not(feature = "trace"))]
use crate::sync::Arc;

#[cfg(not(feature = "trace"))]
pub type TraceError = core::convert::Infallible;

#[cfg(not(feature = "trace"))]
pub type TraceHook = Arc<dyn Fn(u8, &[u8], bool) -> Result<(), TraceError> + Send + Sync>;

/// Record ids, mirrored so callers compile without the `trace` feature.
#[cfg(not(feature = "trace"))]
pub mod records {
    pub mod timer {
        pub const INIT: u8 = 1;
        pub const START: u8 = 2;
        pub const STOP: u8 = 3;
        pub const EXPIRE: u8 = 4;
        pub const MIGRATE: u8 = 5;
        pub const DESTROY: u8 = 6;
    }
    pub mod clock {
        pub const TICK: u8 = 16;
        pub const PROGRAM: u8 = 17;
        pub const REMOTE: u8 = 18;
        pub const ADJUST: u8 = 19;
    }
    pub mod irq {
        pub const ENTRY: u8 = 32;
        pub const EXIT: u8 = 33;
        pub const ATTACH: u8 = 34;
        pub const DETACH: u8 = 35;
        pub const DISABLE: u8 = 36;
    }
    pub mod sched {
        pub const SWITCH: u8 = 48;
        pub const REMOTE: u8 = 49;
        pub const HOST_TICK: u8 = 50;
        pub const WATCHDOG: u8 = 51;
    }
    pub mod shadow {
        pub const GOHARD: u8 = 64;
        pub const HARDENED: u8 = 65;
        pub const GORELAX: u8 = 66;
        pub const RELAXED: u8 = 67;
        pub const KICK: u8 = 68;
        pub const MAYDAY: u8 = 69;
        pub const UNMAP: u8 = 70;
    }
}

/// Little-endian payload writer over a stack buffer.
pub(crate) struct Payload<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> &mut Self {
        let end = (self.pos + bytes.len()).min(self.buf.len());
        let n = end - self.pos;
        self.buf[self.pos..end].copy_from_slice(&bytes[..n]);
        self.pos = end;
        self
    }

    pub(crate) fn u16(&mut self, v: u16) -> &mut Self {
        self.put(&v.to_le_bytes())
    }

    pub(crate) fn u32(&mut self, v: u32) -> &mut Self {
        self.put(&v.to_le_bytes())
    }

    pub(crate) fn i32(&mut self, v: i32) -> &mut Self {
        self.put(&v.to_le_bytes())
    }

    pub(crate) fn u64(&mut self, v: u64) -> &mut Self {
        self.put(&v.to_le_bytes())
    }

    pub(crate) fn i64(&mut self, v: i64) -> &mut Self {
        self.put(&v.to_le_bytes())
    }

    pub(crate) fn len(&self) -> usize {
        self.pos
    }
}

/// Builds a payload on the stack and hands it to `hook`, if any.
pub(crate) fn emit<F>(hook: Option<&TraceHook>, record: u8, timestamp: bool, build: F)
where
    F: FnOnce(&mut Payload<'_>),
{
    if let Some(hook) = hook {
        let mut buf = [0u8; 32];
        let mut payload = Payload::new(&mut buf);
        build(&mut payload);
        let len = payload.len();
        let _ = hook(record, &buf[..len], timestamp);
    }
}
