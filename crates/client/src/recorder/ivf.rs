use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

const HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 12;
/// Timestamps count frames at this rate, which is also what players use
/// to pace playback.
const TIMEBASE_DENOMINATOR: u32 = 30;
const TIMEBASE_NUMERATOR: u32 = 1;

/// In-memory VP8 IVF muxer. Each frame becomes one chunk; the file
/// header is written on [`IvfWriter::finish`] once the frame count is known.
#[derive(Debug)]
pub struct IvfWriter {
    width: u16,
    height: u16,
    chunks: Vec<Bytes>,
    frames: u32,
    last_pts: Option<u64>,
}

impl IvfWriter {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            chunks: Vec::new(),
            frames: 0,
            last_pts: None,
        }
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Size the finished file would have.
    pub fn len(&self) -> usize {
        HEADER_LEN + self.chunks.iter().map(Bytes::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Appends one frame captured `pts` after the start of the recording.
    pub fn push(&mut self, data: &[u8], pts: Duration) {
        let mut ticks = pts.as_millis() as u64 * TIMEBASE_DENOMINATOR as u64
            / (1000 * TIMEBASE_NUMERATOR as u64);
        // timestamps must increase
        if let Some(last) = self.last_pts {
            ticks = ticks.max(last + 1);
        }
        self.last_pts = Some(ticks);

        let mut chunk = BytesMut::with_capacity(FRAME_HEADER_LEN + data.len());
        chunk.put_u32_le(data.len() as u32);
        chunk.put_u64_le(ticks);
        chunk.put_slice(data);
        self.chunks.push(chunk.freeze());
        self.frames += 1;
    }

    pub fn finish(self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        out.put_slice(b"DKIF");
        out.put_u16_le(0);
        out.put_u16_le(HEADER_LEN as u16);
        out.put_slice(b"VP80");
        out.put_u16_le(self.width);
        out.put_u16_le(self.height);
        out.put_u32_le(TIMEBASE_DENOMINATOR);
        out.put_u32_le(TIMEBASE_NUMERATOR);
        out.put_u32_le(self.frames);
        out.put_u32_le(0);
        for chunk in self.chunks {
            out.put_slice(&chunk);
        }
        out.freeze()
    }
}
