use std::io::{Read, Write};

use serde::Serialize;

use crate::error::PipelineError;

/// Bytes per pixel for packed 8-bit RGB, the only layout the raw streams
/// carry.
pub const RGB24_BYTES_PER_PIXEL: u32 = 3;

/// Pixel dimensions of the raw streams, fixed for the whole pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MediaGeometry {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
}

impl MediaGeometry {
    pub fn rgb24(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel: RGB24_BYTES_PER_PIXEL,
        }
    }

    /// Size of one raw frame in bytes.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel as usize
    }
}

/// One raw frame. The buffer is always exactly `geometry.frame_size()`
/// bytes; frames move by value through the pipeline and are never shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    geometry: MediaGeometry,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(geometry: MediaGeometry, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), geometry.frame_size());
        Self { geometry, data }
    }

    pub fn geometry(&self) -> MediaGeometry {
        self.geometry
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Pulls exactly one frame's worth of bytes at a time from a raw decode
/// stream.
pub struct FrameReader<R> {
    inner: R,
    geometry: MediaGeometry,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, geometry: MediaGeometry) -> Self {
        Self { inner, geometry }
    }

    /// Reads the next frame, looping over the underlying stream until a
    /// full frame has accumulated. `Ok(None)` means the stream closed
    /// cleanly at a frame boundary. A close mid-frame is a contract
    /// violation and never yields a short frame.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        let frame_size = self.geometry.frame_size();
        let mut buffer = vec![0u8; frame_size];
        let mut filled = 0usize;

        while filled < frame_size {
            match self.inner.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(PipelineError::FrameRead { source: err }),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < frame_size {
            return Err(PipelineError::TruncatedFrame {
                expected: frame_size,
                got: filled,
            });
        }

        Ok(Some(Frame::new(self.geometry, buffer)))
    }
}

/// Pushes transformed frames into a raw encode stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes all of the frame's bytes, blocking until the underlying
    /// buffer accepts them. A broken pipe means the encoder exited early
    /// and is surfaced as such.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), PipelineError> {
        self.inner
            .write_all(frame.bytes())
            .map_err(PipelineError::from_write_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A reader that hands out at most `chunk` bytes per call, to exercise
    /// the accumulation loop.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let limit = self.chunk.min(buf.len());
            self.data.read(&mut buf[..limit])
        }
    }

    fn test_geometry() -> MediaGeometry {
        MediaGeometry::rgb24(4, 2)
    }

    fn frame_bytes(seed: u8, size: usize) -> Vec<u8> {
        (0..size).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn frame_size_arithmetic() {
        let geometry = MediaGeometry::rgb24(64, 48);
        assert_eq!(geometry.frame_size(), 64 * 48 * 3);
    }

    #[test]
    fn reads_exact_frames_from_fragmented_stream() {
        let geometry = test_geometry();
        let size = geometry.frame_size();
        let mut stream = frame_bytes(1, size);
        stream.extend(frame_bytes(100, size));

        let mut reader = FrameReader::new(
            Trickle {
                data: Cursor::new(stream),
                chunk: 5,
            },
            geometry,
        );

        let first = reader.read_frame().unwrap().expect("first frame");
        assert_eq!(first.bytes(), frame_bytes(1, size).as_slice());
        let second = reader.read_frame().unwrap().expect("second frame");
        assert_eq!(second.bytes(), frame_bytes(100, size).as_slice());
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn end_of_stream_on_empty_input() {
        let geometry = test_geometry();
        let mut reader = FrameReader::new(Cursor::new(Vec::new()), geometry);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn partial_frame_is_a_truncation_error() {
        let geometry = test_geometry();
        let size = geometry.frame_size();
        let mut reader = FrameReader::new(Cursor::new(frame_bytes(7, size - 3)), geometry);

        match reader.read_frame() {
            Err(PipelineError::TruncatedFrame { expected, got }) => {
                assert_eq!(expected, size);
                assert_eq!(got, size - 3);
            }
            other => panic!("expected truncation error, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let geometry = test_geometry();
        let size = geometry.frame_size();
        let mut stream = Vec::new();
        for seed in 0..10u8 {
            stream.extend(frame_bytes(seed, size));
        }

        let mut reader = FrameReader::new(Cursor::new(stream.clone()), geometry);
        let mut sink = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut sink);
            while let Some(frame) = reader.read_frame().unwrap() {
                assert_eq!(frame.bytes().len(), size);
                writer.write_frame(&frame).unwrap();
            }
        }

        assert_eq!(sink, stream);
    }
}
