use crate::audio::codec::{AudioError, FrameEncoder, FRAME_SIZE};

/// Packet durations the codec accepts, in capture frames.
const LEGAL_PACKET_FRAMES: [usize; 4] = [1, 2, 4, 6];

/// Largest compressed payload that still fits one voice datagram.
const MAX_PAYLOAD: usize = 1020;

/// Accumulates 10 ms capture frames and compresses them into one payload
/// per `frames_per_packet` frames. At most one finished payload is held
/// at a time; it must be taken before more audio goes in.
pub struct VoiceEncoder {
    encoder: Box<dyn FrameEncoder>,
    frames_per_packet: usize,
    buffer: Vec<i16>,
    buffered_frames: usize,
    ready: Option<Vec<u8>>,
}

impl VoiceEncoder {
    pub fn new(
        encoder: Box<dyn FrameEncoder>,
        frames_per_packet: usize,
    ) -> Result<Self, AudioError> {
        if !LEGAL_PACKET_FRAMES.contains(&frames_per_packet) {
            return Err(AudioError::InvalidInput(format!(
                "packet length of {frames_per_packet} frames is not encodable"
            )));
        }
        Ok(Self {
            encoder,
            frames_per_packet,
            buffer: Vec::with_capacity(frames_per_packet * FRAME_SIZE),
            buffered_frames: 0,
            ready: None,
        })
    }

    pub fn frames_per_packet(&self) -> usize {
        self.frames_per_packet
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffered_frames
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_some()
    }

    /// Buffers one capture frame, compressing the packet once enough have
    /// accumulated. Fails while a finished payload is still pending.
    pub fn encode_frame(&mut self, pcm: &[i16]) -> Result<(), AudioError> {
        if self.ready.is_some() {
            return Err(AudioError::InvalidInput(
                "finished payload not taken yet".to_string(),
            ));
        }
        if pcm.len() != FRAME_SIZE {
            return Err(AudioError::InvalidInput(format!(
                "expected {FRAME_SIZE} samples, got {}",
                pcm.len()
            )));
        }

        self.buffer.extend_from_slice(pcm);
        self.buffered_frames += 1;
        if self.buffered_frames == self.frames_per_packet {
            self.flush()?;
        }
        Ok(())
    }

    /// Compresses whatever is buffered, padding with silence up to the
    /// next encodable duration. Used when transmission stops mid-packet.
    pub fn terminate(&mut self) -> Result<(), AudioError> {
        if self.buffered_frames == 0 || self.ready.is_some() {
            return Ok(());
        }
        let target = LEGAL_PACKET_FRAMES
            .iter()
            .copied()
            .find(|legal| *legal >= self.buffered_frames)
            .unwrap_or(self.frames_per_packet);
        self.buffer.resize(target * FRAME_SIZE, 0);
        self.buffered_frames = target;
        self.flush()
    }

    /// Hands out the finished payload and opens the buffer for the next
    /// packet.
    pub fn take_packet(&mut self) -> Option<Vec<u8>> {
        let packet = self.ready.take();
        if packet.is_some() {
            self.buffered_frames = 0;
        }
        packet
    }

    /// Drops any buffered audio without compressing it.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.buffered_frames = 0;
        self.ready = None;
    }

    pub fn set_bitrate(&mut self, bits_per_second: u32) -> Result<(), AudioError> {
        self.encoder.set_bitrate(bits_per_second)
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        let mut out = vec![0u8; MAX_PAYLOAD];
        let written = self.encoder.encode(&self.buffer, &mut out)?;
        out.truncate(written);
        self.buffer.clear();
        self.ready = Some(out);
        Ok(())
    }
}

/// Linearly interpolates captured samples from the device rate to the
/// codec rate. Same-rate input comes back unchanged.
pub fn resample_linear(input: &[i16], input_rate: u32, output_rate: u32) -> Vec<i16> {
    if input_rate == output_rate || input.is_empty() {
        return input.to_vec();
    }
    let output_len = (input.len() as u64 * output_rate as u64 / input_rate as u64) as usize;
    let step = (input.len() - 1) as f64 / output_len.max(1) as f64;
    (0..output_len)
        .map(|index| {
            let position = index as f64 * step;
            let base = position as usize;
            let fraction = position - base as f64;
            let current = input[base] as f64;
            let next = input[(base + 1).min(input.len() - 1)] as f64;
            (current + (next - current) * fraction).round() as i16
        })
        .collect()
}

/// Scales captured samples by a linear gain, saturating at full scale.
pub fn apply_boost(pcm: &mut [i16], boost: f32) {
    if (boost - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in pcm {
        let scaled = (*sample as f32 * boost).round();
        *sample = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_boost, resample_linear, VoiceEncoder};
    use crate::audio::codec::{AudioError, FrameEncoder, FRAME_SIZE};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records the sample counts handed to the codec and emits a
    /// one-byte payload per call.
    struct CountingEncoder {
        calls: Rc<RefCell<Vec<usize>>>,
    }

    impl FrameEncoder for CountingEncoder {
        fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, AudioError> {
            self.calls.borrow_mut().push(pcm.len());
            out[0] = 0xAB;
            Ok(1)
        }

        fn set_bitrate(&mut self, _bits_per_second: u32) -> Result<(), AudioError> {
            Ok(())
        }
    }

    fn encoder_with_calls(frames_per_packet: usize) -> (VoiceEncoder, Rc<RefCell<Vec<usize>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let encoder = VoiceEncoder::new(
            Box::new(CountingEncoder {
                calls: Rc::clone(&calls),
            }),
            frames_per_packet,
        )
        .expect("legal packet length");
        (encoder, calls)
    }

    /// A payload becomes ready exactly when the configured frame count
    /// has been buffered, compressed in a single codec call.
    #[test]
    fn payload_ready_at_packet_boundary() {
        // Arrange
        let (mut encoder, calls) = encoder_with_calls(2);
        let frame = [100i16; FRAME_SIZE];

        // Act
        encoder.encode_frame(&frame).expect("first frame");
        assert!(!encoder.is_ready());
        assert_eq!(encoder.buffered_frames(), 1);
        encoder.encode_frame(&frame).expect("second frame");

        // Assert
        assert!(encoder.is_ready());
        assert_eq!(encoder.buffered_frames(), 2);
        assert_eq!(*calls.borrow(), vec![2 * FRAME_SIZE]);
        assert_eq!(encoder.take_packet(), Some(vec![0xAB]));
        assert_eq!(encoder.buffered_frames(), 0);
    }

    /// Audio cannot be buffered past an untaken payload.
    #[test]
    fn pending_payload_blocks_input() {
        // Arrange
        let (mut encoder, _calls) = encoder_with_calls(1);
        let frame = [0i16; FRAME_SIZE];
        encoder.encode_frame(&frame).expect("frame");

        // Act
        let err = encoder.encode_frame(&frame).expect_err("expected rejection");

        // Assert
        assert!(matches!(err, AudioError::InvalidInput(_)));
        assert!(encoder.take_packet().is_some());
        encoder.encode_frame(&frame).expect("accepts again");
    }

    /// Odd-sized input frames are rejected before touching the codec.
    #[test]
    fn wrong_frame_size_is_rejected() {
        // Arrange
        let (mut encoder, calls) = encoder_with_calls(1);

        // Act
        let err = encoder
            .encode_frame(&[0i16; FRAME_SIZE / 2])
            .expect_err("expected rejection");

        // Assert
        assert!(matches!(err, AudioError::InvalidInput(_)));
        assert!(calls.borrow().is_empty());
    }

    /// Terminating mid-packet pads to the next encodable duration.
    #[test]
    fn terminate_pads_partial_packet() {
        // Arrange
        let (mut encoder, calls) = encoder_with_calls(4);
        let frame = [50i16; FRAME_SIZE];
        for _ in 0..3 {
            encoder.encode_frame(&frame).expect("frame");
        }

        // Act
        encoder.terminate().expect("terminate");

        // Assert: three buffered frames round up to four.
        assert!(encoder.is_ready());
        assert_eq!(*calls.borrow(), vec![4 * FRAME_SIZE]);
    }

    /// Terminating with nothing buffered or with a payload pending does
    /// nothing.
    #[test]
    fn terminate_is_a_no_op_when_idle() {
        // Arrange
        let (mut encoder, calls) = encoder_with_calls(1);

        // Act
        encoder.terminate().expect("terminate");

        // Assert
        assert!(!encoder.is_ready());
        assert!(calls.borrow().is_empty());
    }

    /// Packet lengths the codec cannot express are rejected up front.
    #[test]
    fn illegal_packet_length_is_rejected() {
        // Arrange
        let calls = Rc::new(RefCell::new(Vec::new()));

        // Act
        let result = VoiceEncoder::new(
            Box::new(CountingEncoder {
                calls: Rc::clone(&calls),
            }),
            3,
        );

        // Assert
        assert!(matches!(result, Err(AudioError::InvalidInput(_))));
    }

    /// Upsampling produces the proportional sample count and keeps a
    /// constant signal constant.
    #[test]
    fn resampling_scales_length_and_preserves_level() {
        // Arrange
        let input = vec![500i16; 160];

        // Act
        let upsampled = resample_linear(&input, 16_000, 48_000);
        let unchanged = resample_linear(&input, 48_000, 48_000);

        // Assert
        assert_eq!(upsampled.len(), 480);
        assert!(upsampled.iter().all(|sample| *sample == 500));
        assert_eq!(unchanged, input);
    }

    /// Boost scales samples and saturates instead of wrapping.
    #[test]
    fn boost_saturates_at_full_scale() {
        // Arrange
        let mut pcm = [1000i16, -1000, i16::MAX, i16::MIN];

        // Act
        apply_boost(&mut pcm, 2.0);

        // Assert
        assert_eq!(pcm, [2000, -2000, i16::MAX, i16::MIN]);
    }
}
