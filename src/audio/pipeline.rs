use std::marker::PhantomData;

use mumble_protocol_2x::voice::{Clientbound, Serverbound, VoicePacket, VoicePacketPayload};

use crate::audio::codec::{encoder_for, AudioError, NegotiatedCodec};
use crate::audio::encode::VoiceEncoder;
use crate::audio::output::VoiceOutput;
use crate::model::user::TalkState;
use crate::protocol::dispatch::DatagramHandler;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransmitMode {
    Continuous,
    VoiceActivity,
    PushToTalk,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub transmit_mode: TransmitMode,
    pub frames_per_packet: usize,
    pub bitrate: u32,
    /// Normalized RMS level above which a frame counts as speech.
    pub detection_threshold: f32,
    /// Frames transmission lingers after the level drops below the
    /// threshold, to avoid clipping word endings.
    pub vad_hangover_frames: u32,
    /// Mute playback while the push-to-talk key transmits. Has no effect
    /// in the other transmit modes.
    pub half_duplex: bool,
    /// Strip DC bias from captured frames before level detection and
    /// encoding.
    pub preprocessor_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            transmit_mode: TransmitMode::VoiceActivity,
            frames_per_packet: 2,
            bitrate: 40_000,
            detection_threshold: 0.3,
            vad_hangover_frames: 15,
            half_duplex: false,
            preprocessor_enabled: true,
        }
    }
}

/// The full voice path: capture frames go in one side and sequenced
/// packets come out, inbound packets go in the other side and mixed
/// frames come out.
pub struct AudioPipeline {
    config: PipelineConfig,
    encoder: VoiceEncoder,
    output: VoiceOutput,
    seq_num: u64,
    voice_target: u8,
    push_to_talk: bool,
    vad_hangover: u32,
    transmitting: bool,
    outgoing: Vec<VoicePacket<Serverbound>>,
}

impl AudioPipeline {
    pub fn new(config: PipelineConfig, codec: NegotiatedCodec) -> Result<Self, AudioError> {
        let encoder = VoiceEncoder::new(
            encoder_for(codec, config.bitrate)?,
            config.frames_per_packet,
        )?;
        let output = VoiceOutput::new(codec);
        Ok(Self::with_parts(config, encoder, output))
    }

    pub fn with_parts(config: PipelineConfig, encoder: VoiceEncoder, output: VoiceOutput) -> Self {
        Self {
            config,
            encoder,
            output,
            seq_num: 0,
            voice_target: 0,
            push_to_talk: false,
            vad_hangover: 0,
            transmitting: false,
            outgoing: Vec::new(),
        }
    }

    /// Feeds one 10 ms capture frame through transmission gating and the
    /// encoder. Returns whether the frame was voiced.
    pub fn capture_frame(&mut self, pcm: &[i16]) -> Result<bool, AudioError> {
        let cleaned;
        let pcm = if self.config.preprocessor_enabled {
            cleaned = remove_dc(pcm);
            cleaned.as_slice()
        } else {
            pcm
        };

        let voiced = match self.config.transmit_mode {
            TransmitMode::Continuous => true,
            TransmitMode::PushToTalk => self.push_to_talk,
            TransmitMode::VoiceActivity => {
                if rms_level(pcm) >= self.config.detection_threshold {
                    self.vad_hangover = self.config.vad_hangover_frames;
                    true
                } else if self.vad_hangover > 0 {
                    self.vad_hangover -= 1;
                    true
                } else {
                    false
                }
            }
        };

        if voiced {
            self.transmitting = true;
            self.encoder.encode_frame(pcm)?;
            if self.encoder.is_ready() {
                self.packetize(false);
            }
        } else if self.transmitting {
            self.stop_transmission()?;
        }
        Ok(voiced)
    }

    /// Ends the current transmission, flushing buffered audio into a
    /// final packet flagged end-of-transmission.
    pub fn stop_transmission(&mut self) -> Result<(), AudioError> {
        if !self.transmitting {
            return Ok(());
        }
        self.transmitting = false;
        self.encoder.terminate()?;
        if self.encoder.is_ready() {
            self.packetize(true);
        }
        Ok(())
    }

    /// Mixes one frame of inbound audio. In half-duplex push-to-talk the
    /// output is silenced while the key transmits.
    pub fn mix_frame(&mut self, out: &mut [i16]) -> usize {
        if self.config.half_duplex
            && self.config.transmit_mode == TransmitMode::PushToTalk
            && self.transmitting
        {
            out.fill(0);
            return 0;
        }
        self.output.mix_frame(out)
    }

    pub fn take_outgoing(&mut self) -> Vec<VoicePacket<Serverbound>> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn take_talk_events(&mut self) -> Vec<(u32, TalkState)> {
        self.output.take_talk_events()
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    pub fn set_push_to_talk(&mut self, pressed: bool) {
        self.push_to_talk = pressed;
    }

    pub fn set_transmit_mode(&mut self, mode: TransmitMode) -> Result<(), AudioError> {
        self.stop_transmission()?;
        self.config.transmit_mode = mode;
        self.vad_hangover = 0;
        Ok(())
    }

    /// Stamps outgoing packets with a shout target slot. Zero is ordinary
    /// talking; the id must fit the wire's five bits.
    pub fn set_voice_target(&mut self, id: u8) {
        assert!(id <= 31, "voice target {id} out of range");
        self.voice_target = id;
    }

    pub fn voice_target(&self) -> u8 {
        self.voice_target
    }

    pub fn set_bitrate(&mut self, bits_per_second: u32) -> Result<(), AudioError> {
        self.config.bitrate = bits_per_second;
        self.encoder.set_bitrate(bits_per_second)
    }

    /// Estimated wire rate in bits per second, voice payload plus
    /// per-packet datagram overhead.
    pub fn current_bandwidth(&self) -> u32 {
        let packets_per_second = 100 / self.encoder.frames_per_packet() as u32;
        // IP + UDP + crypt tag + voice header, roughly.
        let overhead_bytes = 20 + 8 + 4 + 8;
        self.config.bitrate + packets_per_second * overhead_bytes * 8
    }

    pub fn remove_speaker(&mut self, session: u32) {
        self.output.remove(session);
    }

    pub fn clear_playback(&mut self) {
        self.output.clear();
    }

    fn packetize(&mut self, end_of_transmission: bool) {
        let frames = self.encoder.buffered_frames() as u64;
        if let Some(bytes) = self.encoder.take_packet() {
            self.outgoing.push(VoicePacket::Audio {
                _dst: PhantomData,
                target: self.voice_target,
                session_id: (),
                seq_num: self.seq_num,
                payload: VoicePacketPayload::Opus(bytes.into(), end_of_transmission),
                position_info: None,
            });
            self.seq_num += frames;
        }
    }
}

impl DatagramHandler for AudioPipeline {
    fn handle_datagram(&mut self, packet: &VoicePacket<Clientbound>) -> Result<(), String> {
        if let VoicePacket::Audio {
            session_id,
            seq_num,
            target,
            payload,
            ..
        } = packet
        {
            self.output
                .handle_audio(*session_id, *seq_num, *target, payload);
        }
        Ok(())
    }
}

/// Subtracts the frame's mean sample value, centering the waveform on
/// zero so a biased capture source does not inflate the RMS level.
fn remove_dc(pcm: &[i16]) -> Vec<i16> {
    if pcm.is_empty() {
        return Vec::new();
    }
    let sum: i64 = pcm.iter().map(|sample| *sample as i64).sum();
    let mean = sum / pcm.len() as i64;
    pcm.iter()
        .map(|sample| (*sample as i64 - mean).clamp(i16::MIN as i64, i16::MAX as i64) as i16)
        .collect()
}

fn rms_level(pcm: &[i16]) -> f32 {
    if pcm.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = pcm
        .iter()
        .map(|sample| {
            let normalized = *sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();
    (sum_squares / pcm.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::{AudioPipeline, PipelineConfig, TransmitMode};
    use crate::audio::codec::{AudioError, FrameDecoder, FrameEncoder, FRAME_SIZE};
    use crate::audio::encode::VoiceEncoder;
    use crate::audio::output::VoiceOutput;
    use crate::protocol::dispatch::DatagramHandler;
    use mumble_protocol_2x::voice::{VoicePacket, VoicePacketPayload};
    use std::marker::PhantomData;

    struct OneBytePerPacketEncoder;

    impl FrameEncoder for OneBytePerPacketEncoder {
        fn encode(&mut self, _pcm: &[i16], out: &mut [u8]) -> Result<usize, AudioError> {
            out[0] = 0x42;
            Ok(1)
        }

        fn set_bitrate(&mut self, _bits_per_second: u32) -> Result<(), AudioError> {
            Ok(())
        }
    }

    struct ConstantDecoder;

    impl FrameDecoder for ConstantDecoder {
        fn decode(&mut self, _packet: Option<&[u8]>, pcm: &mut [i16]) -> Result<usize, AudioError> {
            for sample in pcm.iter_mut().take(FRAME_SIZE) {
                *sample = 7;
            }
            Ok(FRAME_SIZE)
        }
    }

    fn pipeline(config: PipelineConfig) -> AudioPipeline {
        let frames_per_packet = config.frames_per_packet;
        let encoder = VoiceEncoder::new(Box::new(OneBytePerPacketEncoder), frames_per_packet)
            .expect("legal packet length");
        let output = VoiceOutput::with_decoder_factory(Box::new(|| Ok(Box::new(ConstantDecoder))));
        AudioPipeline::with_parts(config, encoder, output)
    }

    fn loud_frame() -> [i16; FRAME_SIZE] {
        let mut frame = [0i16; FRAME_SIZE];
        for (index, sample) in frame.iter_mut().enumerate() {
            *sample = if index % 2 == 0 { 20_000 } else { -20_000 };
        }
        frame
    }

    fn silent_frame() -> [i16; FRAME_SIZE] {
        [0; FRAME_SIZE]
    }

    /// Continuous mode emits a packet every `frames_per_packet` frames
    /// with advancing sequence numbers.
    #[test]
    fn continuous_mode_packetizes_with_sequence() {
        // Arrange
        let mut pipeline = pipeline(PipelineConfig {
            transmit_mode: TransmitMode::Continuous,
            frames_per_packet: 2,
            ..PipelineConfig::default()
        });

        // Act
        for _ in 0..4 {
            pipeline.capture_frame(&silent_frame()).expect("capture");
        }

        // Assert
        let packets = pipeline.take_outgoing();
        assert_eq!(packets.len(), 2);
        let seqs = packets
            .iter()
            .map(|packet| match packet {
                VoicePacket::Audio { seq_num, .. } => *seq_num,
                _ => panic!("expected audio"),
            })
            .collect::<Vec<_>>();
        assert_eq!(seqs, vec![0, 2]);
    }

    /// Push-to-talk gates transmission on the key state and flags the
    /// final packet.
    #[test]
    fn push_to_talk_gates_and_terminates() {
        // Arrange
        let mut pipeline = pipeline(PipelineConfig {
            transmit_mode: TransmitMode::PushToTalk,
            frames_per_packet: 2,
            ..PipelineConfig::default()
        });

        // Act: key up, nothing goes out.
        assert!(!pipeline.capture_frame(&loud_frame()).expect("capture"));
        assert!(pipeline.take_outgoing().is_empty());

        // Key down for three frames, then up.
        pipeline.set_push_to_talk(true);
        for _ in 0..3 {
            assert!(pipeline.capture_frame(&loud_frame()).expect("capture"));
        }
        pipeline.set_push_to_talk(false);
        pipeline.capture_frame(&loud_frame()).expect("capture");

        // Assert: one full packet and one terminating packet.
        let packets = pipeline.take_outgoing();
        assert_eq!(packets.len(), 2);
        let ends = packets
            .iter()
            .map(|packet| match packet {
                VoicePacket::Audio {
                    payload: VoicePacketPayload::Opus(_, end),
                    ..
                } => *end,
                _ => panic!("expected opus audio"),
            })
            .collect::<Vec<_>>();
        assert_eq!(ends, vec![false, true]);
    }

    /// Voice activity keeps transmitting through the hangover window and
    /// stops after it runs out.
    #[test]
    fn voice_activity_honors_hangover() {
        // Arrange
        let mut pipeline = pipeline(PipelineConfig {
            transmit_mode: TransmitMode::VoiceActivity,
            frames_per_packet: 1,
            detection_threshold: 0.3,
            vad_hangover_frames: 2,
            ..PipelineConfig::default()
        });

        // Act / Assert
        assert!(pipeline.capture_frame(&loud_frame()).expect("capture"));
        assert!(pipeline.capture_frame(&silent_frame()).expect("capture"));
        assert!(pipeline.capture_frame(&silent_frame()).expect("capture"));
        assert!(!pipeline.capture_frame(&silent_frame()).expect("capture"));
        assert!(!pipeline.is_transmitting());
    }

    /// Outgoing packets carry the configured shout target.
    #[test]
    fn packets_carry_voice_target() {
        // Arrange
        let mut pipeline = pipeline(PipelineConfig {
            transmit_mode: TransmitMode::Continuous,
            frames_per_packet: 1,
            ..PipelineConfig::default()
        });
        pipeline.set_voice_target(5);

        // Act
        pipeline.capture_frame(&silent_frame()).expect("capture");

        // Assert
        match pipeline.take_outgoing().as_slice() {
            [VoicePacket::Audio { target, .. }] => assert_eq!(*target, 5),
            _ => panic!("expected one audio packet"),
        }
    }

    /// Voice targets above the wire's five bits fault.
    #[test]
    #[should_panic(expected = "out of range")]
    fn oversized_voice_target_faults() {
        let mut pipeline = pipeline(PipelineConfig::default());
        pipeline.set_voice_target(32);
    }

    /// Inbound datagrams reach the playback mix.
    #[test]
    fn inbound_audio_is_mixed() {
        // Arrange
        let mut pipeline = pipeline(PipelineConfig::default());
        let packet = VoicePacket::Audio {
            _dst: PhantomData,
            target: 0,
            session_id: 9,
            seq_num: 0,
            payload: VoicePacketPayload::Opus(vec![1].into(), false),
            position_info: None,
        };

        // Act
        pipeline.handle_datagram(&packet).expect("datagram");

        // Assert
        let mut frame = [0i16; FRAME_SIZE];
        assert_eq!(pipeline.mix_frame(&mut frame), 1);
        assert!(frame.iter().all(|sample| *sample == 7));
    }

    /// Half duplex silences playback while the push-to-talk key transmits.
    #[test]
    fn half_duplex_mutes_playback_while_talking() {
        // Arrange
        let mut pipeline = pipeline(PipelineConfig {
            transmit_mode: TransmitMode::PushToTalk,
            frames_per_packet: 2,
            half_duplex: true,
            ..PipelineConfig::default()
        });
        let packet = VoicePacket::Audio {
            _dst: PhantomData,
            target: 0,
            session_id: 9,
            seq_num: 0,
            payload: VoicePacketPayload::Opus(vec![1].into(), false),
            position_info: None,
        };
        pipeline.handle_datagram(&packet).expect("datagram");
        pipeline.set_push_to_talk(true);
        pipeline.capture_frame(&loud_frame()).expect("capture");

        // Act
        let mut frame = [9i16; FRAME_SIZE];
        let active = pipeline.mix_frame(&mut frame);

        // Assert
        assert_eq!(active, 0);
        assert!(frame.iter().all(|sample| *sample == 0));
    }

    /// Outside push-to-talk the half-duplex flag leaves playback alone
    /// even while transmitting.
    #[test]
    fn half_duplex_is_ignored_outside_push_to_talk() {
        // Arrange
        let mut pipeline = pipeline(PipelineConfig {
            transmit_mode: TransmitMode::Continuous,
            frames_per_packet: 2,
            half_duplex: true,
            ..PipelineConfig::default()
        });
        let packet = VoicePacket::Audio {
            _dst: PhantomData,
            target: 0,
            session_id: 9,
            seq_num: 0,
            payload: VoicePacketPayload::Opus(vec![1].into(), false),
            position_info: None,
        };
        pipeline.handle_datagram(&packet).expect("datagram");
        pipeline.capture_frame(&loud_frame()).expect("capture");
        assert!(pipeline.is_transmitting());

        // Act
        let mut frame = [0i16; FRAME_SIZE];
        let active = pipeline.mix_frame(&mut frame);

        // Assert
        assert_eq!(active, 1);
        assert!(frame.iter().all(|sample| *sample == 7));
    }

    /// A constant capture offset fools the level detector unless the
    /// preprocessor strips it first.
    #[test]
    fn preprocessor_removes_dc_bias() {
        // Arrange: a frame that is pure offset, no actual signal.
        let biased = [12_000i16; FRAME_SIZE];
        let config = PipelineConfig {
            transmit_mode: TransmitMode::VoiceActivity,
            frames_per_packet: 1,
            detection_threshold: 0.3,
            vad_hangover_frames: 0,
            ..PipelineConfig::default()
        };

        // Act
        let mut raw = pipeline(PipelineConfig {
            preprocessor_enabled: false,
            ..config.clone()
        });
        let mut cleaned = pipeline(config);
        let raw_voiced = raw.capture_frame(&biased).expect("capture");
        let cleaned_voiced = cleaned.capture_frame(&biased).expect("capture");

        // Assert
        assert!(raw_voiced);
        assert!(!cleaned_voiced);
    }

    /// Bandwidth reports payload bitrate plus per-packet overhead.
    #[test]
    fn bandwidth_includes_packet_overhead() {
        // Arrange
        let pipeline = pipeline(PipelineConfig {
            bitrate: 40_000,
            frames_per_packet: 2,
            ..PipelineConfig::default()
        });

        // Assert: 50 packets/s at 40 overhead bytes each.
        assert_eq!(pipeline.current_bandwidth(), 40_000 + 50 * 40 * 8);
    }
}
