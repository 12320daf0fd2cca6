use std::collections::{HashMap, VecDeque};

use mumble_protocol_2x::voice::VoicePacketPayload;

use crate::audio::codec::{decoder_for, AudioError, FrameDecoder, NegotiatedCodec, FRAME_SIZE};
use crate::audio::mix::mix_into;
use crate::model::user::TalkState;

/// Decoded samples a speaker may queue before old audio is dropped.
const MAX_PENDING_SAMPLES: usize = 48_000;
/// Longest run of lost frames the codec is asked to conceal.
const MAX_CONCEALED_FRAMES: u64 = 4;

type DecoderFactory = Box<dyn Fn() -> Result<Box<dyn FrameDecoder>, AudioError>>;

struct Speaker {
    decoder: Box<dyn FrameDecoder>,
    pending: VecDeque<i16>,
    next_seq: Option<u64>,
    talk_state: TalkState,
}

/// Receive side of the voice path: one decoder and sample queue per
/// speaking user, mixed down a frame at a time.
pub struct VoiceOutput {
    factory: DecoderFactory,
    speakers: HashMap<u32, Speaker>,
    talk_events: Vec<(u32, TalkState)>,
}

impl VoiceOutput {
    pub fn new(codec: NegotiatedCodec) -> Self {
        Self::with_decoder_factory(Box::new(move || decoder_for(codec)))
    }

    pub fn with_decoder_factory(factory: DecoderFactory) -> Self {
        Self {
            factory,
            speakers: HashMap::new(),
            talk_events: Vec::new(),
        }
    }

    /// Queues one inbound voice payload. The target byte the server
    /// stamped on the packet determines how the speaker is heard.
    pub fn handle_audio(
        &mut self,
        session: u32,
        seq_num: u64,
        target: u8,
        payload: &VoicePacketPayload,
    ) {
        let (bytes, end_of_transmission) = match payload {
            VoicePacketPayload::Opus(bytes, end) => (bytes, *end),
            _ => {
                log::debug!("dropping voice payload in unsupported format");
                return;
            }
        };

        let factory = &self.factory;
        let speaker = match self.speakers.entry(session) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => match factory() {
                Ok(decoder) => entry.insert(Speaker {
                    decoder,
                    pending: VecDeque::new(),
                    next_seq: None,
                    talk_state: TalkState::Passive,
                }),
                Err(error) => {
                    log::warn!("no decoder for session {session}: {error}");
                    return;
                }
            },
        };

        // A short gap in sequence numbers is concealed; a long one is
        // treated as a fresh transmission.
        if let Some(expected) = speaker.next_seq {
            if seq_num > expected {
                let lost = (seq_num - expected).min(MAX_CONCEALED_FRAMES);
                for _ in 0..lost {
                    let mut concealed = [0i16; FRAME_SIZE];
                    if let Ok(samples) = speaker.decoder.decode(None, &mut concealed) {
                        speaker.pending.extend(&concealed[..samples]);
                    }
                }
            }
        }

        let mut decoded = [0i16; FRAME_SIZE * 12];
        match speaker.decoder.decode(Some(bytes), &mut decoded) {
            Ok(samples) => {
                speaker.pending.extend(&decoded[..samples]);
                while speaker.pending.len() > MAX_PENDING_SAMPLES {
                    speaker.pending.pop_front();
                }
                speaker.next_seq = Some(seq_num + (samples / FRAME_SIZE) as u64);
            }
            Err(error) => {
                log::debug!("dropping undecodable frame from session {session}: {error}");
            }
        }

        let talk_state = if end_of_transmission {
            speaker.next_seq = None;
            TalkState::Passive
        } else {
            talk_state_for_target(target)
        };
        if speaker.talk_state != talk_state {
            speaker.talk_state = talk_state;
            self.talk_events.push((session, talk_state));
        }
    }

    /// Mixes one frame of queued audio from every speaker into `out`.
    /// Returns how many speakers contributed. Speakers that ran dry go
    /// passive.
    pub fn mix_frame(&mut self, out: &mut [i16]) -> usize {
        let mut sources = Vec::new();
        for (session, speaker) in &mut self.speakers {
            if speaker.pending.is_empty() {
                if speaker.talk_state != TalkState::Passive {
                    speaker.talk_state = TalkState::Passive;
                    self.talk_events.push((*session, TalkState::Passive));
                }
                continue;
            }
            let take = speaker.pending.len().min(out.len());
            sources.push(speaker.pending.drain(..take).collect::<Vec<_>>());
        }

        let active = sources.len();
        mix_into(out, sources.iter().map(|source| source.as_slice()));
        active
    }

    pub fn take_talk_events(&mut self) -> Vec<(u32, TalkState)> {
        std::mem::take(&mut self.talk_events)
    }

    pub fn remove(&mut self, session: u32) {
        self.speakers.remove(&session);
    }

    pub fn clear(&mut self) {
        self.speakers.clear();
        self.talk_events.clear();
    }
}

/// How a packet's target byte is heard on the receiving side.
pub fn talk_state_for_target(target: u8) -> TalkState {
    match target {
        0 => TalkState::Talking,
        31 => TalkState::Shouting,
        _ => TalkState::Whispering,
    }
}

#[cfg(test)]
mod tests {
    use super::{talk_state_for_target, VoiceOutput};
    use crate::audio::codec::{AudioError, FrameDecoder, FRAME_SIZE};
    use crate::model::user::TalkState;
    use mumble_protocol_2x::voice::VoicePacketPayload;

    /// Emits a constant-valued frame per packet; concealed frames come
    /// out as the sentinel value 1.
    struct FakeDecoder {
        value: i16,
    }

    impl FrameDecoder for FakeDecoder {
        fn decode(&mut self, packet: Option<&[u8]>, pcm: &mut [i16]) -> Result<usize, AudioError> {
            let value = match packet {
                Some(bytes) if bytes.is_empty() => {
                    return Err(AudioError::Codec("empty".to_string()))
                }
                Some(_) => self.value,
                None => 1,
            };
            for sample in pcm.iter_mut().take(FRAME_SIZE) {
                *sample = value;
            }
            Ok(FRAME_SIZE)
        }
    }

    fn output_with_value(value: i16) -> VoiceOutput {
        VoiceOutput::with_decoder_factory(Box::new(move || Ok(Box::new(FakeDecoder { value }))))
    }

    fn opus(byte: u8, end: bool) -> VoicePacketPayload {
        VoicePacketPayload::Opus(vec![byte].into(), end)
    }

    /// Two speakers mix into one frame; the count reports both.
    #[test]
    fn speakers_mix_into_one_frame() {
        // Arrange
        let mut output = output_with_value(10);
        output.handle_audio(1, 0, 0, &opus(1, false));
        output.handle_audio(2, 0, 0, &opus(1, false));

        // Act
        let mut frame = [0i16; FRAME_SIZE];
        let active = output.mix_frame(&mut frame);

        // Assert
        assert_eq!(active, 2);
        assert!(frame.iter().all(|sample| *sample == 20));
        // Both queues are drained now.
        assert_eq!(output.mix_frame(&mut frame), 0);
    }

    /// A short sequence gap is concealed with decoder-generated audio.
    #[test]
    fn short_gap_is_concealed() {
        // Arrange
        let mut output = output_with_value(10);
        output.handle_audio(1, 0, 0, &opus(1, false));
        let mut frame = [0i16; FRAME_SIZE];
        output.mix_frame(&mut frame);

        // Act: next expected frame is 1, frame 3 arrives.
        output.handle_audio(1, 3, 0, &opus(1, false));

        // Assert: two concealed frames precede the real one.
        output.mix_frame(&mut frame);
        assert!(frame.iter().all(|sample| *sample == 1));
        output.mix_frame(&mut frame);
        assert!(frame.iter().all(|sample| *sample == 1));
        output.mix_frame(&mut frame);
        assert!(frame.iter().all(|sample| *sample == 10));
    }

    /// The target byte drives the talk state, and the end flag returns
    /// the speaker to passive.
    #[test]
    fn talk_states_follow_target_and_end_flag() {
        // Arrange
        let mut output = output_with_value(10);

        // Act
        output.handle_audio(1, 0, 0, &opus(1, false));
        output.handle_audio(2, 0, 5, &opus(1, false));
        output.handle_audio(3, 0, 31, &opus(1, false));
        output.handle_audio(1, 1, 0, &opus(1, true));

        // Assert
        assert_eq!(
            output.take_talk_events(),
            vec![
                (1, TalkState::Talking),
                (2, TalkState::Whispering),
                (3, TalkState::Shouting),
                (1, TalkState::Passive),
            ]
        );
    }

    /// Repeated packets with the same target emit no duplicate events.
    #[test]
    fn unchanged_talk_state_is_silent() {
        // Arrange
        let mut output = output_with_value(10);

        // Act
        output.handle_audio(1, 0, 0, &opus(1, false));
        output.handle_audio(1, 1, 0, &opus(1, false));

        // Assert
        assert_eq!(output.take_talk_events(), vec![(1, TalkState::Talking)]);
    }

    /// Target byte mapping covers the three audible shapes.
    #[test]
    fn target_bytes_map_to_talk_states() {
        assert_eq!(talk_state_for_target(0), TalkState::Talking);
        assert_eq!(talk_state_for_target(1), TalkState::Whispering);
        assert_eq!(talk_state_for_target(30), TalkState::Whispering);
        assert_eq!(talk_state_for_target(31), TalkState::Shouting);
    }

    /// Removing a speaker drops queued audio.
    #[test]
    fn removed_speaker_goes_silent() {
        // Arrange
        let mut output = output_with_value(10);
        output.handle_audio(1, 0, 0, &opus(1, false));

        // Act
        output.remove(1);

        // Assert
        let mut frame = [0i16; FRAME_SIZE];
        assert_eq!(output.mix_frame(&mut frame), 0);
    }
}
