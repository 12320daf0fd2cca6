pub mod codec;
pub mod encode;
pub mod mix;
pub mod output;
pub mod pipeline;

pub use codec::{
    decoder_for, encoder_for, negotiate, AudioError, FrameDecoder, FrameEncoder, NegotiatedCodec,
    CELT_7_VERSION, FRAME_SIZE, SAMPLE_RATE,
};
pub use encode::{apply_boost, resample_linear, VoiceEncoder};
pub use mix::mix_into;
pub use output::{talk_state_for_target, VoiceOutput};
pub use pipeline::{AudioPipeline, PipelineConfig, TransmitMode};
