use std::fmt;

use mumble_protocol_2x::control::msgs;

pub const SAMPLE_RATE: u32 = 48_000;
/// Samples per 10 ms capture frame.
pub const FRAME_SIZE: usize = 480;
/// Bitstream version advertised for the legacy CELT 0.7 codec.
pub const CELT_7_VERSION: i32 = 0x8000_000bu32 as i32;

#[derive(Debug)]
pub enum AudioError {
    /// The negotiated codec has no local implementation.
    Unsupported(String),
    Codec(String),
    InvalidInput(String),
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioError::Unsupported(what) => write!(f, "unsupported codec: {what}"),
            AudioError::Codec(cause) => write!(f, "codec failure: {cause}"),
            AudioError::InvalidInput(cause) => write!(f, "invalid audio input: {cause}"),
        }
    }
}

impl std::error::Error for AudioError {}

impl From<opus::Error> for AudioError {
    fn from(error: opus::Error) -> Self {
        AudioError::Codec(error.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiatedCodec {
    Opus,
    CeltAlpha,
    CeltBeta,
}

/// Picks the codec both sides can use. Opus wins whenever the server
/// supports it and the client has not opted out; otherwise the server's
/// preferred CELT flavor is chosen, provided it speaks the one legacy
/// bitstream version we advertise.
pub fn negotiate(msg: &msgs::CodecVersion, client_opus: bool) -> Result<NegotiatedCodec, AudioError> {
    if client_opus && msg.opus.unwrap_or(false) {
        return Ok(NegotiatedCodec::Opus);
    }
    let alpha = msg.alpha.unwrap_or(0);
    let beta = msg.beta.unwrap_or(0);
    if msg.prefer_alpha.unwrap_or(true) && alpha == CELT_7_VERSION {
        Ok(NegotiatedCodec::CeltAlpha)
    } else if beta == CELT_7_VERSION {
        Ok(NegotiatedCodec::CeltBeta)
    } else if alpha == CELT_7_VERSION {
        Ok(NegotiatedCodec::CeltAlpha)
    } else {
        Err(AudioError::Unsupported(format!(
            "no common codec (alpha {alpha:#x}, beta {beta:#x}, opus {})",
            msg.opus.unwrap_or(false)
        )))
    }
}

/// Compresses one mono PCM frame into a packet payload.
pub trait FrameEncoder {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, AudioError>;
    fn set_bitrate(&mut self, bits_per_second: u32) -> Result<(), AudioError>;
}

/// Decompresses one payload into mono PCM. `None` asks the codec to
/// conceal a lost packet.
pub trait FrameDecoder {
    fn decode(&mut self, packet: Option<&[u8]>, pcm: &mut [i16]) -> Result<usize, AudioError>;
}

pub struct OpusFrameEncoder {
    inner: opus::Encoder,
}

impl OpusFrameEncoder {
    pub fn new(bits_per_second: u32) -> Result<Self, AudioError> {
        let mut inner = opus::Encoder::new(
            SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Voip,
        )?;
        inner.set_bitrate(opus::Bitrate::Bits(bits_per_second as i32))?;
        Ok(Self { inner })
    }
}

impl FrameEncoder for OpusFrameEncoder {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, AudioError> {
        Ok(self.inner.encode(pcm, out)?)
    }

    fn set_bitrate(&mut self, bits_per_second: u32) -> Result<(), AudioError> {
        Ok(self.inner.set_bitrate(opus::Bitrate::Bits(bits_per_second as i32))?)
    }
}

pub struct OpusFrameDecoder {
    inner: opus::Decoder,
}

impl OpusFrameDecoder {
    pub fn new() -> Result<Self, AudioError> {
        Ok(Self {
            inner: opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)?,
        })
    }
}

impl FrameDecoder for OpusFrameDecoder {
    fn decode(&mut self, packet: Option<&[u8]>, pcm: &mut [i16]) -> Result<usize, AudioError> {
        Ok(self.inner.decode(packet.unwrap_or(&[]), pcm, false)?)
    }
}

pub fn encoder_for(
    codec: NegotiatedCodec,
    bits_per_second: u32,
) -> Result<Box<dyn FrameEncoder>, AudioError> {
    match codec {
        NegotiatedCodec::Opus => Ok(Box::new(OpusFrameEncoder::new(bits_per_second)?)),
        NegotiatedCodec::CeltAlpha | NegotiatedCodec::CeltBeta => Err(AudioError::Unsupported(
            "celt encoding is not available".to_string(),
        )),
    }
}

pub fn decoder_for(codec: NegotiatedCodec) -> Result<Box<dyn FrameDecoder>, AudioError> {
    match codec {
        NegotiatedCodec::Opus => Ok(Box::new(OpusFrameDecoder::new()?)),
        NegotiatedCodec::CeltAlpha | NegotiatedCodec::CeltBeta => Err(AudioError::Unsupported(
            "celt decoding is not available".to_string(),
        )),
    }
}
