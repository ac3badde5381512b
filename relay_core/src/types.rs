use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Sample encoding of an audio payload.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian linear PCM
    Pcm16,
    /// G.711 mu-law, the usual PSTN encoding
    Mulaw,
    /// G.711 A-law
    Alaw,
    Opus
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16
}

impl AudioFormat {
    pub const fn new(encoding: AudioEncoding, sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding,
            sample_rate,
            channels
        }
    }

    /// 8 kHz mono mu-law, what most telephony media streams deliver.
    pub const fn telephony() -> Self {
        Self::new(AudioEncoding::Mulaw, 8_000, 1)
    }

    /// 24 kHz mono PCM16, the common input format of realtime speech models.
    pub const fn pcm16_24k() -> Self {
        Self::new(AudioEncoding::Pcm16, 24_000, 1)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::telephony()
    }
}

/// One immutable unit of audio.
///
/// Fields are private so a frame cannot be altered after creation; ownership
/// moves from producer to consumer when the frame is enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    payload: Bytes,
    format: AudioFormat,
    sequence: u64
}

impl AudioFrame {
    pub fn new(payload: impl Into<Bytes>, format: AudioFormat, sequence: u64) -> Self {
        Self {
            payload: payload.into(),
            format,
            sequence
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// Identity of a configured provider (e.g. `openai-realtime`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A callable tool declared to the provider at session setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool arguments
    #[serde(default)]
    pub parameters: serde_json::Value
}

/// Per-call session configuration.
///
/// Built once when the call starts and shared behind an `Arc` for the rest of
/// the call. Reconnection replays the handshake from this exact value; a
/// different configuration means a new connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub provider: ProviderId,
    pub model: String,
    /// Format of the audio sent to the provider
    pub input_format: AudioFormat,
    /// Format the provider must synthesize back toward the caller
    pub output_format: AudioFormat,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>
}

impl SessionConfig {
    pub fn new(provider: impl Into<ProviderId>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            input_format: AudioFormat::telephony(),
            output_format: AudioFormat::telephony(),
            instructions: String::new(),
            voice: None,
            temperature: None,
            max_output_tokens: None,
            tools: Vec::new()
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_formats(mut self, input: AudioFormat, output: AudioFormat) -> Self {
        self.input_format = input;
        self.output_format = output;
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    /// Same conversation setup, pointed at another provider. Used on failover.
    pub fn for_provider(&self, provider: ProviderId, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            ..self.clone()
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Audio is flowing in both directions
    Active,
    Reconnecting,
    /// Reconnection exhausted; only an explicit reconnect recovers
    Error,
    Disconnected
}

impl ConnectionState {
    /// Whether audio may be forwarded to the transport right now.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Connected | Self::Active)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected)
    }

    pub fn gauge_value(self) -> f64 {
        match self {
            Self::Idle => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Active => 3.0,
            Self::Reconnecting => 4.0,
            Self::Error => 5.0,
            Self::Disconnected => 6.0
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderKind {
    /// End-to-end speech-to-speech model over one streaming session
    Realtime,
    /// STT, LLM and TTS stages stitched together
    Segmented
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CostTier {
    Economy,
    Standard,
    Premium
}

/// What a provider can do, as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub kind: ProviderKind,
    #[serde(default)]
    pub multimodal: bool,
    #[serde(default)]
    pub function_calling: bool,
    pub audio_encodings: Vec<AudioEncoding>,
    pub cost_tier: CostTier,
    /// Lower value wins ties
    #[serde(default)]
    pub priority: u32
}

impl ProviderCapabilities {
    pub fn supports_encoding(&self, encoding: AudioEncoding) -> bool {
        self.audio_encodings.contains(&encoding)
    }

    /// Only segmented pipelines keep a local replay buffer; realtime models
    /// retain their own conversation context across a reconnect.
    pub fn needs_replay_buffer(&self) -> bool {
        self.kind == ProviderKind::Segmented
    }
}
