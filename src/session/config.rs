use serde::{Deserialize, Serialize};

use crate::audio::pipeline::{PipelineConfig, TransmitMode};
use crate::model::server::Server;
use crate::net::control::TlsOptions;

/// Everything that shapes a session. Most fields can change while
/// connected; `requires_reconnect` names the ones that cannot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub server: Server,
    pub client_name: String,
    pub auto_reconnect: bool,
    pub use_opus: bool,
    pub force_tcp: bool,
    /// Route the control channel through an anonymizing overlay proxy.
    /// Voice stays tunneled over the control stream so no datagrams leak
    /// outside the overlay.
    pub use_anonymizing_transport: bool,
    pub access_tokens: Vec<String>,
    pub transmit_mode: TransmitMode,
    /// Sample rate of captured audio handed to the session. Input at
    /// other rates is resampled to the codec rate before encoding.
    pub input_sample_rate: u32,
    pub detection_threshold: f32,
    pub vad_hangover_frames: u32,
    pub amplitude_boost: f32,
    pub half_duplex: bool,
    /// Strip DC bias from captured audio before detection and encoding.
    pub preprocessor_enabled: bool,
    pub bitrate: u32,
    pub frames_per_packet: usize,
    /// PEM bundle with the client certificate and key.
    pub certificate_pem: Option<Vec<u8>>,
    pub certificate_password: Option<String>,
    /// Extra trust roots for server verification.
    pub trust_store: Option<String>,
    /// Accept any server certificate.
    pub allow_invalid_certificate: bool,
    /// Registered-user ids muted or ignored in past sessions.
    pub local_mute_history: Vec<u32>,
    pub local_ignore_history: Vec<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            server: Server::new(
                -1,
                String::new(),
                String::new(),
                0,
                String::new(),
                String::new(),
            ),
            client_name: "sotto".to_string(),
            auto_reconnect: false,
            use_opus: true,
            force_tcp: false,
            use_anonymizing_transport: false,
            access_tokens: Vec::new(),
            transmit_mode: pipeline.transmit_mode,
            input_sample_rate: crate::audio::codec::SAMPLE_RATE,
            detection_threshold: pipeline.detection_threshold,
            vad_hangover_frames: pipeline.vad_hangover_frames,
            amplitude_boost: 1.0,
            half_duplex: pipeline.half_duplex,
            preprocessor_enabled: pipeline.preprocessor_enabled,
            bitrate: pipeline.bitrate,
            frames_per_packet: pipeline.frames_per_packet,
            certificate_pem: None,
            certificate_password: None,
            trust_store: None,
            allow_invalid_certificate: false,
            local_mute_history: Vec::new(),
            local_ignore_history: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Whether switching from `self` to `next` needs the connection torn
    /// down and re-established. Identity, transport and trust changes do;
    /// audio tuning does not.
    pub fn requires_reconnect(&self, next: &SessionConfig) -> bool {
        self.server != next.server
            || self.client_name != next.client_name
            || self.use_opus != next.use_opus
            || self.force_tcp != next.force_tcp
            || self.use_anonymizing_transport != next.use_anonymizing_transport
            || self.certificate_pem != next.certificate_pem
            || self.certificate_password != next.certificate_password
            || self.trust_store != next.trust_store
            || self.allow_invalid_certificate != next.allow_invalid_certificate
            || self.local_mute_history != next.local_mute_history
            || self.local_ignore_history != next.local_ignore_history
    }

    /// Replaces this configuration and reports whether the change needs
    /// the connection re-established.
    pub fn apply(&mut self, next: SessionConfig) -> bool {
        let reconnect = self.requires_reconnect(&next);
        *self = next;
        reconnect
    }

    pub fn tls_options(&self) -> TlsOptions {
        TlsOptions {
            client_certificate_pem: self.certificate_pem.clone(),
            certificate_password: self.certificate_password.clone(),
            ca_file: self.trust_store.clone(),
            insecure: self.allow_invalid_certificate,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            transmit_mode: self.transmit_mode,
            frames_per_packet: self.frames_per_packet,
            bitrate: self.bitrate,
            detection_threshold: self.detection_threshold,
            vad_hangover_frames: self.vad_hangover_frames,
            half_duplex: self.half_duplex,
            preprocessor_enabled: self.preprocessor_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SessionConfig;
    use crate::audio::pipeline::TransmitMode;
    use crate::model::server::Server;

    fn config_for(host: &str) -> SessionConfig {
        SessionConfig {
            server: Server::new(
                1,
                "Test".to_string(),
                host.to_string(),
                64738,
                "alice".to_string(),
                String::new(),
            ),
            ..SessionConfig::default()
        }
    }

    /// Audio tuning changes apply in place.
    #[test]
    fn audio_changes_apply_live() {
        // Arrange
        let before = config_for("voice.example");
        let mut after = before.clone();

        // Act
        after.transmit_mode = TransmitMode::PushToTalk;
        after.bitrate = 72_000;
        after.detection_threshold = 0.5;
        after.preprocessor_enabled = false;
        after.auto_reconnect = true;

        // Assert
        assert!(!before.requires_reconnect(&after));
    }

    /// Identity and transport changes force a reconnect.
    #[test]
    fn identity_changes_force_reconnect() {
        // Arrange
        let before = config_for("voice.example");

        // Act / Assert
        let mut server_change = before.clone();
        server_change.server = Server::new(
            2,
            "Other".to_string(),
            "other.example".to_string(),
            64738,
            "alice".to_string(),
            String::new(),
        );
        assert!(before.requires_reconnect(&server_change));

        let mut transport_change = before.clone();
        transport_change.force_tcp = true;
        assert!(before.requires_reconnect(&transport_change));

        let mut overlay_change = before.clone();
        overlay_change.use_anonymizing_transport = true;
        assert!(before.requires_reconnect(&overlay_change));

        let mut trust_change = before.clone();
        trust_change.allow_invalid_certificate = true;
        assert!(before.requires_reconnect(&trust_change));
    }

    /// Configs round-trip through their serialized form.
    #[test]
    fn config_round_trips_through_json() {
        // Arrange
        let mut config = config_for("voice.example");
        config.access_tokens = vec!["crew".to_string()];
        config.local_mute_history = vec![50];

        // Act
        let json = serde_json::to_string(&config).expect("serialize");
        let parsed: SessionConfig = serde_json::from_str(&json).expect("deserialize");

        // Assert
        assert_eq!(parsed, config);
    }

    /// Missing fields fall back to defaults instead of failing.
    #[test]
    fn partial_config_uses_defaults() {
        // Act
        let parsed: SessionConfig = serde_json::from_str("{}").expect("deserialize");

        // Assert
        assert_eq!(parsed, SessionConfig::default());
    }
}
