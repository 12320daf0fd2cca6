use std::cell::RefCell;
use std::net::ToSocketAddrs;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mumble_protocol_2x::control::{msgs, ControlPacket};
use mumble_protocol_2x::voice::{Clientbound, Serverbound};

use crate::audio::codec::{negotiate, NegotiatedCodec, CELT_7_VERSION, SAMPLE_RATE};
use crate::audio::encode::{apply_boost, resample_linear};
use crate::audio::output::talk_state_for_target;
use crate::audio::pipeline::AudioPipeline;
use crate::error::{DisconnectReason, SessionError};
use crate::model::channel::Channel;
use crate::model::server::{NoopSrvResolver, SrvResolver};
use crate::model::tree::ModelTree;
use crate::model::user::{TalkState, User};
use crate::model::whisper::{WhisperTarget, WhisperTargetRegistry};
use crate::net::connection::{ConnectionEvent, ConnectionManager, ServerInfo};
use crate::net::control::{NoopStreamConnector, StreamConnector};
use crate::net::reconnect::{ReconnectDecision, ReconnectionController};
use crate::protocol::dispatch::{DatagramHandler, HandlerToken, MessageDispatcher};
use crate::protocol::handlers::ModelUpdater;
use crate::session::config::SessionConfig;
use crate::session::events::{
    ChatMessage, ConnectionState, ObserverRegistry, ObserverToken, SessionEvent, SessionObserver,
    VoiceTargetMode,
};

/// One client session against one server: owns the connection, the
/// channel/user model, the audio pipeline and the observer fan-out.
///
/// The session is single-threaded by design. Network threads live inside
/// the [`ConnectionManager`]; everything here runs on whichever thread the
/// host calls [`Session::pump`] from, and observers are invoked on that
/// same thread.
pub struct Session {
    config: SessionConfig,
    connector: Arc<dyn StreamConnector>,
    resolver: Box<dyn SrvResolver>,

    state: ConnectionState,
    manager: Option<ConnectionManager>,
    remote: Option<(String, u16)>,
    session_id: Option<u32>,
    synchronized: bool,
    pending_error: Option<SessionError>,

    tree: Rc<RefCell<ModelTree>>,
    dispatcher: MessageDispatcher,
    pipeline: Option<Rc<RefCell<AudioPipeline>>>,
    pipeline_token: Option<HandlerToken>,
    codec: Option<NegotiatedCodec>,
    voice_target_id: u8,
    whisper_targets: WhisperTargetRegistry,

    observers: ObserverRegistry,
    reconnect: ReconnectionController,
    reconnect_due: Option<Instant>,
    online: bool,
}

impl Session {
    /// A session with no transport. Useful for hosts that inject their own
    /// connector later and for driving the model offline.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_connector(
            config,
            Arc::new(NoopStreamConnector),
            Box::new(NoopSrvResolver),
        )
    }

    /// A session speaking TLS over TCP, configured from the session's
    /// certificate and trust settings.
    #[cfg(not(feature = "coverage"))]
    pub fn new_with_tls(config: SessionConfig) -> Self {
        let connector = Arc::new(crate::net::control::TlsStreamConnector::new(
            config.tls_options(),
        ));
        Self::with_connector(config, connector, Box::new(NoopSrvResolver))
    }

    pub fn with_connector(
        config: SessionConfig,
        connector: Arc<dyn StreamConnector>,
        resolver: Box<dyn SrvResolver>,
    ) -> Self {
        let history = (
            config.local_mute_history.clone(),
            config.local_ignore_history.clone(),
        );
        Self {
            config,
            connector,
            resolver,
            state: ConnectionState::Disconnected,
            manager: None,
            remote: None,
            session_id: None,
            synchronized: false,
            pending_error: None,
            tree: Rc::new(RefCell::new(ModelTree::with_history(history.0, history.1))),
            dispatcher: MessageDispatcher::new(),
            pipeline: None,
            pipeline_token: None,
            codec: None,
            voice_target_id: 0,
            whisper_targets: WhisperTargetRegistry::new(),
            observers: ObserverRegistry::new(),
            reconnect: ReconnectionController::new(),
            reconnect_due: None,
            online: true,
        }
    }

    pub fn register_observer(&mut self, observer: Rc<RefCell<dyn SessionObserver>>) -> ObserverToken {
        self.observers.register(observer)
    }

    pub fn unregister_observer(&mut self, token: ObserverToken) {
        self.observers.unregister(token);
    }

    /// Starts a connection attempt. Does nothing while one is already in
    /// flight or established.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Ok(());
        }
        if self.config.server.host().trim().is_empty() {
            return Err(SessionError::new(
                "a server host is required",
                DisconnectReason::OtherError,
            ));
        }
        if self.config.server.username().trim().is_empty() {
            return Err(SessionError::new(
                "a username is required",
                DisconnectReason::OtherError,
            ));
        }

        let endpoint = self.config.server.resolve(&*self.resolver);
        self.remote = Some(endpoint.clone());

        // Fresh per-connection state. The previous tree stays readable
        // until here so hosts can render the last known roster.
        self.tree = Rc::new(RefCell::new(ModelTree::with_history(
            self.config.local_mute_history.clone(),
            self.config.local_ignore_history.clone(),
        )));
        self.dispatcher = MessageDispatcher::new();
        self.dispatcher
            .register_control(Rc::new(RefCell::new(ModelUpdater::new(Rc::clone(
                &self.tree,
            )))));
        self.pipeline = None;
        self.pipeline_token = None;
        self.codec = None;
        self.session_id = None;
        self.synchronized = false;
        self.pending_error = None;
        self.whisper_targets.clear();

        self.set_state(ConnectionState::Connecting);
        self.manager = Some(ConnectionManager::connect(
            Arc::clone(&self.connector),
            endpoint.0,
            endpoint.1,
            self.config.force_tcp || self.config.use_anonymizing_transport,
        ));
        Ok(())
    }

    /// Drains pending connection events and delivers session events to
    /// observers. Blocks for at most `wait` when nothing is pending.
    pub fn pump(&mut self, wait: Duration) {
        self.fire_due_reconnect();

        let mut budget = wait;
        loop {
            let event = match &self.manager {
                Some(manager) => manager.poll_event(budget),
                None => None,
            };
            let Some(event) = event else { break };
            budget = Duration::ZERO;
            self.handle_connection_event(event);
        }

        self.flush_model_events();
    }

    /// Tears the connection down and cancels any pending retry. Emits a
    /// final `Disconnected(None)` when a connection was up.
    pub fn disconnect(&mut self) {
        self.reconnect.cancel();
        self.reconnect_due = None;
        self.pending_error = None;
        if let Some(manager) = self.manager.take() {
            manager.disconnect();
        }
        self.pipeline = None;
        self.pipeline_token = None;
        self.synchronized = false;
        self.session_id = None;
        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            self.emit(SessionEvent::Disconnected(None));
        }
    }

    // ---- connection event handling ----

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Established => self.send_handshake(),
            ConnectionEvent::HandshakeFailed(chain) => {
                self.emit(SessionEvent::TlsHandshakeFailed(chain));
            }
            ConnectionEvent::Control(packet) => self.handle_control(packet),
            ConnectionEvent::Datagram(voice) => self.dispatcher.dispatch_datagram(&voice),
            ConnectionEvent::Disconnected(error) => self.finish_connection(error),
        }
    }

    fn send_handshake(&mut self) {
        let mut version = msgs::Version::new();
        version.version_v1 = Some(crate::PROTOCOL_VERSION);
        version.release = Some(self.config.client_name.clone());
        version.os = Some(std::env::consts::OS.to_string());
        if let Err(error) = self.send(ControlPacket::Version(Box::new(version))) {
            log::warn!("failed to send version: {error}");
            return;
        }

        let mut auth = msgs::Authenticate::new();
        auth.username = Some(self.config.server.username().to_string());
        let password = self.config.server.password();
        if !password.is_empty() {
            auth.password = Some(password.to_string());
        }
        auth.tokens = self.config.access_tokens.clone();
        auth.celt_versions = vec![CELT_7_VERSION];
        auth.opus = Some(self.config.use_opus);
        if let Err(error) = self.send(ControlPacket::Authenticate(Box::new(auth))) {
            log::warn!("failed to send authenticate: {error}");
        }
    }

    fn handle_control(&mut self, packet: ControlPacket<Clientbound>) {
        if let ControlPacket::Reject(msg) = &packet {
            self.pending_error = Some(SessionError::rejected((**msg).clone()));
            // Some servers hold the socket open after a reject. Close it
            // locally instead of waiting for them.
            if let Some(manager) = &self.manager {
                manager.disconnect();
            }
            return;
        }
        if let ControlPacket::UserRemove(msg) = &packet {
            if msg.session.is_some() && msg.session == self.session_id {
                self.pending_error = Some(SessionError::removed((**msg).clone()));
            }
        }

        self.dispatcher.dispatch_control(&packet);

        match packet {
            ControlPacket::ServerSync(msg) => self.on_server_sync(*msg),
            ControlPacket::CryptSetup(msg) => self.on_crypt_setup(*msg),
            ControlPacket::CodecVersion(msg) => self.on_codec_version(*msg),
            ControlPacket::PermissionDenied(msg) => {
                let reason = msg
                    .reason
                    .clone()
                    .or(msg.name.clone())
                    .unwrap_or_else(|| "permission denied".to_string());
                self.emit(SessionEvent::PermissionDenied(reason));
            }
            ControlPacket::TextMessage(msg) => self.on_text_message(*msg),
            _ => {}
        }
    }

    fn on_server_sync(&mut self, msg: msgs::ServerSync) {
        self.session_id = msg.session;
        self.synchronized = true;
        if let Some(manager) = &self.manager {
            manager.set_synchronized(true);
        }
        self.reconnect.cancel();
        self.reconnect_due = None;
        self.activate_audio();
        self.set_state(ConnectionState::Connected);
    }

    fn on_crypt_setup(&mut self, msg: msgs::CryptSetup) {
        if self.config.use_anonymizing_transport {
            log::debug!("anonymizing transport active, voice stays tunneled");
            return;
        }
        let (Some(key), Some(client_nonce), Some(server_nonce)) =
            (msg.key, msg.client_nonce, msg.server_nonce)
        else {
            log::debug!("crypt nonce resync requested, staying on current state");
            return;
        };
        let (Ok(key), Ok(encrypt_nonce), Ok(decrypt_nonce)) = (
            <[u8; 16]>::try_from(key.as_slice()),
            <[u8; 16]>::try_from(client_nonce.as_slice()),
            <[u8; 16]>::try_from(server_nonce.as_slice()),
        ) else {
            log::warn!("crypt setup carried malformed key material");
            return;
        };

        let Some((host, port)) = self.remote.clone() else {
            return;
        };
        let Some(manager) = &self.manager else { return };
        match (host.as_str(), port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(remote) => {
                    if let Err(error) =
                        manager.enable_datagram(key, encrypt_nonce, decrypt_nonce, remote)
                    {
                        log::warn!("datagram path unavailable, tunneling voice: {error}");
                    }
                }
                None => log::warn!("no usable address for {host}, tunneling voice"),
            },
            Err(error) => log::warn!("address lookup for {host} failed: {error}"),
        }
    }

    fn on_codec_version(&mut self, msg: msgs::CodecVersion) {
        match negotiate(&msg, self.config.use_opus) {
            Ok(codec) => {
                if self.codec != Some(codec) {
                    self.codec = Some(codec);
                    if self.pipeline.is_some() {
                        self.activate_audio();
                    }
                }
            }
            Err(error) => log::warn!("codec negotiation failed: {error}"),
        }
    }

    fn on_text_message(&mut self, msg: msgs::TextMessage) {
        let actor_name = msg
            .actor
            .and_then(|actor| self.tree.borrow().user(actor).map(|user| user.name.clone()));
        self.emit(SessionEvent::MessageLogged(ChatMessage {
            actor: msg.actor,
            actor_name,
            target_sessions: msg.session,
            target_channels: msg.channel_id,
            target_trees: msg.tree_id,
            body: msg.message.unwrap_or_default(),
        }));
    }

    fn finish_connection(&mut self, error: Option<SessionError>) {
        let error = self.pending_error.take().or(error);
        self.manager = None;
        self.pipeline = None;
        self.pipeline_token = None;
        self.synchronized = false;
        self.session_id = None;

        let reason = error.as_ref().map(SessionError::reason);
        match self
            .reconnect
            .on_disconnected(reason, self.config.auto_reconnect, self.online)
        {
            ReconnectDecision::RetryAfter(delay) => {
                self.reconnect_due = Some(Instant::now() + delay);
                self.set_state(ConnectionState::ConnectionLost);
            }
            ReconnectDecision::RetryWhenOnline => {
                self.reconnect_due = None;
                self.set_state(ConnectionState::ConnectionLost);
            }
            ReconnectDecision::Stay => self.set_state(ConnectionState::Disconnected),
        }
        self.emit(SessionEvent::Disconnected(error));
    }

    fn fire_due_reconnect(&mut self) {
        if self.state != ConnectionState::ConnectionLost {
            return;
        }
        if let Some(due) = self.reconnect_due {
            if Instant::now() >= due {
                self.reconnect_due = None;
                if let Err(error) = self.connect() {
                    log::warn!("reconnect attempt failed: {error}");
                }
            }
        }
    }

    fn activate_audio(&mut self) {
        let codec = match self.codec {
            Some(codec) => codec,
            None if self.config.use_opus => NegotiatedCodec::Opus,
            None => {
                log::warn!("no codec negotiated, voice disabled");
                return;
            }
        };

        // The pipeline validates the packet length, so the bitrate cap
        // computes overhead only after construction succeeds.
        match AudioPipeline::new(self.config.pipeline_config(), codec) {
            Ok(mut pipeline) => {
                if let Some(max) = self.manager.as_ref().and_then(|m| m.max_bandwidth()) {
                    let wire_rate = pipeline.current_bandwidth();
                    if wire_rate > max {
                        let overhead = wire_rate - self.config.bitrate;
                        let capped = max.saturating_sub(overhead).max(8_000);
                        match pipeline.set_bitrate(capped) {
                            Ok(()) => log::info!(
                                "capping voice bitrate to {capped} for server limit {max}"
                            ),
                            Err(error) => log::warn!("bitrate cap failed: {error}"),
                        }
                    }
                }
                pipeline.set_voice_target(self.voice_target_id);
                let shared = Rc::new(RefCell::new(pipeline));
                if let Some(token) = self.pipeline_token.take() {
                    self.dispatcher.unregister(token);
                }
                let handler: Rc<RefCell<dyn DatagramHandler>> = shared.clone();
                self.pipeline_token = Some(self.dispatcher.register_datagram(handler));
                self.pipeline = Some(shared);
            }
            Err(error) => log::error!("audio pipeline unavailable: {error}"),
        }
    }

    // ---- audio ----

    /// Feeds one 10 ms capture frame at the configured input rate. Encoded
    /// packets leave over the datagram path when it is up, tunneled
    /// otherwise.
    pub fn capture_audio(&mut self, pcm: &[i16]) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let Some(pipeline) = self.pipeline.clone() else {
            return Err(SessionError::not_synchronized());
        };

        let mut frame = if self.config.input_sample_rate != SAMPLE_RATE {
            resample_linear(pcm, self.config.input_sample_rate, SAMPLE_RATE)
        } else {
            pcm.to_vec()
        };
        if (self.config.amplitude_boost - 1.0).abs() > f32::EPSILON {
            apply_boost(&mut frame, self.config.amplitude_boost);
        }

        let (transmitting, packets) = {
            let mut pipeline = pipeline.borrow_mut();
            let transmitting = pipeline.capture_frame(&frame).map_err(|error| {
                SessionError::new(
                    format!("audio capture failed: {error}"),
                    DisconnectReason::OtherError,
                )
            })?;
            (transmitting, pipeline.take_outgoing())
        };

        if let Some(manager) = &self.manager {
            for packet in packets {
                manager.send_voice(packet)?;
            }
        }

        if let Some(session) = self.session_id {
            let state = if transmitting {
                talk_state_for_target(self.voice_target_id)
            } else {
                TalkState::Passive
            };
            self.tree.borrow_mut().set_talk_state(session, state);
        }
        self.flush_model_events();
        Ok(())
    }

    /// Mixes one playback frame from everyone currently speaking. Returns
    /// the number of active speakers; the buffer is zeroed when nobody is.
    pub fn render_audio(&mut self, out: &mut [i16]) -> usize {
        let Some(pipeline) = self.pipeline.clone() else {
            out.fill(0);
            return 0;
        };
        let (active, talk_events) = {
            let mut pipeline = pipeline.borrow_mut();
            (pipeline.mix_frame(out), pipeline.take_talk_events())
        };
        {
            let mut tree = self.tree.borrow_mut();
            for (session, state) in talk_events {
                tree.set_talk_state(session, state);
            }
        }
        self.flush_model_events();
        active
    }

    pub fn set_push_to_talk(&mut self, pressed: bool) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.borrow_mut().set_push_to_talk(pressed);
        }
    }

    // ---- server operations ----

    pub fn join_channel(&mut self, channel_id: u32) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::UserState::new();
        msg.session = self.session_id;
        msg.channel_id = Some(channel_id);
        self.send(ControlPacket::UserState(Box::new(msg)))
    }

    pub fn move_user(&mut self, session: u32, channel_id: u32) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::UserState::new();
        msg.session = Some(session);
        msg.channel_id = Some(channel_id);
        self.send(ControlPacket::UserState(Box::new(msg)))
    }

    pub fn create_channel(
        &mut self,
        parent: u32,
        name: &str,
        description: &str,
        position: i32,
        temporary: bool,
    ) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::ChannelState::new();
        msg.parent = Some(parent);
        msg.name = Some(name.to_string());
        if !description.is_empty() {
            msg.description = Some(description.to_string());
        }
        msg.position = Some(position);
        msg.temporary = Some(temporary);
        self.send(ControlPacket::ChannelState(Box::new(msg)))
    }

    pub fn remove_channel(&mut self, channel_id: u32) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::ChannelRemove::new();
        msg.channel_id = Some(channel_id);
        self.send(ControlPacket::ChannelRemove(Box::new(msg)))
    }

    pub fn link_channels(
        &mut self,
        channel_id: u32,
        add: &[u32],
        remove: &[u32],
    ) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::ChannelState::new();
        msg.channel_id = Some(channel_id);
        msg.links_add = add.to_vec();
        msg.links_remove = remove.to_vec();
        self.send(ControlPacket::ChannelState(Box::new(msg)))
    }

    /// Sends a text message to a channel, optionally including its whole
    /// subtree.
    pub fn send_channel_message(
        &mut self,
        channel_id: u32,
        include_subtree: bool,
        message: &str,
    ) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::TextMessage::new();
        if include_subtree {
            msg.tree_id = vec![channel_id];
        } else {
            msg.channel_id = vec![channel_id];
        }
        msg.message = Some(message.to_string());
        self.send(ControlPacket::TextMessage(Box::new(msg)))
    }

    pub fn send_user_message(&mut self, session: u32, message: &str) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::TextMessage::new();
        msg.session = vec![session];
        msg.message = Some(message.to_string());
        self.send(ControlPacket::TextMessage(Box::new(msg)))
    }

    /// Self-mute and self-deafen. Deafening implies muting.
    pub fn set_self_mute_deaf(&mut self, mute: bool, deaf: bool) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::UserState::new();
        msg.session = self.session_id;
        msg.self_mute = Some(mute || deaf);
        msg.self_deaf = Some(deaf);
        self.send(ControlPacket::UserState(Box::new(msg)))
    }

    /// Server-mutes or deafens another user. Requires server permission.
    pub fn set_user_mute_deaf(
        &mut self,
        session: u32,
        mute: bool,
        deaf: bool,
    ) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::UserState::new();
        msg.session = Some(session);
        msg.mute = Some(mute || deaf);
        msg.deaf = Some(deaf);
        self.send(ControlPacket::UserState(Box::new(msg)))
    }

    pub fn set_priority_speaker(
        &mut self,
        session: u32,
        enabled: bool,
    ) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::UserState::new();
        msg.session = Some(session);
        msg.priority_speaker = Some(enabled);
        self.send(ControlPacket::UserState(Box::new(msg)))
    }

    pub fn kick_user(
        &mut self,
        session: u32,
        reason: &str,
        ban: bool,
    ) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::UserRemove::new();
        msg.session = Some(session);
        if !reason.is_empty() {
            msg.reason = Some(reason.to_string());
        }
        msg.ban = Some(ban);
        self.send(ControlPacket::UserRemove(Box::new(msg)))
    }

    /// Registers a connected user with the server. `user_id` zero asks the
    /// server to assign one.
    pub fn register_user(&mut self, session: u32) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::UserState::new();
        msg.session = Some(session);
        msg.user_id = Some(0);
        self.send(ControlPacket::UserState(Box::new(msg)))
    }

    pub fn request_permissions(&mut self, channel_id: u32) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::PermissionQuery::new();
        msg.channel_id = Some(channel_id);
        self.send(ControlPacket::PermissionQuery(Box::new(msg)))
    }

    pub fn request_comments(&mut self, sessions: &[u32]) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::RequestBlob::new();
        msg.session_comment = sessions.to_vec();
        self.send(ControlPacket::RequestBlob(Box::new(msg)))
    }

    pub fn request_avatars(&mut self, sessions: &[u32]) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::RequestBlob::new();
        msg.session_texture = sessions.to_vec();
        self.send(ControlPacket::RequestBlob(Box::new(msg)))
    }

    pub fn request_channel_descriptions(
        &mut self,
        channels: &[u32],
    ) -> Result<(), SessionError> {
        self.ensure_synchronized()?;
        let mut msg = msgs::RequestBlob::new();
        msg.channel_description = channels.to_vec();
        self.send(ControlPacket::RequestBlob(Box::new(msg)))
    }

    /// Replaces the session's access tokens and pushes them to the server.
    pub fn set_access_tokens(&mut self, tokens: Vec<String>) -> Result<(), SessionError> {
        self.config.access_tokens = tokens;
        self.ensure_synchronized()?;
        match &self.manager {
            Some(manager) => manager.send_access_tokens(&self.config.access_tokens),
            None => Err(SessionError::not_connected()),
        }
    }

    // ---- whisper targets ----

    /// Registers a whisper target with the server. Returns the assigned
    /// target id, or `None` when all slots are taken.
    pub fn register_whisper_target(
        &mut self,
        target: WhisperTarget,
    ) -> Result<Option<u8>, SessionError> {
        self.ensure_synchronized()?;
        let wire = target.wire_target();
        let Some(id) = self.whisper_targets.append(target) else {
            return Ok(None);
        };
        let mut msg = msgs::VoiceTarget::new();
        msg.id = Some(u32::from(id));
        msg.targets = vec![wire];
        self.send(ControlPacket::VoiceTarget(Box::new(msg)))?;
        Ok(Some(id))
    }

    /// Frees a whisper slot locally and clears it on the server.
    pub fn unregister_whisper_target(&mut self, id: u8) -> Result<(), SessionError> {
        self.whisper_targets.free(id);
        self.ensure_synchronized()?;
        let mut msg = msgs::VoiceTarget::new();
        msg.id = Some(u32::from(id));
        self.send(ControlPacket::VoiceTarget(Box::new(msg)))
    }

    /// Switches outgoing voice to the given target id: 0 for normal talk,
    /// 1 through 30 for registered whisper targets, 31 for a server loopback.
    ///
    /// Panics when `id` is above 31.
    pub fn set_voice_target_id(&mut self, id: u8) {
        assert!(id <= 31, "voice target id out of range");
        if self.voice_target_id == id {
            return;
        }
        self.voice_target_id = id;
        if let Some(pipeline) = &self.pipeline {
            pipeline.borrow_mut().set_voice_target(id);
        }
        self.emit(SessionEvent::VoiceTargetChanged(VoiceTargetMode::from_id(
            id,
        )));
    }

    pub fn voice_target_id(&self) -> u8 {
        self.voice_target_id
    }

    // ---- local per-user controls ----

    /// Mutes another user locally. Persisted in the mute history when the
    /// user is registered with the server.
    pub fn set_local_mute(&mut self, session: u32, muted: bool) {
        let user_id = {
            let mut tree = self.tree.borrow_mut();
            tree.set_local_mute(session, muted);
            tree.user(session).and_then(|user| user.user_id)
        };
        if let Some(user_id) = user_id {
            update_history(&mut self.config.local_mute_history, user_id, muted);
        }
        if let Some(pipeline) = &self.pipeline {
            if muted {
                pipeline.borrow_mut().remove_speaker(session);
            }
        }
        self.flush_model_events();
    }

    pub fn set_local_ignore(&mut self, session: u32, ignored: bool) {
        let user_id = {
            let mut tree = self.tree.borrow_mut();
            tree.set_local_ignore(session, ignored);
            tree.user(session).and_then(|user| user.user_id)
        };
        if let Some(user_id) = user_id {
            update_history(&mut self.config.local_ignore_history, user_id, ignored);
        }
        self.flush_model_events();
    }

    // ---- configuration and environment ----

    /// Applies a new configuration. Returns true when the change needs the
    /// connection re-established; audio tuning and tokens apply in place.
    pub fn configure(&mut self, next: SessionConfig) -> bool {
        let old_pipeline = self.config.pipeline_config();
        let old_tokens = self.config.access_tokens.clone();
        if self.config.apply(next) {
            return true;
        }

        if self.synchronized && old_tokens != self.config.access_tokens {
            if let Some(manager) = &self.manager {
                if let Err(error) = manager.send_access_tokens(&self.config.access_tokens) {
                    log::warn!("failed to update access tokens: {error}");
                }
            }
        }
        if self.pipeline.is_some() && old_pipeline != self.config.pipeline_config() {
            self.activate_audio();
        }
        false
    }

    /// Tells the session whether the host currently has network access.
    /// A retry deferred for lack of connectivity fires when it returns.
    pub fn set_network_available(&mut self, online: bool) {
        self.online = online;
        if online && self.reconnect.on_connectivity_restored() {
            if let Err(error) = self.connect() {
                log::warn!("reconnect attempt failed: {error}");
            }
        }
    }

    // ---- accessors ----

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn channel(&self, id: u32) -> Option<Channel> {
        self.tree.borrow().channel(id).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.tree.borrow().channels()
    }

    pub fn user(&self, session: u32) -> Option<User> {
        self.tree.borrow().user(session).cloned()
    }

    pub fn users(&self) -> Vec<User> {
        self.tree.borrow().users()
    }

    pub fn users_in_channel(&self, channel_id: u32) -> Vec<u32> {
        self.tree.borrow().users_in_channel(channel_id)
    }

    pub fn tcp_latency_ms(&self) -> Option<f32> {
        self.manager.as_ref().and_then(|m| m.stats().tcp_latency_ms())
    }

    pub fn udp_latency_ms(&self) -> Option<f32> {
        self.manager.as_ref().and_then(|m| m.stats().udp_latency_ms())
    }

    /// Estimated outgoing voice bandwidth in bits per second, including
    /// framing overhead.
    pub fn current_bandwidth(&self) -> Option<u32> {
        self.pipeline
            .as_ref()
            .map(|pipeline| pipeline.borrow().current_bandwidth())
    }

    pub fn negotiated_codec(&self) -> Option<NegotiatedCodec> {
        self.codec
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.manager.as_ref().map(ConnectionManager::server_info)
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect.is_pending()
    }

    // ---- internals ----

    fn ensure_synchronized(&self) -> Result<(), SessionError> {
        if self.manager.is_none() {
            return Err(SessionError::not_connected());
        }
        if !self.synchronized {
            return Err(SessionError::not_synchronized());
        }
        Ok(())
    }

    fn send(&self, packet: ControlPacket<Serverbound>) -> Result<(), SessionError> {
        match &self.manager {
            Some(manager) => manager.send_control(packet),
            None => Err(SessionError::not_connected()),
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            self.state = next;
            self.emit(SessionEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.observers.emit(&event);
    }

    fn flush_model_events(&mut self) {
        let events = self.tree.borrow_mut().take_events();
        for event in events {
            self.observers.emit(&SessionEvent::from(event));
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            manager.disconnect();
        }
    }
}

fn update_history(history: &mut Vec<u32>, user_id: u32, present: bool) {
    if present {
        if !history.contains(&user_id) {
            history.push(user_id);
        }
    } else {
        history.retain(|held| *held != user_id);
    }
}
