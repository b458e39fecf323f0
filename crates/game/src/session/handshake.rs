//! Inbound message handling for the session: the encrypted-channel
//! signal, the protocol version exchange and capability setup, and the
//! remaining server-driven transitions. Each handler consumes one event
//! from the transport's inbound stream and moves the state machine
//! forward.

use crate::error::ClientError;
use crate::net::{Message, SetupParams, TransportEvent};
use crate::session::state::{ClientState, GameClient};

impl GameClient {
    /// Drain the transport's inbound queue, strictly in arrival order.
    /// Called once per tick before the state step.
    pub(crate) fn process_inbound(&mut self) {
        let Some(session) = &self.session else {
            return;
        };

        let events = session.transport.drain_events();
        for event in events {
            match event {
                TransportEvent::CryptoEstablished => self.on_crypto_established(),
                TransportEvent::Message(message) => self.handle_message(message),
                TransportEvent::Closed { reason } => {
                    self.on_disconnect(reason);
                    return;
                }
            }
            // A handler may have torn the session down mid-batch.
            if self.session.is_none() {
                return;
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::VersionAck { version } => self.on_version_ack(version),
            Message::SetupAck(params) => self.on_setup_ack(params),
            Message::KeepaliveReply { id } => {
                let now = self.now_ms();
                self.keepalive.on_reply(id, now);
            }
            Message::ResourcePush { name, digest, data } => {
                self.resources
                    .handle_push(&name, &digest, &data, &self.fetcher);
            }
            Message::LoginAck {
                account,
                characters,
            } => self.on_login_ack(account, characters),
            Message::PlayStart => self.on_play_start(),
            other => self.fail_to_idle(ClientError::Protocol(format!(
                "unexpected message from server: {other:?}"
            ))),
        }
    }

    /// The transport finished negotiating the encrypted channel.
    fn on_crypto_established(&mut self) {
        if self.state == ClientState::WaitCrypto {
            log::info!("encrypted channel established");
            self.state = ClientState::SendClientInfo;
        } else {
            log::warn!("crypto establishment signal in state {:?}", self.state);
        }
    }

    /// Setup parameters are only sent after the version is acknowledged,
    /// and the version only after crypto establishment (or immediately
    /// on a plain session); the state checks below keep that ordering.
    fn on_version_ack(&mut self, version: u32) {
        if self.state != ClientState::WaitVersion {
            return self.fail_to_idle(ClientError::Protocol(format!(
                "version ack in state {:?}",
                self.state
            )));
        }
        if version != self.config.protocol_version {
            return self.fail_to_idle(ClientError::Protocol(format!(
                "server speaks protocol version {version}, this client speaks {}",
                self.config.protocol_version
            )));
        }

        if let Some(session) = &mut self.session {
            session.protocol_version = version;
        }
        self.state = ClientState::VersionReceived;
    }

    fn on_setup_ack(&mut self, params: SetupParams) {
        if self.state != ClientState::WaitSetup {
            return self.fail_to_idle(ClientError::Protocol(format!(
                "setup ack in state {:?}",
                self.state
            )));
        }

        log::info!(
            "session setup: {}x{} map, sound {}, data at {}",
            params.map_width,
            params.map_height,
            if params.sound { "on" } else { "off" },
            params.data_url
        );

        self.map.width = params.map_width;
        self.map.height = params.map_height;
        self.files.begin_sync(&params.data_url);
        self.resources.set_data_url(&params.data_url);
        if let Some(session) = &mut self.session {
            session.setup = Some(params);
        }
        self.state = ClientState::RequestFileListing;
    }

    fn on_login_ack(&mut self, account: String, characters: Vec<String>) {
        if self.state != ClientState::WaitLogin {
            return self.fail_to_idle(ClientError::Protocol(format!(
                "login ack in state {:?}",
                self.state
            )));
        }

        log::info!(
            "logged in as {} ({} characters)",
            account,
            characters.len()
        );
        self.characters = characters;
        self.state = ClientState::CharacterSelect;
    }

    fn on_play_start(&mut self) {
        if self.state != ClientState::WaitForPlay {
            return self.fail_to_idle(ClientError::Protocol(format!(
                "play signal in state {:?}",
                self.state
            )));
        }
        log::info!("entering game");
        self.state = ClientState::Play;
    }
}
