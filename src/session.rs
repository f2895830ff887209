//! Live stream lifecycle as a plain state machine.
//!
//! [`Session`] never touches sockets or timers. It consumes transport events and
//! returns [`Action`]s for the runtime to execute, which keeps every transition
//! (including the reconnect/credential races) testable without a network.

use crate::credential::{Epoch, Versioned};

use feed::{ConnectionState, Credential, DataPoint, Event, StreamId, adapter};
use smallvec::SmallVec;
use url::Url;

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open a new transport. Always preceded by a `Close` of any previous one.
    Open { id: StreamId, url: Url },
    /// Close with the intentional `1000` code.
    Close { id: StreamId },
    ScheduleReconnect { epoch: Epoch, delay: Duration },
    CancelReconnect,
}

pub type Actions = SmallVec<[Action; 2]>;

#[derive(Debug, Default)]
pub enum Update {
    #[default]
    None,
    Data(DataPoint),
    Actions(Actions),
}

pub struct Session {
    base_url: Url,
    reconnect_delay: Duration,
    state: ConnectionState,
    epoch: Option<Epoch>,
    active: Option<StreamId>,
    next_id: u64,
    pending_reconnect: Option<Epoch>,
    error: Option<String>,
    malformed_frames: u64,
}

impl Session {
    pub fn new(base_url: Url, reconnect_delay: Duration) -> Self {
        Self {
            base_url,
            reconnect_delay,
            state: ConnectionState::Disconnected,
            epoch: None,
            active: None,
            next_id: 0,
            pending_reconnect: None,
            error: None,
            malformed_frames: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// User-facing connection error, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    pub fn start(&mut self, credential: Option<&Credential>, epoch: Epoch) -> Actions {
        let Some(credential) = credential else {
            return Actions::new();
        };

        let mut actions = self.release();

        self.next_id += 1;
        let id = StreamId(self.next_id);
        let url = adapter::stream_url(&self.base_url, credential);

        log::info!("opening stream {id} ({epoch})");

        self.active = Some(id);
        self.epoch = Some(epoch);
        self.state = ConnectionState::Connecting;
        actions.push(Action::Open { id, url });
        actions
    }

    /// Tears the session down; no reconnect can fire afterwards.
    pub fn stop(&mut self) -> Actions {
        let actions = self.release();

        if self.state != ConnectionState::Disconnected {
            log::info!("stream stopped");
        }
        self.epoch = None;
        self.error = None;
        self.state = ConnectionState::Disconnected;
        actions
    }

    pub fn update(&mut self, event: Event) -> Update {
        let id = event.stream_id();
        if self.active != Some(id) {
            log::debug!("ignoring event from superseded stream {id}");
            return Update::None;
        }

        match event {
            Event::Connected(_) => {
                log::info!("stream {id} connected");
                self.state = ConnectionState::Connected;
                self.error = None;
                Update::None
            }
            Event::DataReceived(_, point) => Update::Data(point),
            Event::Malformed(_, reason) => {
                self.malformed_frames += 1;
                log::warn!("stream {id} discarded malformed frame: {reason}");
                Update::None
            }
            Event::Error(_, reason) => {
                log::error!("stream {id} transport error: {reason}");
                self.error = Some(reason);
                Update::None
            }
            Event::Closed(_, code) => {
                self.active = None;
                self.state = ConnectionState::Disconnected;

                match self.epoch {
                    Some(epoch) if !code.is_intentional() => {
                        log::warn!(
                            "stream {id} closed with {code}, reconnecting in {:?}",
                            self.reconnect_delay
                        );
                        self.state = ConnectionState::Reconnecting;
                        self.pending_reconnect = Some(epoch);

                        let mut actions = Actions::new();
                        actions.push(Action::ScheduleReconnect {
                            epoch,
                            delay: self.reconnect_delay,
                        });
                        Update::Actions(actions)
                    }
                    _ => {
                        log::info!("stream {id} closed with {code}");
                        Update::None
                    }
                }
            }
        }
    }

    /// Fires when a scheduled reconnect elapses. Abandoned unless the timer is still
    /// the pending one and `current` still holds a credential of the same epoch.
    pub fn reconnect_due(&mut self, epoch: Epoch, current: &Versioned) -> Actions {
        if self.pending_reconnect != Some(epoch) {
            log::debug!("ignoring cancelled reconnect ({epoch})");
            return Actions::new();
        }
        self.pending_reconnect = None;

        if !current.is_current(epoch) {
            log::info!(
                "abandoning reconnect: credential changed ({epoch} -> {})",
                current.epoch
            );
            self.state = ConnectionState::Disconnected;
            return Actions::new();
        }

        self.start(current.credential.as_ref(), epoch)
    }

    fn release(&mut self) -> Actions {
        let mut actions = Actions::new();

        if self.pending_reconnect.take().is_some() {
            actions.push(Action::CancelReconnect);
        }
        if let Some(id) = self.active.take() {
            actions.push(Action::Close { id });
        }
        actions
    }
}
