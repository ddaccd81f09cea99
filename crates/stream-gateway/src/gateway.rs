// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Process-wide state of the streaming gateway: the session table, the
//! pending bindings, the registered call contexts, the widget rooms and the
//! conversation logs. Each map is guarded on its own; session tasks own
//! their sockets and only touch these maps on creation and teardown.

use crate::assist::Conversation;
use crate::pending::PendingBindings;
use crate::roles;
use crate::rooms::{Rooms, WidgetEvent};
use crate::metrics;
use crate::settings::Settings;
use crate::types::{room_for, Direction, Registration, UNKNOWN_CALL, UNKNOWN_ROOM};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Age after which a pending binding is invisible to new SSRCs
pub const PENDING_TTL: Duration = Duration::from_secs(4);

/// Write side of one live session task
pub struct SessionHandle {
    pub call_uuid: String,
    pub room: String,
    pub audio_tx: mpsc::UnboundedSender<Bytes>,
    pub end_tx: mpsc::UnboundedSender<&'static str>,
}

pub struct Gateway {
    pub settings: Arc<Settings>,
    pub http: reqwest::Client,
    pub sessions: Mutex<HashMap<(Direction, u32), SessionHandle>>,
    pub pending: PendingBindings,
    pub registrations: Mutex<HashMap<String, Registration>>,
    pub rooms: Arc<Rooms>,
    pub conversations: Mutex<HashMap<String, Conversation>>,
}

impl Gateway {
    pub fn new(settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            http: reqwest::Client::new(),
            sessions: Mutex::new(HashMap::new()),
            pending: PendingBindings::new(PENDING_TTL),
            registrations: Mutex::new(HashMap::new()),
            rooms: Arc::new(Rooms::new()),
            conversations: Mutex::new(HashMap::new()),
        })
    }

    /// Handle `/register`: refresh the call context, enqueue a pending
    /// binding for `direction`, and announce the call to its room when it
    /// is new (or `force_start` asks for a re-announcement).
    pub fn register(
        &self,
        uuid: &str,
        extension: &str,
        caller: &str,
        caller_name: &str,
        direction: Option<Direction>,
        force_start: bool,
    ) {
        let known = {
            let mut registrations = self.registrations.lock();
            let known = registrations.contains_key(uuid);

            let registration = registrations.entry(uuid.to_owned()).or_default();
            registration.extension = extension.to_owned();
            registration.caller = caller.to_owned();
            registration.caller_name = caller_name.to_owned();
            registration.last_seen = Instant::now();

            known
        };

        if let Some(direction) = direction {
            self.pending.push(direction, uuid);
        }

        if !known || force_start {
            let registration = Registration {
                extension: extension.to_owned(),
                caller: caller.to_owned(),
                caller_name: caller_name.to_owned(),
                last_seen: Instant::now(),
            };

            let (from, to) = roles::from_to(self.settings.role_mode, &registration);

            self.rooms.publish(
                &room_for(extension),
                &WidgetEvent::CallStart {
                    uuid: uuid.to_owned(),
                    exten: extension.to_owned(),
                    caller: caller.to_owned(),
                    callername: caller_name.to_owned(),
                    from,
                    to,
                    timestamp: Utc::now(),
                },
            );
        }
    }

    /// Handle `/unregister`: drop the call context and any assistant state
    pub fn unregister(&self, uuid: &str) {
        self.registrations.lock().remove(uuid);
        self.conversations.lock().remove(uuid);
    }

    /// Resolve the context a brand-new SSRC on `direction` binds to: the
    /// head of the direction's pending FIFO if one is live, the unknown
    /// sentinel otherwise. The binding is permanent for the SSRC.
    pub fn adopt(&self, direction: Direction) -> (String, Registration) {
        match self.pending.pop(direction) {
            Some(uuid) => {
                let registration = self
                    .registrations
                    .lock()
                    .get(&uuid)
                    .cloned()
                    .unwrap_or_default();

                (uuid, registration)
            }
            None => (
                UNKNOWN_CALL.to_owned(),
                Registration {
                    extension: UNKNOWN_ROOM.to_owned(),
                    ..Default::default()
                },
            ),
        }
    }

    /// Remove a finished session; when it was the call's last one, drop the
    /// assistant state and tell the room the transcription is over.
    pub fn remove_session(&self, direction: Direction, ssrc: u32, call_uuid: &str, room: &str) {
        let was_last = {
            let mut sessions = self.sessions.lock();

            if sessions.remove(&(direction, ssrc)).is_none() {
                return;
            }

            !sessions
                .values()
                .any(|handle| handle.call_uuid == call_uuid)
        };

        metrics::SESSIONS_ACTIVE.dec();

        if was_last {
            self.conversations.lock().remove(call_uuid);
            self.rooms.publish(
                room,
                &WidgetEvent::SttEnd {
                    uuid: call_uuid.to_owned(),
                },
            );
        }
    }

    /// Ask every live session to end (process shutdown)
    pub fn drain(&self, reason: &'static str) {
        for handle in self.sessions.lock().values() {
            handle.end_tx.send(reason).ok();
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}
