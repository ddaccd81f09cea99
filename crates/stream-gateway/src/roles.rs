// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Speaker labeling.
//!
//! Which RTP direction carries the caller and which the agent depends on
//! how the dialplan wires the snoops, so the mapping is a deployment
//! policy. "caller-in" means the IN port carries the caller's audio.

use crate::types::{Direction, Registration};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum RoleMode {
    #[default]
    #[serde(rename = "caller-in")]
    CallerIn,
    #[serde(rename = "agent-in")]
    AgentIn,
}

/// Display label of the caller side
pub fn caller_label(registration: &Registration) -> String {
    if !registration.caller_name.is_empty() {
        registration.caller_name.clone()
    } else if !registration.caller.is_empty() {
        registration.caller.clone()
    } else {
        "Caller".to_owned()
    }
}

/// Display label of the agent side
pub fn agent_label(registration: &Registration) -> String {
    if !registration.extension.is_empty() {
        registration.extension.clone()
    } else {
        "Agent".to_owned()
    }
}

/// Speaker label of a transcript that arrived on `direction`
pub fn speaker(mode: RoleMode, direction: Direction, registration: &Registration) -> String {
    if is_caller_side(mode, direction) {
        caller_label(registration)
    } else {
        agent_label(registration)
    }
}

/// Conversation role of a transcript that arrived on `direction`
pub fn conversation_role(mode: RoleMode, direction: Direction) -> &'static str {
    if is_caller_side(mode, direction) {
        "user"
    } else {
        "agent"
    }
}

/// The (from, to) pair of a call-start event
pub fn from_to(mode: RoleMode, registration: &Registration) -> (String, String) {
    match mode {
        RoleMode::CallerIn => (caller_label(registration), agent_label(registration)),
        RoleMode::AgentIn => (agent_label(registration), caller_label(registration)),
    }
}

fn is_caller_side(mode: RoleMode, direction: Direction) -> bool {
    matches!(
        (mode, direction),
        (RoleMode::CallerIn, Direction::In) | (RoleMode::AgentIn, Direction::Out)
    )
}
