// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::verification::CancelInfo;

/// The state of a SAS verification flow.
///
/// The `Sending*` states wait for the message of the state to be delivered to
/// the server, the following state is entered once it is.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SasState {
    /// The flow was just created.
    #[default]
    None,
    /// We started the flow, the start message waits to be sent out.
    SendingStart,
    /// We started the flow, waiting for the other side to accept it.
    Started,
    /// The other side started the flow, waiting for us to accept it.
    OnStarted,
    /// We accepted the flow, the accept message waits to be sent out.
    SendingAccept,
    /// The flow was accepted, either by us or by the other side.
    Accepted,
    /// Our ephemeral key waits to be sent out.
    SendingKey,
    /// Our ephemeral key was sent.
    KeySent,
    /// We received the ephemeral key of the other side.
    OnKeyReceived,
    /// The keys were exchanged, the short auth string can be presented.
    ShortCodeReady,
    /// The user confirmed that the short auth strings match.
    ShortCodeAccepted,
    /// Our MAC waits to be sent out.
    SendingMac,
    /// Our MAC was sent, waiting for the MAC of the other side.
    MacSent,
    /// Both MACs are known and valid, the result is being stored.
    Verifying,
    /// The flow finished successfully.
    Verified,
    /// We cancelled the flow.
    Cancelled(CancelInfo),
    /// The other side cancelled the flow.
    OnCancelled(CancelInfo),
}

impl SasState {
    /// Has the flow reached a state it can't leave anymore.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SasState::Verified | SasState::Cancelled(_) | SasState::OnCancelled(_))
    }

    /// Was the flow cancelled, either by us or by the other side.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SasState::Cancelled(_) | SasState::OnCancelled(_))
    }

    /// Get the info about the cancellation, if the flow was cancelled.
    pub fn cancel_info(&self) -> Option<&CancelInfo> {
        match self {
            SasState::Cancelled(info) | SasState::OnCancelled(info) => Some(info),
            _ => None,
        }
    }

    /// Can the short auth string be presented in this state.
    pub(super) fn shows_short_code(&self) -> bool {
        matches!(
            self,
            SasState::ShortCodeReady
                | SasState::ShortCodeAccepted
                | SasState::SendingMac
                | SasState::MacSent
                | SasState::Verifying
        )
    }

    /// Should a MAC of the other side be kept until we sent ours.
    pub(super) fn buffers_mac(&self) -> bool {
        matches!(
            self,
            SasState::SendingKey
                | SasState::KeySent
                | SasState::OnKeyReceived
                | SasState::ShortCodeReady
                | SasState::ShortCodeAccepted
                | SasState::SendingMac
        )
    }
}
