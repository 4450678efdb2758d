// Copyright 2022 The Matrix.org Foundation C.I.C.
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


//! Contents of the `m.secret.request` and `m.secret.send` to-device events.

use std::fmt;

use ruma::{OwnedDeviceId, OwnedTransactionId};
use serde::{Deserialize, Serialize};

use super::{verification::string_enum, EventType};

string_enum! {
    /// The name of a secret our devices share with each other.
    SecretName {
        /// The private part of the cross-signing master key.
        CrossSigningMasterKey => "m.cross_signing.master",
        /// The private part of the cross-signing user-signing key.
        CrossSigningUserSigningKey => "m.cross_signing.user_signing",
        /// The private part of the cross-signing self-signing key.
        CrossSigningSelfSigningKey => "m.cross_signing.self_signing",
        /// The recovery key of the server-side room key backup.
        RecoveryKey => "m.megolm_backup.v1",
    }
}

string_enum! {
    /// The action of an `m.secret.request` event.
    SecretRequestAction {
        /// Request a secret.
        Request => "request",
        /// Cancel a previously sent request.
        RequestCancellation => "request_cancellation",
    }
}

/// The `m.secret.request` to-device content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SecretRequestContent {
    /// Is this a request or the cancellation of a request.
    pub action: SecretRequestAction,
    /// The requested secret, only present for requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<SecretName>,
    /// The ID of the request, a cancellation has the ID of the request it
    /// cancels.
    pub request_id: OwnedTransactionId,
    /// The device that requests the secret.
    pub requesting_device_id: OwnedDeviceId,
}

impl EventType for SecretRequestContent {
    const EVENT_TYPE: &'static str = "m.secret.request";
}

/// The `m.secret.send` to-device content.
#[derive(Clone, Deserialize, Serialize)]
pub struct SecretSendContent {
    /// The ID of the request this secret answers.
    pub request_id: OwnedTransactionId,
    /// The secret itself.
    pub secret: String,
}

impl fmt::Debug for SecretSendContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretSendContent")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

impl EventType for SecretSendContent {
    const EVENT_TYPE: &'static str = "m.secret.send";
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{SecretName, SecretRequestAction, SecretRequestContent, SecretSendContent};

    #[test]
    fn secret_request_names_the_secret() {
        let json = json!({
            "action": "request",
            "name": "m.cross_signing.self_signing",
            "request_id": "randomly_generated_id_9573",
            "requesting_device_id": "ABCDEFG",
        });

        let content: SecretRequestContent = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(content.action, SecretRequestAction::Request);
        assert_eq!(content.name, Some(SecretName::CrossSigningSelfSigningKey));
        assert_eq!(serde_json::to_value(&content).unwrap(), json);

        let custom: SecretRequestContent = serde_json::from_value(json!({
            "action": "request",
            "name": "org.example.secret",
            "request_id": "randomly_generated_id_9574",
            "requesting_device_id": "ABCDEFG",
        }))
        .unwrap();
        assert_eq!(custom.name, Some(SecretName::Other("org.example.secret".to_owned())));
    }

    #[test]
    fn secrets_are_not_logged() {
        let content = SecretSendContent {
            request_id: "randomly_generated_id_9573".into(),
            secret: "ThisIsASecretDon'tTellAnyone".to_owned(),
        };

        assert!(!format!("{content:?}").contains("ThisIsASecret"));
    }
}
