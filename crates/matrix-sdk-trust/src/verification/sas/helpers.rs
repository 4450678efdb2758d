// Copyright 2020 The Matrix.org Foundation C.I.C.
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

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use tracing::{trace, warn};
use vodozemac::{
    sas::{EstablishedSas, Mac},
    Curve25519PublicKey,
};

use crate::{
    error::SignatureError,
    identities::{CrossSigningIdentity, Device},
    olm::{to_signable_json, StaticAccountData},
    types::{
        ed25519_key_id,
        events::{CancelCode, MacContent, StartContent},
    },
    verification::{Emoji, FlowId},
};

/// The identities taking part in a SAS flow.
#[derive(Clone, Debug)]
pub(crate) struct SasIds {
    pub account: StaticAccountData,
    pub other_device: Device,
    /// Our own identity, only present if we trust it.
    pub own_identity: Option<CrossSigningIdentity>,
    pub other_identity: Option<CrossSigningIdentity>,
}

/// Calculate the commitment for an accept event from the public key and the
/// start event.
///
/// # Arguments
///
/// * `public_key` - Our own ephemeral public key that is used for the
///   interactive verification.
///
/// * `content` - The `m.key.verification.start` event content that started
///   the interactive verification process.
pub(crate) fn calculate_commitment(
    public_key: Curve25519PublicKey,
    content: &StartContent,
) -> Result<String, SignatureError> {
    let content = to_signable_json(content)?;

    let commitment = Sha256::new()
        .chain_update(public_key.to_base64())
        .chain_update(content)
        .finalize();

    Ok(STANDARD_NO_PAD.encode(commitment))
}

const EMOJI: [(&str, &str); 64] = [
    ("🐶", "Dog"),
    ("🐱", "Cat"),
    ("🦁", "Lion"),
    ("🐎", "Horse"),
    ("🦄", "Unicorn"),
    ("🐷", "Pig"),
    ("🐘", "Elephant"),
    ("🐰", "Rabbit"),
    ("🐼", "Panda"),
    ("🐓", "Rooster"),
    ("🐧", "Penguin"),
    ("🐢", "Turtle"),
    ("🐟", "Fish"),
    ("🐙", "Octopus"),
    ("🦋", "Butterfly"),
    ("🌷", "Flower"),
    ("🌳", "Tree"),
    ("🌵", "Cactus"),
    ("🍄", "Mushroom"),
    ("🌏", "Globe"),
    ("🌙", "Moon"),
    ("☁️", "Cloud"),
    ("🔥", "Fire"),
    ("🍌", "Banana"),
    ("🍎", "Apple"),
    ("🍓", "Strawberry"),
    ("🌽", "Corn"),
    ("🍕", "Pizza"),
    ("🎂", "Cake"),
    ("❤️", "Heart"),
    ("😀", "Smiley"),
    ("🤖", "Robot"),
    ("🎩", "Hat"),
    ("👓", "Glasses"),
    ("🔧", "Spanner"),
    ("🎅", "Santa"),
    ("👍", "Thumbs Up"),
    ("☂️", "Umbrella"),
    ("⌛", "Hourglass"),
    ("⏰", "Clock"),
    ("🎁", "Gift"),
    ("💡", "Light Bulb"),
    ("📕", "Book"),
    ("✏️", "Pencil"),
    ("📎", "Paperclip"),
    ("✂️", "Scissors"),
    ("🔒", "Lock"),
    ("🔑", "Key"),
    ("🔨", "Hammer"),
    ("☎️", "Telephone"),
    ("🏁", "Flag"),
    ("🚂", "Train"),
    ("🚲", "Bicycle"),
    ("✈️", "Aeroplane"),
    ("🚀", "Rocket"),
    ("🏆", "Trophy"),
    ("⚽", "Ball"),
    ("🎸", "Guitar"),
    ("🎺", "Trumpet"),
    ("🔔", "Bell"),
    ("⚓", "Anchor"),
    ("🎧", "Headphones"),
    ("📁", "Folder"),
    ("📌", "Pin"),
];

/// Get the emoji for a six bit index.
fn emoji_from_index(index: u8) -> Emoji {
    let (symbol, description) = EMOJI[usize::from(index & 0b11_1111)];
    Emoji { symbol, description }
}

/// Get the extra info that will be used when we generate bytes for the short
/// auth string.
///
/// The device that started the flow always comes first.
fn extra_info_sas(ids: &SasIds, sas: &EstablishedSas, flow_id: &str, we_started: bool) -> String {
    let ours = format!(
        "{}|{}|{}",
        ids.account.user_id,
        ids.account.device_id,
        sas.our_public_key().to_base64()
    );
    let theirs = format!(
        "{}|{}|{}",
        ids.other_device.user_id(),
        ids.other_device.device_id(),
        sas.their_public_key().to_base64()
    );

    let (first, second) = if we_started { (ours, theirs) } else { (theirs, ours) };

    format!("MATRIX_KEY_VERIFICATION_SAS|{first}|{second}|{flow_id}")
}

/// Get the indices of the seven emoji of the short auth string.
pub(crate) fn get_emoji_index(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    we_started: bool,
) -> [u8; 7] {
    sas.bytes(&extra_info_sas(ids, sas, flow_id, we_started)).emoji_indices()
}

/// Get the seven emoji of the short auth string.
pub(crate) fn get_emoji(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    we_started: bool,
) -> [Emoji; 7] {
    get_emoji_index(sas, ids, flow_id, we_started).map(emoji_from_index)
}

/// Get the three decimal numbers of the short auth string, each one between
/// 1000 and 9191.
pub(crate) fn get_decimal(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    we_started: bool,
) -> (u16, u16, u16) {
    sas.bytes(&extra_info_sas(ids, sas, flow_id, we_started)).decimals()
}

fn extra_mac_info_receive(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}{second_user}{second_device}{flow_id}",
        first_user = ids.other_device.user_id(),
        first_device = ids.other_device.device_id(),
        second_user = ids.account.user_id,
        second_device = ids.account.device_id,
    )
}

fn extra_mac_info_send(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}{second_user}{second_device}{flow_id}",
        first_user = ids.account.user_id,
        first_device = ids.account.device_id,
        second_user = ids.other_device.user_id(),
        second_device = ids.other_device.device_id(),
    )
}

/// Create the MAC content we send to the other side.
///
/// Our device key is always part of it, our master key only if we trust our
/// own identity.
pub(crate) fn get_mac_content(sas: &EstablishedSas, ids: &SasIds, flow_id: &FlowId) -> MacContent {
    let info = extra_mac_info_send(ids, flow_id.as_str());
    let mut mac = BTreeMap::new();

    let key_id = ed25519_key_id(ids.account.device_id.as_str());
    let key = ids.account.identity_keys.ed25519.to_base64();
    mac.insert(key_id.clone(), sas.calculate_mac(&key, &format!("{info}{key_id}")).to_base64());

    if let Some(own_identity) = &ids.own_identity {
        let master_key = own_identity.master_key();

        if let (Some(key_id), Some(key)) = (master_key.key_id(), master_key.get_first_key()) {
            let key_mac = sas.calculate_mac(&key.to_base64(), &format!("{info}{key_id}"));
            mac.insert(key_id.to_owned(), key_mac.to_base64());
        }
    }

    // The map is sorted, so are the key IDs.
    let key_ids = mac.keys().map(String::as_str).collect::<Vec<_>>().join(",");
    let keys = sas.calculate_mac(&key_ids, &format!("{info}KEY_IDS")).to_base64();

    MacContent { mac, keys, relation: flow_id.relation() }
}

/// Check the MAC content of the other side.
///
/// Returns the devices and identities whose keys were verified, a cancel code
/// if any of the MACs doesn't match.
pub(crate) fn receive_mac_event(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    content: &MacContent,
) -> Result<(Vec<Device>, Vec<CrossSigningIdentity>), CancelCode> {
    let info = extra_mac_info_receive(ids, flow_id);

    let key_ids = content.mac.keys().map(String::as_str).collect::<Vec<_>>().join(",");
    let keys_mac = Mac::from_base64(&content.keys).map_err(|_| CancelCode::InvalidMessage)?;

    sas.verify_mac(&key_ids, &format!("{info}KEY_IDS"), &keys_mac)
        .map_err(|_| CancelCode::KeyMismatch)?;

    trace!(%key_ids, "Checking the MACs of the other side");

    let mut verified_devices = Vec::new();
    let mut verified_identities = Vec::new();

    let device_key_id = ed25519_key_id(ids.other_device.device_id().as_str());

    for (key_id, key_mac) in &content.mac {
        let key_mac = Mac::from_base64(key_mac).map_err(|_| CancelCode::InvalidMessage)?;
        let key_info = format!("{info}{key_id}");

        if *key_id == device_key_id {
            let key = ids.other_device.ed25519_key().ok_or(CancelCode::KeyMismatch)?;

            sas.verify_mac(&key.to_base64(), &key_info, &key_mac)
                .map_err(|_| CancelCode::KeyMismatch)?;
            verified_devices.push(ids.other_device.clone());
        } else if let Some(identity) = ids
            .other_identity
            .as_ref()
            .filter(|i| i.master_key().key_id() == Some(key_id.as_str()))
        {
            let key = identity.master_key().get_first_key().ok_or(CancelCode::KeyMismatch)?;

            sas.verify_mac(&key.to_base64(), &key_info, &key_mac)
                .map_err(|_| CancelCode::KeyMismatch)?;
            verified_identities.push(identity.clone());
        } else {
            warn!(
                ?key_id,
                user_id = ?ids.other_device.user_id(),
                "Key ID in the MAC event can't be found in the store",
            );
        }
    }

    Ok((verified_devices, verified_identities))
}
