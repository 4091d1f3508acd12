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

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use matrix_trust_qrcode::QrVerificationData;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use subtle::ConstantTimeEq;
use tracing::{debug, error, warn};

use super::{
    CancelCode, ReciprocateStartContent, StateListener, VerificationTransport,
    VerificationTxState, KEY_VERIFICATION_START,
};
use crate::{store::IdentityStore, types::TrustLevel, utilities::decode};

/// A single interactive QR code verification between two devices.
///
/// One transaction object lives on each side of the flow. The displaying
/// side holds the payload it rendered as a QR code; the scanning side feeds
/// the scanned text into
/// [`QrVerificationTransaction::user_has_scanned_remote_qr_code()`]. Trust
/// is only granted once the structural key checks pass *and* the random
/// secret from the code has round-tripped between both sides; neither check
/// alone is enough.
///
/// State transitions are strictly sequential and notify the registered
/// listeners synchronously, in registration order, on the thread performing
/// the transition.
pub struct QrVerificationTransaction {
    transaction_id: String,
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    other_user_id: OwnedUserId,
    other_device_id: OwnedDeviceId,
    /// The payload we are displaying, `None` if only the other side can show
    /// a QR code.
    qr_code_data: Option<QrVerificationData>,
    store: Arc<dyn IdentityStore>,
    transport: Arc<dyn VerificationTransport>,
    state: Mutex<VerificationTxState>,
    listeners: Mutex<Vec<StateListener>>,
}

impl std::fmt::Debug for QrVerificationTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrVerificationTransaction")
            .field("transaction_id", &self.transaction_id)
            .field("user_id", &self.user_id)
            .field("other_user_id", &self.other_user_id)
            .field("other_device_id", &self.other_device_id)
            .field("state", &self.state)
            .finish()
    }
}

impl QrVerificationTransaction {
    /// Create a new transaction for a single verification flow.
    pub fn new(
        transaction_id: String,
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        other_user_id: OwnedUserId,
        other_device_id: OwnedDeviceId,
        qr_code_data: Option<QrVerificationData>,
        store: Arc<dyn IdentityStore>,
        transport: Arc<dyn VerificationTransport>,
    ) -> Self {
        Self {
            transaction_id,
            user_id,
            device_id,
            other_user_id,
            other_device_id,
            qr_code_data,
            store,
            transport,
            state: Mutex::new(VerificationTxState::None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// The unique id of this verification flow.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// The current state of the transaction.
    pub fn state(&self) -> VerificationTxState {
        self.state.lock().unwrap().clone()
    }

    /// The reason this transaction was cancelled, if it was.
    pub fn cancelled_reason(&self) -> Option<CancelCode> {
        self.state().cancelled_reason()
    }

    /// The string to render as our QR code, if we have one to display.
    pub fn qr_code_text(&self) -> Option<String> {
        self.qr_code_data.as_ref().and_then(|d| d.to_encoded_string().ok())
    }

    /// Register a listener that is invoked on every state transition.
    ///
    /// Listeners run synchronously on the thread that triggered the
    /// transition; a panicking listener is caught and logged and never
    /// affects the transaction or the other listeners.
    pub fn add_listener(&self, listener: StateListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn set_state(&self, new_state: VerificationTxState) {
        *self.state.lock().unwrap() = new_state.clone();

        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            if let Err(e) = catch_unwind(AssertUnwindSafe(|| listener(&new_state))) {
                error!("Error while notifying a verification listener: {e:?}");
            }
        }
    }

    /// Process the text of a QR code the user scanned from the other side's
    /// screen.
    ///
    /// Validates the payload against our view of the world: the flow id must
    /// be ours, and every key in the payload must match what we know
    /// locally, looked up live rather than taken from the code. On success
    /// the other side's key material is marked as trusted and a start
    /// message carrying the scanned secret is sent, proving to the
    /// displaying side that we saw this exact code.
    ///
    /// Returns the cancel code the transaction was cancelled with if any
    /// check failed, `None` on success.
    pub fn user_has_scanned_remote_qr_code(&self, other_qr_code_text: &str) -> Option<CancelCode> {
        let other_qr_code_data = match QrVerificationData::from_encoded_string(other_qr_code_text)
        {
            Ok(data) => data,
            Err(e) => {
                debug!("The scanned QR code could not be decoded: {e}");
                return self.cancel_and_report(CancelCode::QrCodeInvalid);
            }
        };

        // A cross-user payload scanned while we're verifying one of our own
        // devices, or the other way around, means the user scanned a code
        // that was never meant for this verification partner.
        let is_self_verification = self.user_id == self.other_user_id;
        let mode_matches_parties = match &other_qr_code_data {
            QrVerificationData::Verification(_) => !is_self_verification,
            QrVerificationData::SelfVerification(_)
            | QrVerificationData::SelfVerificationNoMasterKey(_) => is_self_verification,
        };
        if !mode_matches_parties {
            debug!("The scanned QR code belongs to a different kind of verification partner");
            return self.cancel_and_report(CancelCode::UserMismatch);
        }

        if other_qr_code_data.flow_id() != self.transaction_id {
            debug!(
                expected = self.transaction_id,
                found = other_qr_code_data.flow_id(),
                "The scanned QR code belongs to a different verification flow"
            );
            return self.cancel_and_report(CancelCode::QrCodeInvalid);
        }

        let Some(my_master_key) = self.master_key_of(&self.user_id) else {
            debug!("We don't have a master cross-signing key to compare against");
            return self.cancel_and_report(CancelCode::MismatchedKeys);
        };

        // Check the displaying side's view of our master key.
        let their_view_of_my_master = match &other_qr_code_data {
            QrVerificationData::Verification(_)
            | QrVerificationData::SelfVerificationNoMasterKey(_) => {
                other_qr_code_data.second_key()
            }
            QrVerificationData::SelfVerification(_) => other_qr_code_data.first_key(),
        };

        if their_view_of_my_master.to_base64() != my_master_key {
            debug!("The other side has a different view of our master key");
            return self.cancel_and_report(CancelCode::MismatchedKeys);
        }

        // Now check the displaying side's own key material against our
        // local knowledge.
        let mut can_trust_other_master = false;
        let mut to_verify_device: Option<OwnedDeviceId> = None;

        match &other_qr_code_data {
            QrVerificationData::Verification(_) => {
                if Some(other_qr_code_data.first_key().to_base64())
                    != self.master_key_of(&self.other_user_id)
                {
                    debug!("The master key in the QR code doesn't match the other user's");
                    return self.cancel_and_report(CancelCode::MismatchedKeys);
                }

                can_trust_other_master = true;
            }
            QrVerificationData::SelfVerification(_) => {
                if Some(other_qr_code_data.second_key().to_base64())
                    != self.device_fingerprint_of(&self.user_id, &self.device_id)
                {
                    debug!("The QR code contains a wrong key for our own device");
                    return self.cancel_and_report(CancelCode::MismatchedKeys);
                }

                // The displaying device trusts the master key and we see the
                // same one, so we can trust it too.
                can_trust_other_master = true;
            }
            QrVerificationData::SelfVerificationNoMasterKey(_) => {
                if Some(other_qr_code_data.first_key().to_base64())
                    != self.device_fingerprint_of(&self.other_user_id, &self.other_device_id)
                {
                    debug!("The device key in the QR code doesn't match the known fingerprint");
                    return self.cancel_and_report(CancelCode::MismatchedKeys);
                }

                to_verify_device = Some(self.other_device_id.clone());
            }
        }

        if !can_trust_other_master && to_verify_device.is_none() {
            return self.cancel_and_report(CancelCode::MismatchedKeys);
        }

        // All checks passed; send the scanned secret back so the displaying
        // side can trust us.
        self.start(&other_qr_code_data.secret().encode());

        self.trust(can_trust_other_master, to_verify_device.as_deref(), true);

        None
    }

    /// Send the start message for this flow, embedding the shared secret of
    /// the QR code we scanned.
    ///
    /// # Panics
    ///
    /// Calling this on a transaction that already left the initial state is
    /// a bug in the caller and panics.
    pub(crate) fn start(&self, remote_secret: &str) {
        {
            let state = self.state.lock().unwrap();
            if *state != VerificationTxState::None {
                error!("Tried to start a QR verification from an invalid state");
                panic!("interactive key verification already started");
            }
        }

        self.set_state(VerificationTxState::Started);

        let content = self.transport.create_start_for_qr_code(
            &self.device_id,
            &self.transaction_id,
            remote_secret,
        );

        match serde_json::to_value(&content) {
            Ok(content) => {
                if let Err(e) = self.transport.send_to_other(KEY_VERIFICATION_START, content) {
                    warn!("Failed to send the verification start message: {e}");
                }
            }
            Err(e) => warn!("Failed to serialize the verification start message: {e}"),
        }
    }

    /// Handle the start message the other side sent after scanning our QR
    /// code.
    ///
    /// The secret in the message has to match the secret of the code we
    /// displayed; a match proves the other side really scanned this code and
    /// lets us trust it. A mismatch concludes the transaction without
    /// granting any trust.
    pub fn on_start_received(&self, start_req: &ReciprocateStartContent) {
        let Some(qr_code_data) = &self.qr_code_data else {
            // We never displayed a code, nobody can have scanned it.
            self.cancel_with_code(CancelCode::UnexpectedMessage);
            return;
        };

        let secrets_match = decode(&start_req.secret)
            .map(|received| {
                bool::from(received.as_slice().ct_eq(qr_code_data.secret().as_bytes()))
            })
            .unwrap_or(false);

        if secrets_match {
            debug!(
                transaction_id = self.transaction_id,
                "The other side proved that it scanned our QR code"
            );

            match qr_code_data {
                QrVerificationData::Verification(_) => self.trust(true, None, false),
                QrVerificationData::SelfVerification(_) => {
                    self.trust(false, Some(&self.other_device_id), false)
                }
                QrVerificationData::SelfVerificationNoMasterKey(_) => {
                    self.trust(true, None, true)
                }
            }
        } else {
            debug!("The secret in the start message doesn't match our QR code");
            self.set_state(VerificationTxState::OnCancelled(CancelCode::QrCodeInvalid));
        }
    }

    /// Cancel the verification on behalf of the user.
    pub fn cancel(&self) {
        self.cancel_with_code(CancelCode::User);
    }

    /// Cancel the verification with the given code.
    ///
    /// The local state transition is immediate; notifying the peer is
    /// best-effort and a failed send only gets logged.
    pub fn cancel_with_code(&self, code: CancelCode) {
        self.set_state(VerificationTxState::Cancelled(code));

        if let Err(e) = self.transport.cancel_transaction(
            &self.transaction_id,
            &self.other_user_id,
            &self.other_device_id,
            code,
        ) {
            warn!("Failed to notify the other side of the cancellation: {e}");
        }
    }

    fn cancel_and_report(&self, code: CancelCode) -> Option<CancelCode> {
        self.cancel_with_code(code);
        Some(code)
    }

    /// Record the trust this verification established and conclude the
    /// transaction.
    fn trust(
        &self,
        can_trust_other_master: bool,
        to_verify_device: Option<&DeviceId>,
        mark_my_master_key_trusted: bool,
    ) {
        if can_trust_other_master {
            self.store.set_user_keys_as_trusted(&self.other_user_id, true);
        }

        if let Some(device_id) = to_verify_device {
            self.store.set_device_trust(
                &self.other_user_id,
                device_id,
                TrustLevel::new(true, Some(true)),
            );
        }

        if mark_my_master_key_trusted && self.user_id == self.other_user_id {
            self.store.mark_master_key_locally_trusted(&self.user_id, true);
        }

        self.set_state(VerificationTxState::Verified);
    }

    fn master_key_of(&self, user_id: &UserId) -> Option<String> {
        let info = self.store.get_cross_signing_info(user_id)?;
        info.master_key()?.public_key_base64().map(ToOwned::to_owned)
    }

    fn device_fingerprint_of(&self, user_id: &UserId, device_id: &DeviceId) -> Option<String> {
        let device = self.store.get_device(user_id, device_id)?;
        device.fingerprint().map(ToOwned::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use matrix_trust_qrcode::{SelfVerificationNoMasterKey, VerificationData};
    use ruma::{device_id, serde::Base64, user_id};
    use serde_json::Value;
    use vodozemac::{Ed25519PublicKey, Ed25519SecretKey};

    use super::*;
    use crate::{
        identities::testing::TestIdentity,
        store::MemoryIdentityStore,
        types::CryptoDevice,
        verification::{generate_shared_secret, TransportError},
    };

    #[derive(Debug, Default)]
    struct MockTransport {
        sent: Mutex<Vec<(String, Value)>>,
        cancelled: Mutex<Vec<CancelCode>>,
    }

    impl MockTransport {
        fn last_start(&self) -> Option<ReciprocateStartContent> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(event_type, _)| event_type == KEY_VERIFICATION_START)
                .map(|(_, content)| serde_json::from_value(content.clone()).unwrap())
        }

        fn cancelled_codes(&self) -> Vec<CancelCode> {
            self.cancelled.lock().unwrap().clone()
        }
    }

    impl VerificationTransport for MockTransport {
        fn create_start_for_qr_code(
            &self,
            from_device: &DeviceId,
            transaction_id: &str,
            shared_secret: &str,
        ) -> ReciprocateStartContent {
            ReciprocateStartContent {
                from_device: from_device.to_owned(),
                transaction_id: transaction_id.to_owned(),
                method: crate::verification::RECIPROCATE_METHOD.to_owned(),
                secret: shared_secret.to_owned(),
            }
        }

        fn send_to_other(
            &self,
            event_type: &str,
            content: Value,
        ) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((event_type.to_owned(), content));
            Ok(())
        }

        fn cancel_transaction(
            &self,
            _transaction_id: &str,
            _other_user_id: &UserId,
            _other_device_id: &DeviceId,
            code: CancelCode,
        ) -> Result<(), TransportError> {
            self.cancelled.lock().unwrap().push(code);
            Ok(())
        }
    }

    const FLOW_ID: &str = "$verification_request";

    fn public_key(identity: &TestIdentity) -> Ed25519PublicKey {
        Ed25519PublicKey::from_base64(&identity.master_base64()).unwrap()
    }

    fn secret_payload(secret: &str) -> Base64 {
        Base64::parse(secret).unwrap()
    }

    struct Side {
        txn: QrVerificationTransaction,
        store: Arc<MemoryIdentityStore>,
        transport: Arc<MockTransport>,
    }

    /// Set up the two sides of a cross-user verification between Alice and
    /// Bob, both displaying a QR code of their own.
    fn cross_user_sides(
        alice: &TestIdentity,
        bob: &TestIdentity,
        alice_secret: &str,
        bob_secret: &str,
    ) -> (Side, Side) {
        let alice_key = public_key(alice);
        let bob_key = public_key(bob);

        let alice_payload: QrVerificationData = VerificationData::new(
            FLOW_ID.to_owned(),
            alice_key,
            bob_key,
            secret_payload(alice_secret),
        )
        .into();
        let bob_payload: QrVerificationData = VerificationData::new(
            FLOW_ID.to_owned(),
            bob_key,
            alice_key,
            secret_payload(bob_secret),
        )
        .into();

        let mut sides = Vec::new();

        for (own, other, payload) in
            [(alice, bob, alice_payload), (bob, alice, bob_payload)]
        {
            let store = Arc::new(MemoryIdentityStore::new());
            store.store_cross_signing_info(own.info.clone());
            store.store_cross_signing_info(other.info.clone());

            let transport = Arc::new(MockTransport::default());
            let txn = QrVerificationTransaction::new(
                FLOW_ID.to_owned(),
                own.user_id.clone(),
                device_id!("OWNDEVICE").to_owned(),
                other.user_id.clone(),
                device_id!("OTHERDEVICE").to_owned(),
                Some(payload),
                store.clone(),
                transport.clone(),
            );

            sides.push(Side { txn, store, transport });
        }

        let bob_side = sides.pop().unwrap();
        let alice_side = sides.pop().unwrap();
        (alice_side, bob_side)
    }

    #[test]
    fn cross_user_handshake() {
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));
        let alice_secret = generate_shared_secret();
        let bob_secret = generate_shared_secret();

        let (alice_side, bob_side) =
            cross_user_sides(&alice, &bob, &alice_secret, &bob_secret);

        // Alice scans the code Bob is displaying.
        let scanned = bob_side.txn.qr_code_text().unwrap();
        let result = alice_side.txn.user_has_scanned_remote_qr_code(&scanned);

        assert_eq!(result, None);
        assert_eq!(alice_side.txn.state(), VerificationTxState::Verified);
        assert!(alice_side.store.get_cross_signing_info(&bob.user_id).unwrap().is_trusted());

        // The scan produced a start message carrying Bob's secret.
        let start = alice_side.transport.last_start().expect("a start message should be sent");
        assert_eq!(start.secret, bob_secret);

        // Bob receives the start message and sees his own secret come back.
        bob_side.txn.on_start_received(&start);
        assert_eq!(bob_side.txn.state(), VerificationTxState::Verified);
        assert!(bob_side.store.get_cross_signing_info(&alice.user_id).unwrap().is_trusted());
    }

    #[test]
    fn mismatched_secret_cancels_without_trust() {
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));

        let (_, bob_side) = cross_user_sides(
            &alice,
            &bob,
            &generate_shared_secret(),
            &generate_shared_secret(),
        );

        let start = ReciprocateStartContent {
            from_device: device_id!("OWNDEVICE").to_owned(),
            transaction_id: FLOW_ID.to_owned(),
            method: crate::verification::RECIPROCATE_METHOD.to_owned(),
            secret: generate_shared_secret(),
        };

        bob_side.txn.on_start_received(&start);

        assert_eq!(
            bob_side.txn.state(),
            VerificationTxState::OnCancelled(CancelCode::QrCodeInvalid)
        );
        assert_eq!(bob_side.txn.cancelled_reason(), Some(CancelCode::QrCodeInvalid));
        assert!(!bob_side.store.get_cross_signing_info(&alice.user_id).unwrap().is_trusted());
        // This conclusion is local, no cancellation message goes out.
        assert!(bob_side.transport.cancelled_codes().is_empty());
    }

    #[test]
    fn garbage_qr_code_is_rejected() {
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));

        let (alice_side, _) = cross_user_sides(
            &alice,
            &bob,
            &generate_shared_secret(),
            &generate_shared_secret(),
        );

        let result = alice_side.txn.user_has_scanned_remote_qr_code("not a qr code payload");

        assert_eq!(result, Some(CancelCode::QrCodeInvalid));
        assert_eq!(
            alice_side.txn.state(),
            VerificationTxState::Cancelled(CancelCode::QrCodeInvalid)
        );
        assert_eq!(alice_side.transport.cancelled_codes(), vec![CancelCode::QrCodeInvalid]);
    }

    #[test]
    fn foreign_flow_id_is_rejected() {
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));

        let (alice_side, _) = cross_user_sides(
            &alice,
            &bob,
            &generate_shared_secret(),
            &generate_shared_secret(),
        );

        let foreign: QrVerificationData = VerificationData::new(
            "$a_different_request".to_owned(),
            public_key(&bob),
            public_key(&alice),
            secret_payload(&generate_shared_secret()),
        )
        .into();

        let result = alice_side
            .txn
            .user_has_scanned_remote_qr_code(&foreign.to_encoded_string().unwrap());

        assert_eq!(result, Some(CancelCode::QrCodeInvalid));
    }

    #[test]
    fn wrong_master_key_view_is_rejected() {
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));

        let (alice_side, _) = cross_user_sides(
            &alice,
            &bob,
            &generate_shared_secret(),
            &generate_shared_secret(),
        );

        // Bob displays a code with a wrong idea of Alice's master key.
        let wrong_key = Ed25519SecretKey::new().public_key();
        let payload: QrVerificationData = VerificationData::new(
            FLOW_ID.to_owned(),
            public_key(&bob),
            wrong_key,
            secret_payload(&generate_shared_secret()),
        )
        .into();

        let result = alice_side
            .txn
            .user_has_scanned_remote_qr_code(&payload.to_encoded_string().unwrap());

        assert_eq!(result, Some(CancelCode::MismatchedKeys));
        assert!(!alice_side.store.get_cross_signing_info(&bob.user_id).unwrap().is_trusted());
    }

    #[test]
    fn cross_user_code_in_self_verification_is_a_user_mismatch() {
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));

        let store = Arc::new(MemoryIdentityStore::new());
        store.store_cross_signing_info(alice.info.clone());

        let transport = Arc::new(MockTransport::default());
        // Alice is verifying one of her own devices.
        let txn = QrVerificationTransaction::new(
            FLOW_ID.to_owned(),
            alice.user_id.clone(),
            device_id!("OLDDEVICE").to_owned(),
            alice.user_id.clone(),
            device_id!("NEWDEVICE").to_owned(),
            None,
            store,
            transport,
        );

        // But she scans a cross-user verification code.
        let payload: QrVerificationData = VerificationData::new(
            FLOW_ID.to_owned(),
            public_key(&bob),
            public_key(&alice),
            secret_payload(&generate_shared_secret()),
        )
        .into();

        let result = txn.user_has_scanned_remote_qr_code(&payload.to_encoded_string().unwrap());
        assert_eq!(result, Some(CancelCode::UserMismatch));
    }

    #[test]
    fn self_verification_of_a_new_device() {
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let new_device_key = Ed25519SecretKey::new();
        let new_device_id = device_id!("NEWDEVICE");

        let store = Arc::new(MemoryIdentityStore::new());
        store.store_cross_signing_info(alice.info.clone());
        store.store_device(CryptoDevice::new(
            alice.user_id.clone(),
            new_device_id.to_owned(),
            &new_device_key.public_key().to_base64(),
        ));

        let transport = Arc::new(MockTransport::default());
        let txn = QrVerificationTransaction::new(
            FLOW_ID.to_owned(),
            alice.user_id.clone(),
            device_id!("OLDDEVICE").to_owned(),
            alice.user_id.clone(),
            new_device_id.to_owned(),
            None,
            store.clone(),
            transport.clone(),
        );

        // The new device, which doesn't trust the master key yet, displays
        // its device key first and the master key second.
        let payload: QrVerificationData = SelfVerificationNoMasterKey::new(
            FLOW_ID.to_owned(),
            new_device_key.public_key(),
            public_key(&alice),
            secret_payload(&generate_shared_secret()),
        )
        .into();

        let result = txn.user_has_scanned_remote_qr_code(&payload.to_encoded_string().unwrap());

        assert_eq!(result, None);
        assert_eq!(txn.state(), VerificationTxState::Verified);

        let device = store.get_device(&alice.user_id, new_device_id).unwrap();
        assert!(device.trust_level.is_verified());
    }

    #[test]
    #[should_panic(expected = "already started")]
    fn starting_twice_is_a_programming_error() {
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));

        let (alice_side, _) = cross_user_sides(
            &alice,
            &bob,
            &generate_shared_secret(),
            &generate_shared_secret(),
        );

        alice_side.txn.start("c2VjcmV0");
        alice_side.txn.start("c2VjcmV0");
    }

    #[test]
    fn listeners_observe_transitions_in_order() {
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));

        let (alice_side, bob_side) = cross_user_sides(
            &alice,
            &bob,
            &generate_shared_secret(),
            &generate_shared_secret(),
        );

        let observed = Arc::new(Mutex::new(Vec::new()));

        // The first listener panics on every notification; the others must
        // still run.
        alice_side.txn.add_listener(Box::new(|_| panic!("misbehaving listener")));

        let states = observed.clone();
        alice_side.txn.add_listener(Box::new(move |state| {
            states.lock().unwrap().push(state.clone());
        }));

        let scanned = bob_side.txn.qr_code_text().unwrap();
        alice_side.txn.user_has_scanned_remote_qr_code(&scanned);

        let observed = observed.lock().unwrap();
        assert_eq!(
            observed.as_slice(),
            [VerificationTxState::Started, VerificationTxState::Verified]
        );
    }
}
