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

//! Interactive verification between two devices.
//!
//! Currently only the QR code flow is implemented, see
//! [`qrcode::QrVerificationTransaction`].

pub mod qrcode;

use rand::{thread_rng, RngCore};
use ruma::{DeviceId, OwnedDeviceId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utilities::encode;

/// The event type of the message starting the actual verification.
pub const KEY_VERIFICATION_START: &str = "m.key.verification.start";

/// The verification method carried by a QR code start message.
pub const RECIPROCATE_METHOD: &str = "m.reciprocate.v1";

/// Error codes for cancelling a verification, as sent over the wire in a
/// `m.key.verification.cancel` message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelCode {
    /// The user cancelled the verification.
    User,
    /// The verification timed out.
    Timeout,
    /// The device received a message for an unknown transaction.
    UnknownTransaction,
    /// The device received an unexpected message.
    UnexpectedMessage,
    /// The scanned QR code was malformed or belongs to a different
    /// verification.
    QrCodeInvalid,
    /// A key did not match the expected one.
    MismatchedKeys,
    /// The verification involved the wrong user.
    UserMismatch,
}

impl CancelCode {
    /// The wire representation of this cancel code.
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelCode::User => "m.user",
            CancelCode::Timeout => "m.timeout",
            CancelCode::UnknownTransaction => "m.unknown_transaction",
            CancelCode::UnexpectedMessage => "m.unexpected_message",
            CancelCode::QrCodeInvalid => "m.qr_code.invalid",
            CancelCode::MismatchedKeys => "m.key_mismatch",
            CancelCode::UserMismatch => "m.user_error",
        }
    }
}

impl std::fmt::Display for CancelCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state a verification transaction is in.
///
/// The state only ever moves forward: from [`VerificationTxState::None`]
/// through [`VerificationTxState::Started`] into one of the terminal states.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationTxState {
    /// The transaction exists but no message has been exchanged yet.
    None,
    /// We have sent the start message.
    Started,
    /// The verification concluded successfully, trust has been established.
    Verified,
    /// The verification was cancelled on this side.
    Cancelled(CancelCode),
    /// The verification was concluded by a condition the other side is
    /// responsible for, no cancellation message is sent for it.
    OnCancelled(CancelCode),
}

impl VerificationTxState {
    /// The reason this transaction was cancelled, if it was.
    pub fn cancelled_reason(&self) -> Option<CancelCode> {
        match self {
            VerificationTxState::Cancelled(code) | VerificationTxState::OnCancelled(code) => {
                Some(*code)
            }
            _ => None,
        }
    }
}

/// A listener that gets invoked synchronously on every state transition of a
/// verification transaction.
pub type StateListener = Box<dyn Fn(&VerificationTxState) + Send + Sync>;

/// Error type for failures to hand a verification message to the transport
/// layer.
///
/// Sends are best-effort from the point of view of the state machine; a
/// failed send gets logged but never rolls back a local state transition.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The message could not be sent.
    #[error("sending the verification message failed: {0}")]
    Send(String),
}

/// The content of the `m.key.verification.start` message of the QR flow.
///
/// The secret proves to the displaying side that we scanned its QR code:
/// nobody else can know it without having seen the code.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReciprocateStartContent {
    /// The device sending the start message.
    pub from_device: OwnedDeviceId,
    /// The id of the verification flow this message belongs to.
    pub transaction_id: String,
    /// The verification method, always `m.reciprocate.v1` here.
    pub method: String,
    /// The shared secret from the scanned QR code, unpadded base64.
    pub secret: String,
}

/// The transport capabilities a verification transaction needs from the
/// embedding client.
///
/// Implementations deliver the messages over to-device events or in-room
/// messages; the transaction doesn't care which.
pub trait VerificationTransport: Send + Sync + std::fmt::Debug {
    /// Build the start message for a QR verification flow.
    fn create_start_for_qr_code(
        &self,
        from_device: &DeviceId,
        transaction_id: &str,
        shared_secret: &str,
    ) -> ReciprocateStartContent;

    /// Send a verification message to the other side.
    fn send_to_other(
        &self,
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<(), TransportError>;

    /// Notify the other side that the transaction has been cancelled.
    fn cancel_transaction(
        &self,
        transaction_id: &str,
        other_user_id: &UserId,
        other_device_id: &DeviceId,
        code: CancelCode,
    ) -> Result<(), TransportError>;
}

/// Generate the random shared secret that gets embedded into a QR code.
///
/// 32 random bytes, returned as unpadded base64 (43 characters).
pub fn generate_shared_secret() -> String {
    let mut secret = [0u8; 32];
    thread_rng().fill_bytes(&mut secret);

    encode(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_shape() {
        let secret = generate_shared_secret();
        assert_eq!(secret.len(), 43, "32 bytes of unpadded base64 are 43 characters");

        let other = generate_shared_secret();
        assert_ne!(secret, other, "Two generated secrets should never be equal");
    }

    #[test]
    fn cancel_code_wire_values() {
        assert_eq!(CancelCode::QrCodeInvalid.as_str(), "m.qr_code.invalid");
        assert_eq!(CancelCode::MismatchedKeys.as_str(), "m.key_mismatch");
        assert_eq!(CancelCode::User.to_string(), "m.user");
    }
}
