// Copyright 2023 The Matrix.org Foundation C.I.C.
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

use base64::{engine::general_purpose::STANDARD_NO_PAD, DecodeError, Engine as _};

/// Encode bytes as unpadded base64, the encoding used for all binary values
/// that end up in Matrix events.
pub(crate) fn encode(input: impl AsRef<[u8]>) -> String {
    STANDARD_NO_PAD.encode(input)
}

/// Decode unpadded base64. Padded input is tolerated since some clients do
/// upload padded values.
pub(crate) fn decode(input: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD_NO_PAD.decode(input.trim_end_matches('='))
}
