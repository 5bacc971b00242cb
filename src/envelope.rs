use serde::*;

/// The JSON object that carries an encrypted payload to the remote service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The ciphertext produced by the guest.
    #[serde(rename = "dataEnc")]
    pub data_enc: String
}

impl Envelope {
    /// Wraps a ciphertext.
    pub fn new(data_enc: impl Into<String>) -> Self {
        Self {
            data_enc: data_enc.into()
        }
    }
}
