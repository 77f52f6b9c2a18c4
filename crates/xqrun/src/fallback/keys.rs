use rand::Rng;
use rand::distributions::Alphanumeric;

use super::Error;
use super::Result;

/// Length of each derived key.
const KEY_LEN: usize = 12;

/// Length of the shared key material.
pub const KEY_MATERIAL_LEN: usize = KEY_LEN * 3;

/// The per-session key triple, derived from one random string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    material: String,
}

impl SessionKeys {
    pub fn generate() -> Self {
        let material = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(KEY_MATERIAL_LEN)
            .map(char::from)
            .collect();
        Self { material }
    }

    /// Derives the keys from material received from the peer.
    pub fn from_material(material: &str) -> Result<Self> {
        if material.len() != KEY_MATERIAL_LEN || !material.is_ascii() {
            return Err(Error::BadKeys(format!(
                "expected {} ascii characters, got {:?}",
                KEY_MATERIAL_LEN, material
            )));
        }
        Ok(Self { material: material.to_string() })
    }

    /// The raw material, as sent in the activation request.
    pub fn material(&self) -> &str {
        &self.material
    }

    /// Pointer key for requests. Replies use it with a `-return` suffix.
    pub fn message_key(&self) -> &str {
        &self.material[..KEY_LEN]
    }

    /// Key of the readiness sentinel.
    pub fn activation_key(&self) -> &str {
        &self.material[KEY_LEN..KEY_LEN * 2]
    }

    /// Key handed to the cipher.
    pub fn crypt_key(&self) -> &str {
        &self.material[KEY_LEN * 2..]
    }
}
