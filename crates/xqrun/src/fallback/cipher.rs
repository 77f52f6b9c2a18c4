/// Transforms store bodies on their way in and out of the shared store.
///
/// The store is readable by anything on the origin, so a host may plug in
/// real encryption here. `key` is the session's crypt key.
pub trait Cipher: Send + Sync + 'static {
    fn encrypt(&self, plain: &str, key: &str) -> String;

    /// Returns `None` if `data` cannot be decrypted.
    fn decrypt(&self, data: &str, key: &str) -> Option<String>;
}

/// The identity cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Cipher for Passthrough {
    fn encrypt(&self, plain: &str, _key: &str) -> String {
        plain.to_string()
    }

    fn decrypt(&self, data: &str, _key: &str) -> Option<String> {
        Some(data.to_string())
    }
}
