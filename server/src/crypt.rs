use base64::{engine::general_purpose::STANDARD, Engine};
use derive_more::derive::Display;

#[derive(Debug, Display)]
pub enum Error {
    EncryptFailed(String),
    DecryptFailed(String),
    DecodeFailed(base64::DecodeError),
    StringConversionFailed(std::string::FromUtf8Error),
}

impl std::error::Error for Error {}

/// Encrypts OAuth tokens before they are written and decrypts them on read.
/// Stored values are base64 of the `simple_crypt` ciphertext.
#[derive(Clone)]
pub struct TokenCipher {
    key: String,
}

impl TokenCipher {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn encrypt(&self, plain: &str) -> Result<String, Error> {
        let encrypted = simple_crypt::encrypt(plain.as_bytes(), self.key.as_bytes())
            .map_err(|e| Error::EncryptFailed(e.to_string()))?;

        Ok(STANDARD.encode(encrypted))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, Error> {
        let decoded = STANDARD.decode(stored).map_err(Error::DecodeFailed)?;
        let decrypted = simple_crypt::decrypt(&decoded, self.key.as_bytes())
            .map_err(|e| Error::DecryptFailed(e.to_string()))?;

        String::from_utf8(decrypted).map_err(Error::StringConversionFailed)
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}
