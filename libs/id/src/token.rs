//! Fixed-length random token backing every typed ID.

use rand::{distr::Alphanumeric, Rng};

use crate::IdError;

/// Number of random characters in every ID.
pub const TOKEN_LEN: usize = 16;

/// A fixed-length random ASCII alphanumeric token.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    /// Generates a fresh random token.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        let mut rng = rand::rng();
        for byte in bytes.iter_mut() {
            *byte = rng.sample(Alphanumeric);
        }
        Self(bytes)
    }

    /// Parses a token, rejecting anything but exactly [`TOKEN_LEN`] ASCII
    /// alphanumerics.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if let Some(bad) = s.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(IdError::InvalidCharacter(bad));
        }

        // ASCII from here on, so bytes and characters agree.
        if s.len() != TOKEN_LEN {
            return Err(IdError::InvalidLength {
                expected: TOKEN_LEN,
                actual: s.len(),
            });
        }

        let mut bytes = [0u8; TOKEN_LEN];
        bytes.copy_from_slice(s.as_bytes());
        Ok(Self(bytes))
    }

    /// Returns the token as a string slice.
    pub fn as_str(&self) -> &str {
        // Only ASCII alphanumerics are ever stored.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({})", self.as_str())
    }
}
