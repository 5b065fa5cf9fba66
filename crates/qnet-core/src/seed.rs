//! BIP-39 seed management
//!
//! Handles mnemonic generation, import and seed derivation. Seed bytes are
//! returned in [`Zeroizing`] wrappers so they are wiped when dropped.

use bip39::{Language, Mnemonic};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("Unsupported word count: {0}")]
    UnsupportedWordCount(usize),
}

/// Mnemonic lengths accepted on import and generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordCount {
    Words12,
    Words24,
}

impl WordCount {
    pub fn count(self) -> usize {
        match self {
            Self::Words12 => 12,
            Self::Words24 => 24,
        }
    }
}

/// Generate a new BIP-39 mnemonic
pub fn generate_mnemonic(words: WordCount) -> Result<Mnemonic, SeedError> {
    Mnemonic::generate_in(Language::English, words.count())
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Parse a mnemonic from words.
///
/// Surrounding whitespace, repeated spaces and upper case letters are
/// normalised away before the checksum is verified.
pub fn parse_mnemonic(words: &str) -> Result<Mnemonic, SeedError> {
    let normalized = Zeroizing::new(
        words
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" "),
    );
    let count = normalized.split(' ').filter(|w| !w.is_empty()).count();
    if count != 12 && count != 24 {
        return Err(SeedError::UnsupportedWordCount(count));
    }
    Mnemonic::parse_in(Language::English, normalized.as_str())
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Derive seed bytes from mnemonic (with optional passphrase)
pub fn derive_seed(mnemonic: &Mnemonic, passphrase: &str) -> Zeroizing<[u8; 64]> {
    Zeroizing::new(mnemonic.to_seed(passphrase))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_generate_lengths() {
        let m12 = generate_mnemonic(WordCount::Words12).unwrap();
        let m24 = generate_mnemonic(WordCount::Words24).unwrap();
        assert_eq!(m12.word_count(), 12);
        assert_eq!(m24.word_count(), 24);
    }

    #[test]
    fn test_parse_normalizes_whitespace_and_case() {
        let messy = format!("  {}  ", ABANDON.to_uppercase().replace(' ', "   "));
        let parsed = parse_mnemonic(&messy).unwrap();
        assert_eq!(parsed.to_string(), ABANDON);
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let bad = ABANDON.replace("about", "abandon");
        assert!(matches!(
            parse_mnemonic(&bad),
            Err(SeedError::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn test_parse_rejects_odd_lengths() {
        assert!(matches!(
            parse_mnemonic("abandon abandon abandon"),
            Err(SeedError::UnsupportedWordCount(3))
        ));
    }

    #[test]
    fn test_seed_is_deterministic() {
        let m = parse_mnemonic(ABANDON).unwrap();
        assert_eq!(*derive_seed(&m, ""), *derive_seed(&m, ""));
        assert_ne!(*derive_seed(&m, ""), *derive_seed(&m, "TREZOR"));
    }
}
