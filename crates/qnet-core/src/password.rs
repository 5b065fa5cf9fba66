//! Password strength estimation and the vault password policy
//!
//! The only hard rule is a minimum length. Everything else is advisory: a
//! weak-but-long password is accepted and a warning is logged, so the user
//! keeps control while the risk stays visible.
//!
//! | Level     | Bits   |
//! |-----------|--------|
//! | Dangerous | < 28   |
//! | Weak      | 28–35  |
//! | Fair      | 36–59  |
//! | Strong    | ≥ 60   |

use std::collections::HashSet;

/// Minimum number of characters accepted for a vault password.
pub const DEFAULT_MIN_LENGTH: usize = 8;

const RECOMMENDED_ENTROPY: f64 = 60.0;

/// Password strength level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PasswordStrength {
    Dangerous,
    Weak,
    Fair,
    Strong,
}

impl PasswordStrength {
    fn from_bits(bits: f64) -> Self {
        match bits {
            b if b < 28.0 => Self::Dangerous,
            b if b < 36.0 => Self::Weak,
            b if b < RECOMMENDED_ENTROPY => Self::Fair,
            _ => Self::Strong,
        }
    }

    pub fn is_recommended(&self) -> bool {
        *self >= Self::Strong
    }
}

/// Result of password analysis
#[derive(Debug, Clone)]
pub struct PasswordAnalysis {
    pub entropy_bits: f64,
    pub strength: PasswordStrength,
    pub warnings: Vec<String>,
}

const COMMON_WORDS: &[&str] = &[
    "password", "123456", "qwerty", "letmein", "iloveyou", "admin", "welcome", "wallet",
    "crypto", "solana", "qnet", "node", "moon", "seed",
];

/// Estimate the entropy of a password in bits.
///
/// Character-class analysis with penalties for dictionary words, repeated
/// characters and ascending runs.
pub fn estimate_entropy(password: &str) -> PasswordAnalysis {
    let mut warnings = Vec::new();
    if password.is_empty() {
        return PasswordAnalysis {
            entropy_bits: 0.0,
            strength: PasswordStrength::Dangerous,
            warnings: vec!["Password is empty".to_string()],
        };
    }

    let mut charset: f64 = 0.0;
    let classes = [
        password.chars().any(|c| c.is_ascii_lowercase()) as u8 as f64 * 26.0,
        password.chars().any(|c| c.is_ascii_uppercase()) as u8 as f64 * 26.0,
        password.chars().any(|c| c.is_ascii_digit()) as u8 as f64 * 10.0,
        password
            .chars()
            .any(|c| c.is_ascii_punctuation() || c == ' ') as u8 as f64
            * 33.0,
        password.chars().any(|c| !c.is_ascii()) as u8 as f64 * 100.0,
    ];
    for size in classes {
        charset += size;
    }

    let len = password.chars().count() as f64;
    let mut entropy = len * charset.max(1.0).log2();

    let unique: HashSet<char> = password.chars().collect();
    let unique_ratio = unique.len() as f64 / len;
    if unique_ratio < 0.5 {
        entropy -= (1.0 - unique_ratio) * entropy * 0.3;
        warnings.push("Many repeated characters".to_string());
    }

    let lower = password.to_lowercase();
    if COMMON_WORDS.iter().any(|w| lower.contains(w)) {
        entropy *= 0.5;
        warnings.push("Contains a commonly used word".to_string());
    }

    let chars: Vec<char> = password.chars().collect();
    let ascending = chars
        .windows(3)
        .any(|w| w[1] as u32 == w[0] as u32 + 1 && w[2] as u32 == w[1] as u32 + 1);
    if ascending {
        entropy -= 10.0;
        warnings.push("Contains a sequential run".to_string());
    }

    let entropy = entropy.max(0.0);
    PasswordAnalysis {
        entropy_bits: entropy,
        strength: PasswordStrength::from_bits(entropy),
        warnings,
    }
}

/// Hard requirements a new vault password must meet.
#[derive(Debug, Clone, Copy)]
pub struct PasswordPolicy {
    pub min_length: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_MIN_LENGTH,
        }
    }
}

impl PasswordPolicy {
    /// Returns `Err(min_length)` when the password is too short. Weak but
    /// long enough passwords pass with a logged warning.
    pub fn check(&self, password: &str) -> Result<PasswordAnalysis, usize> {
        if password.chars().count() < self.min_length {
            return Err(self.min_length);
        }
        let analysis = estimate_entropy(password);
        if !analysis.strength.is_recommended() {
            log::warn!(
                "vault password strength {:?} (~{:.0} bits) is below the recommendation",
                analysis.strength,
                analysis.entropy_bits
            );
        }
        Ok(analysis)
    }
}
