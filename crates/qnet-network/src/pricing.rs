//! Activation pricing
//!
//! Phase 1 (1DEV burn) is one price for every node type, falling by 150 for
//! every full 10 % of supply burned, with a floor of 150.
//!
//! Phase 2 (QNC spend) is tiered by node type and scaled by the size of the
//! network:
//!
//! | Active nodes  | Multiplier |
//! |---------------|------------|
//! | ≤ 100 000     | 0.5        |
//! | ≤ 300 000     | 1.0        |
//! | ≤ 1 000 000   | 2.0        |
//! | more          | 3.0        |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const PHASE1_BASE_COST: u64 = 1_500;
pub const PHASE1_TIER_DECREMENT: u64 = 150;
pub const PHASE1_FLOOR_COST: u64 = 150;

/// Percentage of supply covered by one price tier.
const TIER_PERCENT: f64 = 10.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid value: {0}")]
pub struct ParseError(pub String);

/// Node tier being activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Light,
    Full,
    Super,
}

impl NodeType {
    pub const ALL: [NodeType; 3] = [NodeType::Light, NodeType::Full, NodeType::Super];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Full => "full",
            Self::Super => "super",
        }
    }

    /// Phase 2 price before the network multiplier.
    pub fn phase2_base_cost(self) -> u64 {
        match self {
            Self::Light => 5_000,
            Self::Full => 7_500,
            Self::Super => 10_000,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "full" => Ok(Self::Full),
            "super" => Ok(Self::Super),
            other => Err(ParseError(format!("unknown node type: {}", other))),
        }
    }
}

/// Activation economy in force. Serialized as `1` / `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Phase {
    /// Burn 1DEV on the settlement chain, redeem through the bridge
    One,
    /// Spend QNC on the native chain
    Two,
}

impl Phase {
    pub fn method(self) -> PaymentMethod {
        match self {
            Self::One => PaymentMethod::Burn,
            Self::Two => PaymentMethod::Qnc,
        }
    }

    pub fn token_symbol(self) -> &'static str {
        match self {
            Self::One => "1DEV",
            Self::Two => "QNC",
        }
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> u8 {
        match phase {
            Phase::One => 1,
            Phase::Two => 2,
        }
    }
}

impl TryFrom<u8> for Phase {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Phase::One),
            2 => Ok(Phase::Two),
            other => Err(ParseError(format!("unknown phase: {}", other))),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {}", u8::from(*self))
    }
}

/// How the activation is paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Burn,
    Qnc,
}

/// Phase 1 cost in whole 1DEV: `max(1500 - 150 * floor(burned / 10), 150)`.
pub fn phase1_cost(burned_percent: f64) -> u64 {
    let burned = if burned_percent.is_finite() {
        burned_percent.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let tiers = (burned / TIER_PERCENT).floor() as u64;
    PHASE1_BASE_COST
        .saturating_sub(tiers * PHASE1_TIER_DECREMENT)
        .max(PHASE1_FLOOR_COST)
}

pub fn network_multiplier(active_nodes: u64) -> f64 {
    match active_nodes {
        0..=100_000 => 0.5,
        100_001..=300_000 => 1.0,
        300_001..=1_000_000 => 2.0,
        _ => 3.0,
    }
}

/// Phase 2 cost in whole QNC, rounded to the nearest unit.
pub fn phase2_cost(node_type: NodeType, active_nodes: u64) -> u64 {
    (node_type.phase2_base_cost() as f64 * network_multiplier(active_nodes)).round() as u64
}

/// Price of one activation under the current conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationQuote {
    pub phase: Phase,
    pub node_type: NodeType,
    pub method: PaymentMethod,
    /// Whole tokens of `token`
    pub cost: u64,
    pub token: String,
}

impl ActivationQuote {
    pub fn new(phase: Phase, node_type: NodeType, burned_percent: f64, active_nodes: u64) -> Self {
        let cost = match phase {
            Phase::One => phase1_cost(burned_percent),
            Phase::Two => phase2_cost(node_type, active_nodes),
        };
        Self {
            phase,
            node_type,
            method: phase.method(),
            cost,
            token: phase.token_symbol().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase1_tier_table() {
        let table = [
            (0.0, 1500),
            (9.99, 1500),
            (10.0, 1350),
            (25.0, 1200),
            (45.0, 900),
            (50.0, 750),
            (80.0, 300),
            (89.9, 300),
            (90.0, 150),
            (100.0, 150),
        ];
        for (burned, expected) in table {
            assert_eq!(phase1_cost(burned), expected, "burned {}%", burned);
        }
    }

    #[test]
    fn test_phase1_degenerate_inputs() {
        assert_eq!(phase1_cost(-5.0), 1500);
        assert_eq!(phase1_cost(f64::NAN), 1500);
        assert_eq!(phase1_cost(250.0), 150);
    }

    #[test]
    fn test_phase2_pricing() {
        assert_eq!(phase2_cost(NodeType::Light, 50_000), 2_500);
        assert_eq!(phase2_cost(NodeType::Full, 100_000), 3_750);
        assert_eq!(phase2_cost(NodeType::Full, 100_001), 7_500);
        assert_eq!(phase2_cost(NodeType::Super, 300_000), 10_000);
        assert_eq!(phase2_cost(NodeType::Super, 1_000_000), 20_000);
        assert_eq!(phase2_cost(NodeType::Light, 5_000_000), 15_000);
    }

    #[test]
    fn test_phase1_price_is_universal() {
        let costs: Vec<u64> = NodeType::ALL
            .iter()
            .map(|t| ActivationQuote::new(Phase::One, *t, 35.0, 0).cost)
            .collect();
        assert_eq!(costs, vec![1050, 1050, 1050]);
    }

    #[test]
    fn test_phase_serializes_as_number() {
        assert_eq!(serde_json::to_string(&Phase::Two).unwrap(), "2");
        assert_eq!(serde_json::from_str::<Phase>("1").unwrap(), Phase::One);
        assert!(serde_json::from_str::<Phase>("3").is_err());
    }

    #[test]
    fn test_node_type_parsing() {
        assert_eq!("Super".parse::<NodeType>().unwrap(), NodeType::Super);
        assert!("mega".parse::<NodeType>().is_err());
        assert_eq!(serde_json::to_string(&NodeType::Light).unwrap(), "\"light\"");
    }
}
