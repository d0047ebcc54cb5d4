use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::FeeRate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Used whenever the recommendation endpoint cannot be reached or parsed.
pub const FALLBACK_FEE_TIERS: FeeTiers = FeeTiers {
    fastest_fee: 5,
    half_hour_fee: 4,
    hour_fee: 3,
    economy_fee: 2,
    minimum_fee: 1,
};

/// Highest rate a request may ask for, matching the default `maxfeerate` of
/// Bitcoin Core's `sendrawtransaction`.
pub const MAX_FEE_RATE_SAT_PER_VB: u64 = 10_000;

/// Fee recommendation in sat/vB, in the shape mempool.space serves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeTiers {
    pub fastest_fee: u64,
    pub half_hour_fee: u64,
    pub hour_fee: u64,
    pub economy_fee: u64,
    pub minimum_fee: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeTier {
    Fastest,
    HalfHour,
    Hour,
    Economy,
    Minimum,
}

impl FeeTier {
    pub const ALL: [FeeTier; 5] = [
        FeeTier::Fastest,
        FeeTier::HalfHour,
        FeeTier::Hour,
        FeeTier::Economy,
        FeeTier::Minimum,
    ];
}

impl fmt::Display for FeeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FeeTier::Fastest => "fastest",
            FeeTier::HalfHour => "half hour",
            FeeTier::Hour => "hour",
            FeeTier::Economy => "economy",
            FeeTier::Minimum => "minimum",
        };
        f.write_str(label)
    }
}

impl FeeTiers {
    pub fn rate(&self, tier: FeeTier) -> u64 {
        match tier {
            FeeTier::Fastest => self.fastest_fee,
            FeeTier::HalfHour => self.half_hour_fee,
            FeeTier::Hour => self.hour_fee,
            FeeTier::Economy => self.economy_fee,
            FeeTier::Minimum => self.minimum_fee,
        }
    }

    /// Tiers paired with their rate, fastest first, for an interactive prompt.
    pub fn choices(&self) -> Vec<(FeeTier, u64)> {
        FeeTier::ALL.iter().map(|tier| (*tier, self.rate(*tier))).collect()
    }
}

/// How a request states its fee: a named tier or an explicit sat/vB rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeChoice {
    Tier(FeeTier),
    Rate(u64),
}

impl FeeChoice {
    /// Rates below 1 sat/vB are raised to 1. Rates above
    /// [`MAX_FEE_RATE_SAT_PER_VB`] are rejected.
    pub fn resolve(&self, tiers: &FeeTiers) -> Result<FeeRate> {
        let sat_per_vb = match self {
            FeeChoice::Tier(tier) => tiers.rate(*tier),
            FeeChoice::Rate(rate) => *rate,
        };
        if sat_per_vb > MAX_FEE_RATE_SAT_PER_VB {
            return Err(EngineError::InvalidFeeRate { sat_per_vb });
        }
        FeeRate::from_sat_per_vb(sat_per_vb.max(1)).ok_or(EngineError::InvalidFeeRate { sat_per_vb })
    }

    pub fn needs_tiers(&self) -> bool {
        matches!(self, FeeChoice::Tier(_))
    }
}

#[async_trait]
pub trait FeeAdvisor: Send + Sync {
    /// Never fails; falls back to [`FALLBACK_FEE_TIERS`].
    async fn fee_tiers(&self) -> FeeTiers;
}

#[derive(Debug, Clone)]
pub struct HttpFeeAdvisor {
    endpoint: String,
    http: Client,
}

impl HttpFeeAdvisor {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> eyre::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
        })
    }

    async fn fetch(&self) -> eyre::Result<FeeTiers> {
        let tiers = self
            .http
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .json::<FeeTiers>()
            .await?;
        Ok(tiers)
    }
}

#[async_trait]
impl FeeAdvisor for HttpFeeAdvisor {
    async fn fee_tiers(&self) -> FeeTiers {
        match self.fetch().await {
            Ok(tiers) => {
                info!(
                    fastest = tiers.fastest_fee,
                    economy = tiers.economy_fee,
                    "Fetched fee recommendation"
                );
                tiers
            }
            Err(e) => {
                warn!(
                    endpoint = %self.endpoint,
                    error = %e,
                    "Fee recommendation unavailable, using fallback tiers"
                );
                FALLBACK_FEE_TIERS
            }
        }
    }
}

/// Fixed tiers, handy for hosts that manage fees elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct StaticFeeAdvisor(pub FeeTiers);

#[async_trait]
impl FeeAdvisor for StaticFeeAdvisor {
    async fn fee_tiers(&self) -> FeeTiers {
        self.0
    }
}
