/// Payout Calculator
///
/// Splits a block reward over the scores of the window it closed.
///
/// ## Algorithm
/// 1. `fee = floor(reward × fee_rate)`
/// 2. `distributable = reward × (1 − fee_rate) + carried_in`
/// 3. `reward_i = floor(distributable × score_i / total_score)`
/// 4. `carried_out = reward − fee + carried_in − Σ reward_i`, paid into the next block
///
/// Every record satisfies `Σ reward_i + fee + reserve + carried_out == reward + carried_in`.
/// A window with zero total score distributes nothing; its distributable
/// amount goes to `reserve`.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ledger::ClosedWindow;
use crate::error::PayoutError;

/// One closed window's payout, appended to the payout sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub window_id: u64,
    pub block_height: u64,
    pub block_hash: String,
    pub block_reward: u64,
    pub fee: u64,
    /// Miner account → amount, zero amounts omitted
    pub rewards: BTreeMap<String, u64>,
    pub total_score: Decimal,
    pub carried_in: u64,
    pub carried_out: u64,
    pub reserve: u64,
    pub created_at: DateTime<Utc>,
}

impl PayoutRecord {
    pub fn paid(&self) -> u64 {
        self.rewards.values().sum()
    }

    pub fn is_balanced(&self) -> bool {
        self.paid() as u128 + self.fee as u128 + self.reserve as u128 + self.carried_out as u128
            == self.block_reward as u128 + self.carried_in as u128
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub fee: u64,
    pub rewards: BTreeMap<String, u64>,
    pub carried_out: u64,
}

fn fee_amount(reward: u64, fee_rate: Decimal) -> Result<u64, PayoutError> {
    Decimal::from(reward)
        .checked_mul(fee_rate)
        .and_then(|f| f.floor().to_u64())
        .ok_or(PayoutError::Overflow(reward))
}

/// Pure split of `reward` (plus `carried_in`) over `scores`
pub fn distribute(
    scores: &BTreeMap<String, Decimal>,
    total_score: Decimal,
    reward: u64,
    fee_rate: Decimal,
    carried_in: u64,
) -> Result<Distribution, PayoutError> {
    if fee_rate < Decimal::ZERO || fee_rate >= Decimal::ONE {
        return Err(PayoutError::InvalidFee(fee_rate));
    }
    if total_score <= Decimal::ZERO {
        return Err(PayoutError::ZeroTotalScore);
    }

    let fee = fee_amount(reward, fee_rate)?;
    let pool = (reward - fee)
        .checked_add(carried_in)
        .ok_or(PayoutError::Overflow(reward))?;
    let distributable = Decimal::from(reward)
        .checked_mul(Decimal::ONE - fee_rate)
        .and_then(|d| d.checked_add(Decimal::from(carried_in)))
        .ok_or(PayoutError::Overflow(reward))?;

    let mut rewards = BTreeMap::new();
    let mut paid: u64 = 0;
    for (miner, score) in scores {
        if *score <= Decimal::ZERO {
            continue;
        }
        let amount = distributable
            .checked_mul(*score)
            .and_then(|d| d.checked_div(total_score))
            .and_then(|d| d.floor().to_u64())
            .ok_or(PayoutError::Overflow(reward))?;
        if amount > 0 {
            rewards.insert(miner.clone(), amount);
            paid = paid.checked_add(amount).ok_or(PayoutError::Overflow(reward))?;
        }
    }

    if paid > pool {
        return Err(PayoutError::Unbalanced {
            paid,
            fee,
            carried: carried_in,
            expected: reward.saturating_add(carried_in),
        });
    }

    Ok(Distribution {
        fee,
        rewards,
        carried_out: pool - paid,
    })
}

/// Owns the fee rate and the remainder carried between blocks
#[derive(Debug, Clone)]
pub struct PayoutCalculator {
    fee_rate: Decimal,
    carried: u64,
}

impl PayoutCalculator {
    pub fn new(fee_rate: Decimal) -> Result<Self, PayoutError> {
        if fee_rate < Decimal::ZERO || fee_rate >= Decimal::ONE {
            return Err(PayoutError::InvalidFee(fee_rate));
        }
        Ok(Self {
            fee_rate,
            carried: 0,
        })
    }

    /// Resume with a remainder left by an earlier run
    pub fn with_carried(mut self, carried: u64) -> Self {
        self.carried = carried;
        self
    }

    pub fn fee_rate(&self) -> Decimal {
        self.fee_rate
    }

    /// Remainder waiting for the next block
    pub fn carried(&self) -> u64 {
        self.carried
    }

    /// Payout record for a closed window; advances the carried remainder
    pub fn settle(&mut self, closed: &ClosedWindow) -> PayoutRecord {
        let reward = closed.block.reward;
        let carried_in = self.carried;
        let window = &closed.window;

        let mut record = PayoutRecord {
            window_id: window.id,
            block_height: closed.block.height,
            block_hash: closed.block.hash.clone(),
            block_reward: reward,
            fee: 0,
            rewards: BTreeMap::new(),
            total_score: window.total_score,
            carried_in,
            carried_out: 0,
            reserve: 0,
            created_at: Utc::now(),
        };

        match distribute(&window.scores, window.total_score, reward, self.fee_rate, carried_in) {
            Ok(split) => {
                record.fee = split.fee;
                record.rewards = split.rewards;
                record.carried_out = split.carried_out;
                tracing::info!(
                    "Payout for window {}: {} miners, paid {}, fee {}, carried {}",
                    window.id,
                    record.rewards.len(),
                    record.paid(),
                    record.fee,
                    record.carried_out
                );
            }
            Err(e) => {
                // Nothing distributable: the whole net amount goes to reserve
                let fee = fee_amount(reward, self.fee_rate).unwrap_or(0);
                record.fee = fee;
                record.reserve = (reward - fee).saturating_add(carried_in);
                match e {
                    PayoutError::ZeroTotalScore => tracing::warn!(
                        "Window {} closed with zero score, {} moved to reserve",
                        window.id,
                        record.reserve
                    ),
                    other => tracing::error!(
                        "Payout for window {} failed ({}), {} moved to reserve",
                        window.id,
                        other,
                        record.reserve
                    ),
                }
            }
        }

        self.carried = record.carried_out;
        record
    }

    /// Expected amount for `score` if the open window closed now on a block
    /// paying `reward`
    pub fn estimate(&self, score: Decimal, total_score: Decimal, reward: u64) -> u64 {
        if total_score <= Decimal::ZERO || score <= Decimal::ZERO {
            return 0;
        }
        Decimal::from(reward)
            .checked_mul(Decimal::ONE - self.fee_rate)
            .and_then(|d| d.checked_add(Decimal::from(self.carried)))
            .and_then(|d| d.checked_mul(score))
            .and_then(|d| d.checked_div(total_score))
            .and_then(|d| d.floor().to_u64())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BlockFoundEvent;
    use crate::bus::{PoolEvent, ShareEvent};
    use crate::pplns::ledger::ShareLedger;
    use crate::shares::ShareStatus;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn scores(pairs: &[(&str, Decimal)]) -> BTreeMap<String, Decimal> {
        pairs.iter().map(|(m, s)| (m.to_string(), *s)).collect()
    }

    fn closed_window(pairs: &[(&str, Decimal)], reward: u64) -> ClosedWindow {
        let mut ledger = ShareLedger::new(0, 4);
        for (miner, score) in pairs {
            ledger.apply(PoolEvent::Share(ShareEvent {
                id: Uuid::new_v4(),
                window_id: 0,
                miner: miner.to_string(),
                worker: format!("{}.rig", miner),
                tier: "low".into(),
                job_id: "1".into(),
                height: 10,
                status: ShareStatus::Accepted,
                score: *score,
                timestamp: Utc::now(),
            }));
        }
        let out = ledger.apply(PoolEvent::BlockFound(BlockFoundEvent {
            id: Uuid::new_v4(),
            window_id: 0,
            height: 10,
            hash: "ab".repeat(32),
            miner: "alice".into(),
            worker: "alice.rig".into(),
            reward,
            timestamp: Utc::now(),
        }));
        out.closed.into_iter().next().unwrap()
    }

    #[test]
    fn test_reference_split() {
        let s = scores(&[("A", dec!(300)), ("B", dec!(700))]);
        let d = distribute(&s, dec!(1000), 60, dec!(0.02), 0).unwrap();
        assert_eq!(d.fee, 1);
        assert_eq!(d.rewards["A"], 17);
        assert_eq!(d.rewards["B"], 41);
        assert_eq!(d.carried_out, 1);
        assert_eq!(17 + 41 + d.fee + d.carried_out, 60);
    }

    #[test]
    fn test_zero_total_is_error() {
        let s = scores(&[]);
        assert_eq!(
            distribute(&s, Decimal::ZERO, 60, dec!(0.02), 0),
            Err(PayoutError::ZeroTotalScore)
        );
    }

    #[test]
    fn test_invalid_fee_rejected() {
        assert!(PayoutCalculator::new(dec!(1)).is_err());
        assert!(PayoutCalculator::new(dec!(-0.01)).is_err());
        assert!(PayoutCalculator::new(dec!(0)).is_ok());
    }

    #[test]
    fn test_invariant_holds_across_many_splits() {
        for reward in [1u64, 7, 60, 999, 5_000_000_000, 312_500_000] {
            for fee in [dec!(0), dec!(0.01), dec!(0.025), dec!(0.5)] {
                for carried_in in [0u64, 1, 3] {
                    let s = scores(&[
                        ("a", dec!(1)),
                        ("b", dec!(0.333333333333333333)),
                        ("c", dec!(17.5)),
                        ("d", dec!(0.000000001)),
                    ]);
                    let total: Decimal = s.values().copied().sum();
                    let d = distribute(&s, total, reward, fee, carried_in).unwrap();
                    let paid: u64 = d.rewards.values().sum();
                    assert_eq!(paid + d.fee + d.carried_out, reward + carried_in);
                }
            }
        }
    }

    #[test]
    fn test_settle_carries_remainder_forward() {
        let mut calc = PayoutCalculator::new(dec!(0.02)).unwrap();
        let first = calc.settle(&closed_window(&[("A", dec!(300)), ("B", dec!(700))], 60));
        assert!(first.is_balanced());
        assert_eq!(first.carried_out, 1);
        assert_eq!(calc.carried(), 1);

        let second = calc.settle(&closed_window(&[("A", dec!(1))], 60));
        assert_eq!(second.carried_in, 1);
        // 58.8 + 1 carried → 59
        assert_eq!(second.rewards["A"], 59);
        assert_eq!(second.carried_out, 1);
        assert!(second.is_balanced());
    }

    #[test]
    fn test_settle_zero_score_goes_to_reserve() {
        let mut calc = PayoutCalculator::new(dec!(0.02)).unwrap();
        calc.settle(&closed_window(&[("A", dec!(300)), ("B", dec!(700))], 60));

        let record = calc.settle(&closed_window(&[], 60));
        assert!(record.rewards.is_empty());
        assert_eq!(record.fee, 1);
        assert_eq!(record.reserve, 60);
        assert_eq!(record.carried_out, 0);
        assert!(record.is_balanced());
        assert_eq!(calc.carried(), 0);
    }

    #[test]
    fn test_estimate_uses_carry() {
        let mut calc = PayoutCalculator::new(dec!(0.02)).unwrap();
        assert_eq!(calc.estimate(dec!(1), dec!(2), 60), 29);
        calc.settle(&closed_window(&[("A", dec!(300)), ("B", dec!(700))], 60));
        assert_eq!(calc.estimate(dec!(1), dec!(2), 60), 29);
        assert_eq!(calc.estimate(dec!(1), dec!(1), 60), 59);
        assert_eq!(calc.estimate(Decimal::ZERO, dec!(1), 60), 0);
    }
}
