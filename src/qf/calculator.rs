//! Quadratic-funding match computation.
//!
//! Per proposal, contributions are summed per donor (weighted by trust score in
//! weighted mode), then
//!
//! ```text
//! raw_score = round18(max((Σ sqrt18(c_i))² − Σ c_i, 0))
//! match     = trunc18(pool × raw_score ÷ total_score)
//! ```
//!
//! `sqrt18` floors at 18 places and `round18` rounds half-even once, after the
//! subtraction, so a further donor never lowers a score. Truncating each
//! match means the matches never sum above the pool and fall short of it by
//! less than one unit in the 18th place per proposal.

use std::collections::BTreeMap;

use serde::Serialize;

use super::sqrt::{sqrt_fixed, SqrtError, SCALE};
use super::QfError;
use crate::domain::{Decimal, Donation, DonorAddress, ProposalId, Round, RoundStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QfOptions {
    /// Multiply each donation by its trust score; a missing score counts as 1.
    pub weighted: bool,
    /// Allowed on rounds that are not closed; results are never persisted.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalMatch {
    pub proposal_id: ProposalId,
    pub contributors: usize,
    pub contributed: Decimal,
    pub raw_score: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QfOutcome {
    pub matching_pool: Decimal,
    pub total_score: Decimal,
    pub weighted: bool,
    /// One entry per proposal, ordered by proposal id.
    pub matches: Vec<ProposalMatch>,
}

impl QfOutcome {
    pub fn total_matched(&self) -> Decimal {
        self.matches.iter().map(|m| m.amount).sum()
    }
}

/// Compute matches for `round` from its committed donations.
///
/// `proposals` lists every proposal of the round, so proposals without
/// donations still get a zero entry. Donations to other rounds are ignored.
pub fn calculate_matches(
    round: &Round,
    proposals: &[ProposalId],
    donations: &[Donation],
    options: QfOptions,
) -> Result<QfOutcome, QfError> {
    if round.status != RoundStatus::Closed && !options.dry_run {
        return Err(QfError::RoundNotClosed {
            round_id: round.id.clone(),
            status: round.status,
        });
    }

    let mut by_proposal: BTreeMap<ProposalId, BTreeMap<DonorAddress, Decimal>> = proposals
        .iter()
        .map(|p| (p.clone(), BTreeMap::new()))
        .collect();
    for donation in donations.iter().filter(|d| d.round_id == round.id) {
        let contribution = contribution(donation, options.weighted)?;
        let per_donor = by_proposal
            .entry(donation.proposal_id.clone())
            .or_default()
            .entry(donation.donor.clone())
            .or_default();
        *per_donor = per_donor
            .checked_add(contribution)
            .ok_or(QfError::Overflow("contribution sum"))?;
    }

    let mut scored = Vec::with_capacity(by_proposal.len());
    let mut total_score = Decimal::zero();
    for (proposal_id, per_donor) in by_proposal {
        let (contributed, raw_score) = raw_score(&per_donor)?;
        total_score = total_score
            .checked_add(raw_score)
            .ok_or(QfError::Overflow("total score"))?;
        scored.push((proposal_id, per_donor.len(), contributed, raw_score));
    }

    let mut matches = Vec::with_capacity(scored.len());
    for (proposal_id, contributors, contributed, raw_score) in scored {
        let amount = if total_score.is_zero() {
            Decimal::zero()
        } else {
            share(round.matching_pool, raw_score, total_score)?
        };
        matches.push(ProposalMatch {
            proposal_id,
            contributors,
            contributed,
            raw_score,
            amount,
        });
    }

    Ok(QfOutcome {
        matching_pool: round.matching_pool,
        total_score,
        weighted: options.weighted,
        matches,
    })
}

fn contribution(donation: &Donation, weighted: bool) -> Result<Decimal, QfError> {
    if !weighted {
        return Ok(donation.amount);
    }
    let weight = donation.trust_score.unwrap_or_else(Decimal::one);
    donation
        .amount
        .checked_mul(weight)
        .ok_or(QfError::Overflow("weighted amount"))
}

/// `(Σ contributed, raw score)` for one proposal's per-donor contributions.
fn raw_score(per_donor: &BTreeMap<DonorAddress, Decimal>) -> Result<(Decimal, Decimal), QfError> {
    let mut sum = Decimal::zero();
    let mut sum_sqrt = Decimal::zero();
    for c in per_donor.values() {
        sum = sum.checked_add(*c).ok_or(QfError::Overflow("contribution sum"))?;
        sum_sqrt = sum_sqrt
            .checked_add(sqrt_fixed(*c)?)
            .ok_or(QfError::Overflow("square root sum"))?;
    }
    if per_donor.len() < 2 {
        return Ok((sum, Decimal::zero()));
    }

    let raw = sum_sqrt
        .checked_mul(sum_sqrt)
        .ok_or(QfError::Overflow("squared root sum"))?
        .checked_sub(sum)
        .ok_or(QfError::Overflow("raw score"))?;
    // Flooring the roots can push a tiny true score below zero.
    let raw = if raw.is_negative() { Decimal::zero() } else { raw };
    Ok((sum, raw.round_dp(SCALE)))
}

fn share(pool: Decimal, raw_score: Decimal, total_score: Decimal) -> Result<Decimal, QfError> {
    let exact = pool
        .checked_mul(raw_score)
        .and_then(|product| product.checked_div(total_score));
    let amount = match exact {
        Some(amount) => amount,
        // pool × raw_score left the decimal range; the ratio form loses only trailing digits.
        None => raw_score
            .checked_div(total_score)
            .and_then(|ratio| pool.checked_mul(ratio))
            .ok_or(QfError::Overflow("match amount"))?,
    }
    .trunc_dp(SCALE);
    Ok(if amount > pool { pool } else { amount })
}

impl From<SqrtError> for QfError {
    fn from(e: SqrtError) -> Self {
        match e {
            SqrtError::Negative(v) => QfError::InvalidAmount(v),
            SqrtError::Overflow(_) => QfError::Overflow("square root"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RoundId, TimeMs, TxHash};
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn round(pool: &str, status: RoundStatus) -> Round {
        Round {
            id: RoundId::new("r1"),
            matching_pool: d(pool),
            status,
        }
    }

    fn donation(proposal: &str, donor: &str, amount: &str, trust: Option<&str>) -> Donation {
        Donation {
            donor: DonorAddress::new(donor),
            proposal_id: ProposalId::new(proposal),
            round_id: RoundId::new("r1"),
            amount: d(amount),
            tx_hash: TxHash::new("0x01"),
            trust_score: trust.map(d),
            created_at: TimeMs::new(0),
        }
    }

    fn ids(names: &[&str]) -> Vec<ProposalId> {
        names.iter().map(|n| ProposalId::new(*n)).collect()
    }

    fn amount_of(outcome: &QfOutcome, proposal: &str) -> Decimal {
        outcome
            .matches
            .iter()
            .find(|m| m.proposal_id.as_str() == proposal)
            .map(|m| m.amount)
            .unwrap()
    }

    #[test]
    fn test_pool_goes_to_only_multi_donor_proposal() {
        let donations = vec![
            donation("A", "0x01", "100", None),
            donation("A", "0x02", "400", None),
            donation("B", "0x03", "100", None),
        ];
        let outcome = calculate_matches(
            &round("1000", RoundStatus::Closed),
            &ids(&["A", "B"]),
            &donations,
            QfOptions::default(),
        )
        .unwrap();

        assert_eq!(outcome.total_score, d("400"));
        assert_eq!(amount_of(&outcome, "A"), d("1000"));
        assert_eq!(amount_of(&outcome, "B"), d("0"));
        assert_eq!(outcome.matches[0].raw_score, d("400"));
    }

    #[test]
    fn test_many_small_donors_outscore_one_large() {
        let donations = vec![
            donation("small", "0x01", "25", None),
            donation("small", "0x02", "25", None),
            donation("large", "0x03", "50", None),
        ];
        let outcome = calculate_matches(
            &round("10", RoundStatus::Closed),
            &ids(&["small", "large"]),
            &donations,
            QfOptions::default(),
        )
        .unwrap();

        let small = outcome.matches.iter().find(|m| m.proposal_id.as_str() == "small").unwrap();
        let large = outcome.matches.iter().find(|m| m.proposal_id.as_str() == "large").unwrap();
        assert_eq!(small.raw_score, d("50"));
        assert_eq!(large.raw_score, d("0"));
    }

    #[test]
    fn test_zero_total_score_distributes_nothing() {
        let donations = vec![donation("A", "0x01", "5", None), donation("B", "0x02", "7", None)];
        let outcome = calculate_matches(
            &round("1000", RoundStatus::Closed),
            &ids(&["A", "B", "C"]),
            &donations,
            QfOptions::default(),
        )
        .unwrap();

        assert!(outcome.total_score.is_zero());
        assert_eq!(outcome.matches.len(), 3);
        assert!(outcome.matches.iter().all(|m| m.amount.is_zero()));
    }

    #[test]
    fn test_repeat_donor_counts_once() {
        let donations = vec![
            donation("A", "0x01", "10", None),
            donation("A", "0x01", "15", None),
        ];
        let outcome = calculate_matches(
            &round("1000", RoundStatus::Closed),
            &ids(&["A"]),
            &donations,
            QfOptions::default(),
        )
        .unwrap();
        assert_eq!(outcome.matches[0].contributors, 1);
        assert!(outcome.matches[0].raw_score.is_zero());
        assert_eq!(outcome.matches[0].contributed, d("25"));
    }

    #[test]
    fn test_sum_never_exceeds_pool_with_irrational_scores() {
        let donations = vec![
            donation("A", "0x01", "2", None),
            donation("A", "0x02", "3", None),
            donation("B", "0x01", "5", None),
            donation("B", "0x03", "7", None),
            donation("B", "0x04", "11", None),
            donation("C", "0x05", "13", None),
            donation("C", "0x06", "0.1", None),
        ];
        let pool = d("1000");
        let outcome = calculate_matches(
            &round("1000", RoundStatus::Closed),
            &ids(&["A", "B", "C"]),
            &donations,
            QfOptions::default(),
        )
        .unwrap();

        let total = outcome.total_matched();
        assert!(total <= pool);
        let tolerance = d("0.000000000000000003");
        assert!(pool - total <= tolerance, "shortfall {}", pool - total);
    }

    #[test]
    fn test_adding_a_donor_never_lowers_raw_score() {
        let mut donations = vec![
            donation("A", "0x01", "9", None),
            donation("A", "0x02", "16", None),
            donation("B", "0x03", "4", None),
            donation("B", "0x04", "4", None),
        ];
        let r = round("100", RoundStatus::Closed);
        let proposals = ids(&["A", "B"]);
        let mut prev = Decimal::zero();
        for (i, amount) in ["0.5", "1", "2.25", "30"].iter().enumerate() {
            let outcome =
                calculate_matches(&r, &proposals, &donations, QfOptions::default()).unwrap();
            let score = outcome.matches[0].raw_score;
            assert!(score >= prev, "step {i}: {score} < {prev}");
            prev = score;
            donations.push(donation("A", &format!("0x1{i}"), amount, None));
        }
    }

    #[test]
    fn test_tiny_extra_donor_never_lowers_raw_score() {
        let r = round("1", RoundStatus::Closed);
        let proposals = ids(&["A"]);
        let mut donations = vec![
            donation("A", "0x01", "0.0000000001", None),
            donation("A", "0x02", "0.0000000001", None),
        ];
        let before = calculate_matches(&r, &proposals, &donations, QfOptions::default())
            .unwrap()
            .matches[0]
            .raw_score;
        assert_eq!(before, d("0.0000000002"));

        donations.push(donation("A", "0x03", "0.0000000000000000000000000001", None));
        let after = calculate_matches(&r, &proposals, &donations, QfOptions::default())
            .unwrap()
            .matches[0]
            .raw_score;
        assert!(after >= before, "{after} < {before}");
        assert!(after.inner().scale() <= SCALE);
    }

    #[test]
    fn test_weighted_mode_applies_trust_scores() {
        let donations = vec![
            donation("A", "0x01", "100", Some("0.25")),
            donation("A", "0x02", "100", None),
            donation("B", "0x03", "100", Some("0")),
            donation("B", "0x04", "100", Some("1")),
        ];
        let r = round("90", RoundStatus::Closed);
        let proposals = ids(&["A", "B"]);
        let weighted = calculate_matches(
            &r,
            &proposals,
            &donations,
            QfOptions {
                weighted: true,
                dry_run: false,
            },
        )
        .unwrap();

        // A: sqrt(25) + sqrt(100) = 15, 225 - 125 = 100. B: sqrt(0) + sqrt(100) = 10, 100 - 100 = 0.
        assert!(weighted.weighted);
        assert_eq!(weighted.matches[0].raw_score, d("100"));
        assert_eq!(weighted.matches[1].raw_score, d("0"));
        assert_eq!(amount_of(&weighted, "A"), d("90"));

        let unweighted =
            calculate_matches(&r, &proposals, &donations, QfOptions::default()).unwrap();
        assert_eq!(amount_of(&unweighted, "A"), d("45"));
        assert_eq!(amount_of(&unweighted, "B"), d("45"));
    }

    #[test]
    fn test_open_round_requires_dry_run() {
        let r = round("10", RoundStatus::Active);
        let err = calculate_matches(&r, &[], &[], QfOptions::default()).unwrap_err();
        assert!(matches!(err, QfError::RoundNotClosed { .. }));

        let dry = QfOptions {
            weighted: false,
            dry_run: true,
        };
        assert!(calculate_matches(&r, &[], &[], dry).is_ok());
    }
}
