//! Monetary amounts and the approval threshold ladder.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;

use crate::config::ApprovalLimits;

/// `$1,250.00`, `€ 40`, `£5.5`, `¥300`
static SYMBOL_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[$€£¥]\s?(\d{1,3}(?:,\d{3})+(?:\.\d{1,2})?|\d+(?:\.\d{1,2})?)").unwrap()
});

/// `1,250.00 USD`, `40 eur`, `12 dollars`
static CODE_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,3}(?:,\d{3})+(?:\.\d{1,2})?|\d+(?:\.\d{1,2})?)\s?(usd|eur|gbp|jpy|dollars?|euros?|pounds?)\b",
    )
    .unwrap()
});

/// Currency amounts mentioned in `text`, in order of appearance. Bare
/// numbers without a currency marker are ignored.
pub fn extract_amounts(text: &str) -> Vec<Decimal> {
    let mut found: Vec<(usize, Decimal)> = SYMBOL_AMOUNT
        .captures_iter(text)
        .chain(CODE_AMOUNT.captures_iter(text))
        .filter_map(|caps| {
            let m = caps.get(1)?;
            let amount = Decimal::from_str(&m.as_str().replace(',', "")).ok()?;
            Some((m.start(), amount))
        })
        .collect();
    found.sort_by_key(|(pos, _)| *pos);
    found.dedup_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, amount)| amount).collect()
}

/// Who has to sign off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApprovalLevel {
    AutoApprove,
    Manager,
    Executive,
}

impl fmt::Display for ApprovalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AutoApprove => "auto_approve",
            Self::Manager => "manager",
            Self::Executive => "executive",
        };
        write!(f, "{s}")
    }
}

/// Linear threshold ladder over the largest amount.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalLadder {
    pub auto_limit: Decimal,
    pub manager_limit: Decimal,
}

impl ApprovalLadder {
    pub fn new(limits: ApprovalLimits) -> Self {
        Self {
            auto_limit: limits.auto_approve,
            manager_limit: limits.manager,
        }
    }

    /// Level for the largest of `amounts`. A financial item with no
    /// recognisable amount goes to a manager.
    pub fn level(&self, amounts: &[Decimal]) -> ApprovalLevel {
        let Some(max) = amounts.iter().max() else {
            return ApprovalLevel::Manager;
        };
        if *max < self.auto_limit {
            ApprovalLevel::AutoApprove
        } else if *max < self.manager_limit {
            ApprovalLevel::Manager
        } else {
            ApprovalLevel::Executive
        }
    }
}

impl Default for ApprovalLadder {
    fn default() -> Self {
        Self::new(ApprovalLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn extracts_symbol_amounts() {
        let amounts = extract_amounts("Invoice #42: $1,250.00 due, plus a €40 fee and £5.5 tip");
        assert_eq!(amounts, vec![dec!(1250.00), dec!(40), dec!(5.5)]);
    }

    #[test]
    fn extracts_code_amounts() {
        assert_eq!(extract_amounts("Please pay 300 USD by Friday"), vec![dec!(300)]);
        assert_eq!(extract_amounts("roughly 12 dollars"), vec![dec!(12)]);
    }

    #[test]
    fn ignores_bare_numbers() {
        assert!(extract_amounts("Order 12345 ships in 3 days").is_empty());
    }

    #[test]
    fn ladder_thresholds() {
        let ladder = ApprovalLadder::default();
        assert_eq!(ladder.level(&[dec!(49.99)]), ApprovalLevel::AutoApprove);
        assert_eq!(ladder.level(&[dec!(50)]), ApprovalLevel::Manager);
        assert_eq!(ladder.level(&[dec!(10), dec!(499.99)]), ApprovalLevel::Manager);
        assert_eq!(ladder.level(&[dec!(500)]), ApprovalLevel::Executive);
        assert_eq!(ladder.level(&[]), ApprovalLevel::Manager);
    }

    #[test]
    fn ladder_uses_configured_limits() {
        let ladder = ApprovalLadder {
            auto_limit: dec!(10),
            manager_limit: dec!(20),
        };
        assert_eq!(ladder.level(&[dec!(15)]), ApprovalLevel::Manager);
        assert_eq!(ladder.level(&[dec!(25)]), ApprovalLevel::Executive);
    }
}
