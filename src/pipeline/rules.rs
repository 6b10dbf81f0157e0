//! Triage rules for units in `Needs_Action`.
//!
//! Runs before any drafting to short-circuit obvious cases:
//! - phishing / scam patterns → Quarantine
//! - noreply senders, newsletters, automated mail → Archive (straight to Done)
//!
//! If no rule matches the unit falls through to classification.

use regex::Regex;
use tracing::debug;

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    Content,
}

/// The fields of a unit that rules look at.
#[derive(Debug, Clone, Default)]
pub struct TriageInput<'a> {
    pub sender: Option<&'a str>,
    pub subject: Option<&'a str>,
    pub content: &'a str,
}

impl<'a> TriageInput<'a> {
    fn field(&self, field: RuleField) -> Option<&'a str> {
        match field {
            RuleField::Sender => self.sender,
            RuleField::Subject => self.subject,
            RuleField::Content => Some(self.content),
        }
    }
}

/// Where a matched unit goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Quarantine { reason: String },
    Archive { reason: String },
}

/// A single rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Human-readable pattern description.
    pub pattern: String,
    pub regex: Regex,
    pub field: RuleField,
    /// Why this rule triggers; recorded on the unit.
    pub reason: String,
}

impl Rule {
    fn matches(&self, input: &TriageInput<'_>) -> bool {
        input
            .field(self.field)
            .is_some_and(|value| self.regex.is_match(value))
    }
}

/// Regex rules evaluated in order: quarantine first, then archive.
pub struct TriageRules {
    quarantine_rules: Vec<Rule>,
    archive_rules: Vec<Rule>,
    /// Senders that are never archived (still subject to quarantine).
    trusted_senders: Vec<Regex>,
}

impl TriageRules {
    /// Rules with the default suspicious-content and routine-mail patterns.
    pub fn default_rules() -> Self {
        let quarantine_rules = vec![
            Rule {
                pattern: "long digit run".into(),
                regex: Regex::new(r"[0-9]{10,}").unwrap(),
                field: RuleField::Content,
                reason: "suspicious: long number sequence".into(),
            },
            Rule {
                pattern: "pressure phrasing".into(),
                regex: Regex::new(r"(?i)(click here|act now|limited time|urgent attention)").unwrap(),
                field: RuleField::Content,
                reason: "suspicious: pressure phrasing".into(),
            },
            Rule {
                pattern: "account verification".into(),
                regex: Regex::new(r"(?i)(verify (your )?account|suspicious activity)").unwrap(),
                field: RuleField::Content,
                reason: "suspicious: account verification request".into(),
            },
            Rule {
                pattern: "credential request".into(),
                regex: Regex::new(
                    r"(?i)(password|login|account|credentials).*?(information|required)",
                )
                .unwrap(),
                field: RuleField::Content,
                reason: "suspicious: credential request".into(),
            },
        ];

        let archive_rules = vec![
            Rule {
                pattern: "noreply@*".into(),
                regex: Regex::new(r"(?i)^no[\-_.]?reply@").unwrap(),
                field: RuleField::Sender,
                reason: "noreply sender".into(),
            },
            Rule {
                pattern: "*@marketing.*".into(),
                regex: Regex::new(r"(?i)@(marketing|newsletter|promo|campaign)\b").unwrap(),
                field: RuleField::Sender,
                reason: "marketing/newsletter sender".into(),
            },
            Rule {
                pattern: "mailer-daemon".into(),
                regex: Regex::new(r"(?i)^(mailer[\-_]?daemon|postmaster)@").unwrap(),
                field: RuleField::Sender,
                reason: "automated mail system".into(),
            },
            Rule {
                pattern: "unsubscribe in subject".into(),
                regex: Regex::new(r"(?i)\bunsubscribe\b").unwrap(),
                field: RuleField::Subject,
                reason: "newsletter (unsubscribe in subject)".into(),
            },
            Rule {
                pattern: "unsubscribe footer".into(),
                regex: Regex::new(
                    r"(?i)(to unsubscribe|manage your subscription|email preferences|opt[- ]?out)",
                )
                .unwrap(),
                field: RuleField::Content,
                reason: "bulk email (unsubscribe footer)".into(),
            },
        ];

        Self {
            quarantine_rules,
            archive_rules,
            trusted_senders: Vec::new(),
        }
    }

    /// No rules at all.
    pub fn empty() -> Self {
        Self {
            quarantine_rules: Vec::new(),
            archive_rules: Vec::new(),
            trusted_senders: Vec::new(),
        }
    }

    pub fn add_trusted_sender(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.trusted_senders.push(Regex::new(pattern)?);
        Ok(())
    }

    pub fn add_quarantine_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.quarantine_rules.push(Rule {
            pattern: pattern.into(),
            regex: Regex::new(pattern)?,
            field,
            reason: reason.into(),
        });
        Ok(())
    }

    pub fn add_archive_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.archive_rules.push(Rule {
            pattern: pattern.into(),
            regex: Regex::new(pattern)?,
            field,
            reason: reason.into(),
        });
        Ok(())
    }

    /// First matching route, or `None` to fall through.
    pub fn evaluate(&self, input: &TriageInput<'_>) -> Option<Route> {
        if let Some(rule) = self.quarantine_rules.iter().find(|r| r.matches(input)) {
            debug!(rule = %rule.pattern, reason = %rule.reason, "Unit matched quarantine rule");
            return Some(Route::Quarantine {
                reason: rule.reason.clone(),
            });
        }

        let trusted = input
            .sender
            .is_some_and(|s| self.trusted_senders.iter().any(|r| r.is_match(s)));
        if trusted {
            debug!(sender = ?input.sender, "Trusted sender, skipping archive rules");
            return None;
        }

        if let Some(rule) = self.archive_rules.iter().find(|r| r.matches(input)) {
            debug!(rule = %rule.pattern, reason = %rule.reason, "Unit matched archive rule");
            return Some(Route::Archive {
                reason: rule.reason.clone(),
            });
        }

        None
    }
}

/// Coarse category of a unit's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Financial,
    Urgent,
    Opportunity,
    Operational,
    Routine,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Financial => "financial",
            Self::Urgent => "urgent",
            Self::Opportunity => "opportunity",
            Self::Operational => "operational",
            Self::Routine => "routine",
        }
    }
}

/// Keyword classification, first match wins.
pub fn categorize(text: &str) -> Category {
    let lower = text.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if any(&["invoice", "payment", "bill", "financial"]) {
        Category::Financial
    } else if any(&["urgent", "asap", "immediate"]) {
        Category::Urgent
    } else if any(&["opportunity", "offer", "deal"]) {
        Category::Opportunity
    } else if any(&["meeting", "schedule", "appointment"]) {
        Category::Operational
    } else {
        Category::Routine
    }
}

/// Priority label from urgency phrasing.
pub fn priority(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if any(&["urgent", "asap", "immediate action", "critical"]) {
        "critical"
    } else if any(&["today", "within 24 hours", "expedited"]) {
        "high"
    } else if any(&["soon", "this week", "needed", "required"]) {
        "medium"
    } else {
        "low"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(sender: &'a str, subject: Option<&'a str>, content: &'a str) -> TriageInput<'a> {
        TriageInput {
            sender: Some(sender),
            subject,
            content,
        }
    }

    #[test]
    fn archives_noreply() {
        let rules = TriageRules::default_rules();
        let result = rules.evaluate(&input("noreply@example.com", None, "Hello"));
        assert!(matches!(result, Some(Route::Archive { .. })));
    }

    #[test]
    fn archives_no_dash_reply() {
        let rules = TriageRules::default_rules();
        let result = rules.evaluate(&input("no-reply@service.com", None, "Hello"));
        assert!(matches!(result, Some(Route::Archive { .. })));
    }

    #[test]
    fn archives_marketing_domain() {
        let rules = TriageRules::default_rules();
        let result = rules.evaluate(&input("deals@newsletter.shop.com", None, "Hi"));
        assert!(matches!(result, Some(Route::Archive { .. })));
    }

    #[test]
    fn archives_unsubscribe_subject() {
        let rules = TriageRules::default_rules();
        let result = rules.evaluate(&input(
            "info@store.com",
            Some("Unsubscribe from our list"),
            "content",
        ));
        assert!(matches!(result, Some(Route::Archive { .. })));
    }

    #[test]
    fn quarantines_credential_phishing() {
        let rules = TriageRules::default_rules();
        let result = rules.evaluate(&input(
            "security@bank.example",
            Some("Action needed"),
            "Your login information is required to continue.",
        ));
        assert_eq!(
            result,
            Some(Route::Quarantine {
                reason: "suspicious: credential request".into()
            })
        );
    }

    #[test]
    fn quarantine_checked_before_archive() {
        let rules = TriageRules::default_rules();
        let result = rules.evaluate(&input(
            "noreply@example.com",
            None,
            "Please verify your account now",
        ));
        assert!(matches!(result, Some(Route::Quarantine { .. })));
    }

    #[test]
    fn trusted_sender_skips_archive_but_not_quarantine() {
        let mut rules = TriageRules::default_rules();
        rules.add_trusted_sender(r"(?i)@partner\.com$").unwrap();

        let archived = rules.evaluate(&input(
            "noreply@partner.com",
            None,
            "Monthly report attached",
        ));
        assert_eq!(archived, None);

        let quarantined = rules.evaluate(&input(
            "noreply@partner.com",
            None,
            "Act now, limited time!",
        ));
        assert!(matches!(quarantined, Some(Route::Quarantine { .. })));
    }

    #[test]
    fn passes_through_legitimate_email() {
        let rules = TriageRules::default_rules();
        let result = rules.evaluate(&input(
            "alice@company.com",
            Some("Project update"),
            "Hey, here's the latest on the project.",
        ));
        assert_eq!(result, None);
    }

    #[test]
    fn senderless_units_only_see_content_rules() {
        let rules = TriageRules::default_rules();
        let social = TriageInput {
            sender: None,
            subject: None,
            content: "Excited to share our new release!",
        };
        assert_eq!(rules.evaluate(&social), None);
    }

    #[test]
    fn custom_rules() {
        let mut rules = TriageRules::empty();
        rules
            .add_archive_rule(r"(?i)weekly digest", RuleField::Subject, "digest")
            .unwrap();
        let result = rules.evaluate(&input("a@b.com", Some("Your Weekly Digest"), ""));
        assert_eq!(
            result,
            Some(Route::Archive {
                reason: "digest".into()
            })
        );
        assert!(rules.add_quarantine_rule("(", RuleField::Content, "bad").is_err());
    }

    #[test]
    fn empty_rules_pass_everything() {
        let rules = TriageRules::empty();
        assert_eq!(rules.evaluate(&input("noreply@x.com", None, "click here")), None);
    }

    #[test]
    fn categories_and_priority() {
        assert_eq!(categorize("Invoice #42 attached"), Category::Financial);
        assert_eq!(categorize("Need this ASAP"), Category::Urgent);
        assert_eq!(categorize("Let's schedule a meeting"), Category::Operational);
        assert_eq!(categorize("hello"), Category::Routine);

        assert_eq!(priority("URGENT: server down"), "critical");
        assert_eq!(priority("please reply today"), "high");
        assert_eq!(priority("needed this week"), "medium");
        assert_eq!(priority("whenever"), "low");
    }
}
