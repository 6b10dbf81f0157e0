//! Lifecycle stages and the platforms that own pending approvals.
//!
//! A unit of work's stage is the directory that contains it. The enum is the
//! internal representation; directory names only appear in `relative_dir()`
//! and `FromStr`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fixed directory names.
pub mod dirs {
    pub const INBOX: &str = "Inbox";
    pub const NEEDS_ACTION: &str = "Needs_Action";
    pub const PENDING_APPROVAL: &str = "Pending_Approval";
    pub const IN_PROGRESS: &str = "In_Progress";
    pub const APPROVED: &str = "Approved";
    pub const REJECTED: &str = "Rejected";
    pub const DONE: &str = "Done";
    pub const FAILED: &str = "Failed";
    pub const QUARANTINE: &str = "Quarantine";
    pub const LOGS: &str = "Logs";
    pub const STATE: &str = "state";
}

/// Pending-approval bucket for units with no recognised platform.
pub const GENERAL_BUCKET: &str = "General";

/// A lifecycle stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage", content = "name")]
pub enum Stage {
    /// Raw drops waiting for a producer.
    Inbox,
    NeedsAction,
    /// Awaiting a human decision, bucketed by platform directory name.
    PendingApproval(String),
    /// Exclusively owned by the named agent.
    InProgress(String),
    Approved,
    Rejected,
    Done,
    Failed,
    Quarantine,
    /// Any other directory under the vault root.
    Other(String),
}

impl Stage {
    /// Pending approval bucket for a platform.
    pub fn pending(platform: Option<Platform>) -> Self {
        Self::PendingApproval(
            platform
                .map(|p| p.dir_name().to_string())
                .unwrap_or_else(|| GENERAL_BUCKET.to_string()),
        )
    }

    /// Directory of this stage relative to the vault root.
    pub fn relative_dir(&self) -> PathBuf {
        match self {
            Self::Inbox => PathBuf::from(dirs::INBOX),
            Self::NeedsAction => PathBuf::from(dirs::NEEDS_ACTION),
            Self::PendingApproval(bucket) => PathBuf::from(dirs::PENDING_APPROVAL).join(bucket),
            Self::InProgress(agent) => PathBuf::from(dirs::IN_PROGRESS).join(agent),
            Self::Approved => PathBuf::from(dirs::APPROVED),
            Self::Rejected => PathBuf::from(dirs::REJECTED),
            Self::Done => PathBuf::from(dirs::DONE),
            Self::Failed => PathBuf::from(dirs::FAILED),
            Self::Quarantine => PathBuf::from(dirs::QUARANTINE),
            Self::Other(name) => PathBuf::from(name),
        }
    }

    /// Terminal stages keep files as an audit trail; nothing acts on them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Quarantine | Self::Rejected
        )
    }

    /// Whether a unit in `self` may be moved to `target`.
    pub fn can_transition_to(&self, target: &Stage) -> bool {
        use Stage::*;

        if self == target {
            return false;
        }

        match (self, target) {
            // Ad-hoc folders are outside the lifecycle.
            (Other(_), _) | (_, Other(_)) => true,
            // Terminal files never re-enter the pipeline.
            (from, _) if from.is_terminal() => false,
            (Inbox, NeedsAction | InProgress(_) | Done | Failed | Quarantine) => true,
            (Inbox, _) => false,
            (NeedsAction, Inbox) => false,
            (NeedsAction, _) => true,
            (InProgress(_), InProgress(_)) => false,
            (InProgress(_), Inbox) => false,
            (InProgress(_), _) => true,
            (PendingApproval(_), Approved | Rejected | Quarantine | Failed) => true,
            (PendingApproval(_), _) => false,
            (Approved, InProgress(_) | Done | Failed | Quarantine) => true,
            (Approved, _) => false,
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingApproval(bucket) => write!(f, "{}/{}", dirs::PENDING_APPROVAL, bucket),
            Self::InProgress(agent) => write!(f, "{}/{}", dirs::IN_PROGRESS, agent),
            other => write!(f, "{}", other.relative_dir().display()),
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err("Empty stage name".to_string());
        }
        let (head, rest) = match trimmed.split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (trimmed, None),
        };

        let stage = match (head, rest) {
            (dirs::INBOX, None) => Self::Inbox,
            (dirs::NEEDS_ACTION, None) => Self::NeedsAction,
            (dirs::PENDING_APPROVAL, Some(bucket)) if !bucket.contains('/') => {
                Self::PendingApproval(bucket.to_string())
            }
            (dirs::PENDING_APPROVAL, None) => Self::PendingApproval(GENERAL_BUCKET.to_string()),
            (dirs::IN_PROGRESS, Some(agent)) if !agent.contains('/') => {
                Self::InProgress(agent.to_string())
            }
            (dirs::APPROVED, None) => Self::Approved,
            (dirs::REJECTED, None) => Self::Rejected,
            (dirs::DONE, None) => Self::Done,
            (dirs::FAILED, None) => Self::Failed,
            (dirs::QUARANTINE, None) => Self::Quarantine,
            (dirs::LOGS | dirs::STATE, _) => {
                return Err(format!("{trimmed} is reserved and not a stage"));
            }
            _ => {
                if trimmed.split('/').any(|c| c == ".." || c == ".") {
                    return Err(format!("Stage path must not contain relative components: {trimmed}"));
                }
                Self::Other(trimmed.to_string())
            }
        };
        Ok(stage)
    }
}

/// External platforms a posting worker can deliver to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Email,
    WhatsApp,
    Twitter,
    Instagram,
    LinkedIn,
    Facebook,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Self::Email,
        Self::WhatsApp,
        Self::Twitter,
        Self::Instagram,
        Self::LinkedIn,
        Self::Facebook,
    ];

    /// Bucket directory under `Pending_Approval/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Email => "Email",
            Self::WhatsApp => "WhatsApp",
            Self::Twitter => "Twitter",
            Self::Instagram => "Instagram",
            Self::LinkedIn => "LinkedIn",
            Self::Facebook => "Facebook",
        }
    }

    /// Guess the platform from filename tags such as `TWEET_` or `WA_`.
    pub fn detect_from_filename(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        let has = |tags: &[&str]| tags.iter().any(|t| upper.contains(t));

        if has(&["LINKEDIN", "LI_POST"]) {
            Some(Self::LinkedIn)
        } else if has(&["INSTAGRAM", "IG_POST"]) {
            Some(Self::Instagram)
        } else if has(&["TWITTER", "TW_POST", "TWEET"]) {
            Some(Self::Twitter)
        } else if has(&["WHATSAPP", "WA_"]) {
            Some(Self::WhatsApp)
        } else if has(&["EMAIL", "MAIL"]) {
            Some(Self::Email)
        } else if has(&["FACEBOOK", "FB_POST"]) {
            Some(Self::Facebook)
        } else {
            None
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Email => "email",
            Self::WhatsApp => "whatsapp",
            Self::Twitter => "twitter",
            Self::Instagram => "instagram",
            Self::LinkedIn => "linkedin",
            Self::Facebook => "facebook",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let name = ["_post", "_reply", "_message", "_draft"]
            .iter()
            .find_map(|suffix| lower.strip_suffix(suffix))
            .unwrap_or(&lower);

        match name {
            "email" | "mail" | "emails" => Ok(Self::Email),
            "whatsapp" | "wa" => Ok(Self::WhatsApp),
            "twitter" | "x" | "tweet" => Ok(Self::Twitter),
            "instagram" | "ig" => Ok(Self::Instagram),
            "linkedin" => Ok(Self::LinkedIn),
            "facebook" | "fb" => Ok(Self::Facebook),
            _ => Err(format!("Unknown platform: {lower}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_allowed() {
        let agent = Stage::InProgress("a".into());
        let pending = Stage::pending(Some(Platform::Email));

        assert!(Stage::NeedsAction.can_transition_to(&agent));
        assert!(agent.can_transition_to(&pending));
        assert!(pending.can_transition_to(&Stage::Approved));
        assert!(pending.can_transition_to(&Stage::Rejected));
        assert!(Stage::Approved.can_transition_to(&agent));
        assert!(agent.can_transition_to(&Stage::Done));
        assert!(agent.can_transition_to(&Stage::Failed));
        assert!(Stage::Inbox.can_transition_to(&Stage::NeedsAction));
        assert!(Stage::Inbox.can_transition_to(&agent));
    }

    #[test]
    fn terminal_stages_are_sealed() {
        for terminal in [Stage::Done, Stage::Failed, Stage::Quarantine, Stage::Rejected] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(&Stage::Approved));
            assert!(!terminal.can_transition_to(&Stage::InProgress("a".into())));
            assert!(!terminal.can_transition_to(&Stage::NeedsAction));
            assert!(terminal.can_transition_to(&Stage::Other("Archive".into())));
        }
    }

    #[test]
    fn pending_cannot_skip_the_gate() {
        let pending = Stage::pending(None);
        assert!(!pending.can_transition_to(&Stage::Done));
        assert!(!pending.can_transition_to(&Stage::InProgress("a".into())));
    }

    #[test]
    fn agents_cannot_hand_off_directly() {
        let a = Stage::InProgress("a".into());
        let b = Stage::InProgress("b".into());
        assert!(!a.can_transition_to(&b));
        assert!(!a.can_transition_to(&a));
    }

    #[test]
    fn stage_dir_names_roundtrip() {
        let stages = [
            Stage::Inbox,
            Stage::NeedsAction,
            Stage::PendingApproval("Twitter".into()),
            Stage::InProgress("cloud_agent".into()),
            Stage::Approved,
            Stage::Rejected,
            Stage::Done,
            Stage::Failed,
            Stage::Quarantine,
            Stage::Other("Sent_Test".into()),
        ];
        for stage in stages {
            let parsed: Stage = stage.to_string().parse().unwrap();
            assert_eq!(parsed, stage);
        }
    }

    #[test]
    fn reserved_and_relative_names_rejected() {
        assert!("Logs".parse::<Stage>().is_err());
        assert!("state".parse::<Stage>().is_err());
        assert!("../outside".parse::<Stage>().is_err());
        assert!("".parse::<Stage>().is_err());
    }

    #[test]
    fn pending_without_platform_uses_general_bucket() {
        assert_eq!(
            Stage::pending(None).relative_dir(),
            PathBuf::from("Pending_Approval/General")
        );
        assert_eq!(
            "Pending_Approval".parse::<Stage>().unwrap(),
            Stage::PendingApproval("General".into())
        );
    }

    #[test]
    fn platform_aliases() {
        assert_eq!("X".parse::<Platform>().unwrap(), Platform::Twitter);
        assert_eq!("WhatsApp".parse::<Platform>().unwrap(), Platform::WhatsApp);
        assert_eq!("mail".parse::<Platform>().unwrap(), Platform::Email);
        assert_eq!("linkedin_post".parse::<Platform>().unwrap(), Platform::LinkedIn);
        assert_eq!("email_reply".parse::<Platform>().unwrap(), Platform::Email);
        assert!("myspace".parse::<Platform>().is_err());
    }

    #[test]
    fn platform_from_filename() {
        assert_eq!(
            Platform::detect_from_filename("TWEET_20260101_120000.md"),
            Some(Platform::Twitter)
        );
        assert_eq!(
            Platform::detect_from_filename("wa_reply.md"),
            Some(Platform::WhatsApp)
        );
        assert_eq!(
            Platform::detect_from_filename("EMAIL_REPLY_DRAFT_1.md"),
            Some(Platform::Email)
        );
        assert_eq!(Platform::detect_from_filename("invoice_42.md"), None);
    }
}
