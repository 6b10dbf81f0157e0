//! Templated reply drafts derived from inbound units.

use crate::vault::UnitFile;

/// Header key linking a draft back to the unit it answers.
pub const SOURCE_FILE: &str = "source_file";
/// Header key recorded on the source once a draft exists.
pub const DRAFT_FILE: &str = "draft_file";

/// Heading the posting workers read the message text from.
pub const DRAFT_REPLY_HEADING: &str = "Draft Reply";

/// Kind of email, chosen from the subject line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Invoice,
    Urgent,
    Meeting,
    JobOpportunity,
    Support,
    Newsletter,
    General,
}

impl ReplyKind {
    pub fn from_subject(subject: &str) -> Self {
        let lower = subject.to_lowercase();
        let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        if any(&["invoice", "payment", "bill"]) {
            Self::Invoice
        } else if any(&["urgent", "asap", "immediately"]) {
            Self::Urgent
        } else if any(&["meeting", "schedule", "calendar"]) {
            Self::Meeting
        } else if any(&["job", "opportunity", "position", "hiring"]) {
            Self::JobOpportunity
        } else if any(&["question", "help", "support", "issue"]) {
            Self::Support
        } else if any(&["newsletter", "update", "announcement"]) {
            Self::Newsletter
        } else {
            Self::General
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Urgent => "urgent",
            Self::Meeting => "meeting",
            Self::JobOpportunity => "job_opportunity",
            Self::Support => "support",
            Self::Newsletter => "newsletter",
            Self::General => "general",
        }
    }

    fn template(&self, subject: &str) -> String {
        let text = match self {
            Self::Invoice => format!(
                "Thank you for sending the invoice.\n\nI have received your invoice regarding {subject} and will review it promptly. If everything is in order I will process the payment according to our standard terms."
            ),
            Self::Urgent => "Thank you for bringing this to my attention.\n\nI understand the urgency and will review the details and get back to you as soon as possible.".to_string(),
            Self::Meeting => "Thank you for reaching out about a meeting.\n\nI would be happy to meet. Please let me know your availability and I will do my best to accommodate.".to_string(),
            Self::JobOpportunity => "Thank you for thinking of me for this position.\n\nI would be happy to learn more about the role.".to_string(),
            Self::Support => "Thank you for reaching out.\n\nI have received your inquiry and will follow up with more information or a resolution as soon as possible.".to_string(),
            Self::Newsletter => "Thank you for the update.\n\nI have noted the information shared.".to_string(),
            Self::General => "Thank you for your email.\n\nI have received your message and will get back to you as soon as possible.".to_string(),
        };
        format!("{text}\n\nBest regards")
    }
}

/// Reply draft for an inbound email, bound for `Pending_Approval/Email`.
pub fn email_reply(source_name: &str, sender: &str, subject: &str, original_body: &str) -> UnitFile {
    let kind = ReplyKind::from_subject(subject);
    let reply_subject = if subject.trim_start().to_lowercase().starts_with("re:") {
        subject.trim().to_string()
    } else {
        format!("Re: {}", subject.trim())
    };

    let summary: String = original_body.trim().chars().take(500).collect();
    let body = format!(
        "\n# Email Reply Draft\n\n**To:** {sender}\n**Subject:** {reply_subject}\n\n## Original Message Summary\n\n{summary}\n\n## {DRAFT_REPLY_HEADING}\n\n{reply}\n\n## Actions\n\n- Edit the draft reply above if needed\n- Approve to send, or reject\n",
        reply = kind.template(subject.trim()),
    );

    UnitFile::new(
        "email",
        [
            ("platform", "email".to_string()),
            ("to", sender.to_string()),
            ("subject", reply_subject),
            ("email_type", kind.as_str().to_string()),
            (SOURCE_FILE, source_name.to_string()),
            ("status", "pending_approval".to_string()),
        ],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_kind_from_subject() {
        assert_eq!(ReplyKind::from_subject("Invoice #12"), ReplyKind::Invoice);
        assert_eq!(ReplyKind::from_subject("Can we schedule a call?"), ReplyKind::Meeting);
        assert_eq!(ReplyKind::from_subject("Quick question"), ReplyKind::Support);
        assert_eq!(ReplyKind::from_subject("Hello"), ReplyKind::General);
    }

    #[test]
    fn email_reply_has_headers_and_draft_section() {
        let draft = email_reply(
            "EMAIL_20260101_120000_abcd1234.md",
            "alice@example.com",
            "Meeting next week",
            "Can we meet on Tuesday?",
        );
        assert_eq!(draft.get("type"), Some("email"));
        assert_eq!(draft.get("to"), Some("alice@example.com"));
        assert_eq!(draft.get("subject"), Some("Re: Meeting next week"));
        assert_eq!(draft.get("status"), Some("pending_approval"));
        assert_eq!(
            draft.get(SOURCE_FILE),
            Some("EMAIL_20260101_120000_abcd1234.md")
        );

        let reply = draft.section(DRAFT_REPLY_HEADING).unwrap();
        assert!(reply.starts_with("Thank you for reaching out about a meeting."));
        assert!(reply.ends_with("Best regards"));
    }

    #[test]
    fn existing_re_prefix_not_doubled() {
        let draft = email_reply("a.md", "b@c.com", "RE: status", "");
        assert_eq!(draft.get("subject"), Some("RE: status"));
    }
}
