use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactType {
    Team,
    Customer,
    Client,
    Partner,
    Sponsor,
}

impl ContactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactType::Team => "team",
            ContactType::Customer => "customer",
            ContactType::Client => "client",
            ContactType::Partner => "partner",
            ContactType::Sponsor => "sponsor",
        }
    }
}

impl FromStr for ContactType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "team" => Ok(ContactType::Team),
            "customer" => Ok(ContactType::Customer),
            "client" => Ok(ContactType::Client),
            "partner" => Ok(ContactType::Partner),
            "sponsor" => Ok(ContactType::Sponsor),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Active,
    Unsubscribed,
    Bounced,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatus::Active => "active",
            ContactStatus::Unsubscribed => "unsubscribed",
            ContactStatus::Bounced => "bounced",
        }
    }
}

impl FromStr for ContactStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ContactStatus::Active),
            "unsubscribed" => Ok(ContactStatus::Unsubscribed),
            "bounced" => Ok(ContactStatus::Bounced),
            _ => Err(()),
        }
    }
}

/// Target specifier for a campaign: every active contact, or one segment of
/// the closed contact-type set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Audience {
    All,
    Only(ContactType),
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::All => "all",
            Audience::Only(contact_type) => contact_type.as_str(),
        }
    }

    /// Unsubscribed and bounced contacts are never part of an audience.
    pub fn includes(&self, contact: &Contact) -> bool {
        if contact.status != ContactStatus::Active {
            return false;
        }
        match self {
            Audience::All => true,
            Audience::Only(contact_type) => contact.contact_type == *contact_type,
        }
    }
}

impl FromStr for Audience {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(Audience::All);
        }
        s.parse::<ContactType>().map(Audience::Only)
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Audience {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .parse()
            .map_err(|_| format!("unknown audience: {value}"))
    }
}

impl From<Audience> for String {
    fn from(value: Audience) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CampaignKind {
    #[default]
    Email,
    Social,
    Content,
    Mixed,
}

impl CampaignKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignKind::Email => "email",
            CampaignKind::Social => "social",
            CampaignKind::Content => "content",
            CampaignKind::Mixed => "mixed",
        }
    }
}

impl FromStr for CampaignKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(CampaignKind::Email),
            "social" => Ok(CampaignKind::Social),
            "content" => Ok(CampaignKind::Content),
            "mixed" => Ok(CampaignKind::Mixed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
        }
    }
}

impl FromStr for CampaignStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "running" => Ok(CampaignStatus::Running),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            _ => Err(()),
        }
    }
}

/// Delivery lifecycle of a queued job. `sending` is the in-flight claim
/// marker; a job leaves `pending` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Sending => "sending",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "sending" => Ok(JobStatus::Sending),
            "sent" => Ok(JobStatus::Sent),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Contact {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub company: Option<String>,
    pub contact_type: ContactType,
    pub status: ContactStatus,
    pub tags: Vec<String>,
    pub last_contacted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewContact {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub company: Option<String>,
    pub contact_type: ContactType,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub category: Option<String>,
    pub audience: Option<ContactType>,
    pub subject: String,
    pub content: String,
    pub variables: Vec<String>,
    pub active: bool,
    pub usage_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub audience: Option<ContactType>,
    pub subject: String,
    pub content: String,
    #[serde(default)]
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub kind: CampaignKind,
    pub target_audience: Audience,
    pub status: CampaignStatus,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub template_id: Option<i64>,
    pub variables: HashMap<String, String>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub total_sent: i64,
    pub total_opened: i64,
    pub total_clicked: i64,
    pub total_converted: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    #[serde(default)]
    pub kind: CampaignKind,
    pub target_audience: Audience,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub template_id: Option<i64>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub scheduled_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueJob {
    pub id: i64,
    pub campaign_id: Option<i64>,
    pub contact_id: i64,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: JobStatus,
    pub scheduled_time: DateTime<Utc>,
    pub sent_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub campaign_id: Option<i64>,
    pub contact_id: i64,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub scheduled_time: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct ProcessReport {
    pub processed: u64,
    pub sent: u64,
    pub failed: u64,
}

#[derive(Debug, Serialize)]
pub struct QueueReport {
    pub campaign_id: i64,
    pub queued: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct QueueSummary {
    pub pending: u64,
    pub sending: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Serialize)]
pub struct LiveSummary {
    pub updated_at: String,
    pub queue: QueueSummary,
    pub campaigns: Vec<Campaign>,
}

#[derive(Deserialize)]
pub struct UnsubscribeRequest {
    pub email: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(contact_type: ContactType, status: ContactStatus) -> Contact {
        Contact {
            id: 1,
            email: "a@x.com".to_string(),
            name: "Ana".to_string(),
            company: None,
            contact_type,
            status,
            tags: Vec::new(),
            last_contacted: None,
        }
    }

    #[test]
    fn audience_all_includes_every_active_type() {
        for contact_type in [
            ContactType::Team,
            ContactType::Customer,
            ContactType::Client,
            ContactType::Partner,
            ContactType::Sponsor,
        ] {
            assert!(Audience::All.includes(&contact(contact_type, ContactStatus::Active)));
        }
    }

    #[test]
    fn audience_never_includes_unsubscribed_or_bounced() {
        let audience = Audience::Only(ContactType::Customer);
        assert!(!audience.includes(&contact(ContactType::Customer, ContactStatus::Unsubscribed)));
        assert!(!audience.includes(&contact(ContactType::Customer, ContactStatus::Bounced)));
        assert!(!Audience::All.includes(&contact(ContactType::Customer, ContactStatus::Bounced)));
    }

    #[test]
    fn audience_segment_filters_by_type() {
        let audience = Audience::Only(ContactType::Partner);
        assert!(audience.includes(&contact(ContactType::Partner, ContactStatus::Active)));
        assert!(!audience.includes(&contact(ContactType::Customer, ContactStatus::Active)));
    }

    #[test]
    fn audience_round_trips_through_strings() {
        assert_eq!("all".parse::<Audience>(), Ok(Audience::All));
        assert_eq!(
            "sponsor".parse::<Audience>(),
            Ok(Audience::Only(ContactType::Sponsor))
        );
        assert!("everyone".parse::<Audience>().is_err());
        assert_eq!(Audience::Only(ContactType::Client).as_str(), "client");
    }

    #[test]
    fn job_status_round_trips() {
        for status in [
            JobStatus::Pending,
            JobStatus::Sending,
            JobStatus::Sent,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
    }
}
