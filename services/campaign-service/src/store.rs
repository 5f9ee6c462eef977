use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::models::{
    Audience, Campaign, CampaignStatus, Contact, ContactStatus, JobStatus, NewCampaign, NewContact,
    NewJob, NewTemplate, QueueJob, QueueSummary, Template,
};

/// Persistence contract for the engine. Every job state transition is a
/// single conditional update keyed by job id, so a read-then-write pair can
/// never lose an update.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_contact(&self, contact: NewContact) -> Result<Contact, EngineError>;
    async fn contact_by_email(&self, email: &str) -> Result<Option<Contact>, EngineError>;
    async fn set_contact_status(
        &self,
        email: &str,
        status: ContactStatus,
    ) -> Result<bool, EngineError>;
    async fn touch_contact(&self, id: i64, at: DateTime<Utc>) -> Result<(), EngineError>;
    /// Active contacts matching the audience specifier. Empty is valid.
    async fn contacts_for_audience(&self, audience: Audience) -> Result<Vec<Contact>, EngineError>;

    async fn insert_template(&self, template: NewTemplate) -> Result<Template, EngineError>;
    async fn template_by_id(&self, id: i64) -> Result<Option<Template>, EngineError>;
    async fn add_template_usage(&self, id: i64, count: i64) -> Result<(), EngineError>;

    async fn insert_campaign(&self, campaign: NewCampaign) -> Result<Campaign, EngineError>;
    async fn campaign_by_id(&self, id: i64) -> Result<Option<Campaign>, EngineError>;
    async fn list_campaigns(&self) -> Result<Vec<Campaign>, EngineError>;
    /// Transition a campaign's status only when it currently sits in one of
    /// `from`. Returns whether the transition applied.
    async fn set_campaign_status(
        &self,
        id: i64,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool, EngineError>;
    async fn add_campaign_sent(&self, id: i64, count: i64) -> Result<(), EngineError>;
    async fn add_campaign_opened(&self, id: i64) -> Result<(), EngineError>;
    async fn add_campaign_clicked(&self, id: i64) -> Result<(), EngineError>;

    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<u64, EngineError>;
    async fn job_by_id(&self, id: i64) -> Result<Option<QueueJob>, EngineError>;
    async fn jobs_for_campaign(&self, id: i64) -> Result<Vec<QueueJob>, EngineError>;
    /// Atomically move up to `limit` due pending jobs to `sending` and return
    /// them ordered by scheduled time ascending. Jobs of a paused campaign
    /// are skipped. A claimed job is invisible to any other processor.
    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueueJob>, EngineError>;
    async fn mark_job_sent(&self, id: i64, at: DateTime<Utc>) -> Result<bool, EngineError>;
    async fn mark_job_failed(&self, id: i64, error: &str) -> Result<bool, EngineError>;
    /// Cancel a job still in `pending`. Returns whether it applied.
    async fn cancel_job(&self, id: i64) -> Result<bool, EngineError>;
    /// First-open-wins: stamps `opened_at` only when the job is `sent` and
    /// not yet opened, returning the updated row when the stamp applied.
    async fn record_open(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, EngineError>;
    async fn record_click(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, EngineError>;
    /// Jobs of a campaign still in flight (`pending` or `sending`).
    async fn open_jobs_for_campaign(&self, id: i64) -> Result<i64, EngineError>;
    /// Pending jobs already past due: the observable signal of a processor
    /// that is not running.
    async fn overdue_pending(&self, now: DateTime<Utc>) -> Result<Vec<QueueJob>, EngineError>;
    async fn queue_counts(&self) -> Result<QueueSummary, EngineError>;
}

/// In-memory store with the same transition semantics as the Postgres
/// implementation. Backs the test suite and the ephemeral dev mode.
pub struct MemStore {
    inner: Mutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    contacts: Vec<Contact>,
    templates: Vec<Template>,
    campaigns: Vec<Campaign>,
    jobs: Vec<QueueJob>,
    next_contact_id: i64,
    next_template_id: i64,
    next_campaign_id: i64,
    next_job_id: i64,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemInner::default()),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn insert_contact(&self, contact: NewContact) -> Result<Contact, EngineError> {
        let mut inner = self.inner.lock().await;
        if inner.contacts.iter().any(|c| c.email == contact.email) {
            return Err(EngineError::Validation(format!(
                "contact email already exists: {}",
                contact.email
            )));
        }
        inner.next_contact_id += 1;
        let contact = Contact {
            id: inner.next_contact_id,
            email: contact.email,
            name: contact.name,
            company: contact.company,
            contact_type: contact.contact_type,
            status: ContactStatus::Active,
            tags: contact.tags,
            last_contacted: None,
        };
        inner.contacts.push(contact.clone());
        Ok(contact)
    }

    async fn contact_by_email(&self, email: &str) -> Result<Option<Contact>, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner.contacts.iter().find(|c| c.email == email).cloned())
    }

    async fn set_contact_status(
        &self,
        email: &str,
        status: ContactStatus,
    ) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        match inner.contacts.iter_mut().find(|c| c.email == email) {
            Some(contact) => {
                contact.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_contact(&self, id: i64, at: DateTime<Utc>) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if let Some(contact) = inner.contacts.iter_mut().find(|c| c.id == id) {
            contact.last_contacted = Some(at);
        }
        Ok(())
    }

    async fn contacts_for_audience(&self, audience: Audience) -> Result<Vec<Contact>, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .contacts
            .iter()
            .filter(|contact| audience.includes(contact))
            .cloned()
            .collect())
    }

    async fn insert_template(&self, template: NewTemplate) -> Result<Template, EngineError> {
        let mut inner = self.inner.lock().await;
        inner.next_template_id += 1;
        let template = Template {
            id: inner.next_template_id,
            name: template.name,
            category: template.category,
            audience: template.audience,
            subject: template.subject,
            content: template.content,
            variables: template.variables,
            active: true,
            usage_count: 0,
        };
        inner.templates.push(template.clone());
        Ok(template)
    }

    async fn template_by_id(&self, id: i64) -> Result<Option<Template>, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner.templates.iter().find(|t| t.id == id).cloned())
    }

    async fn add_template_usage(&self, id: i64, count: i64) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if let Some(template) = inner.templates.iter_mut().find(|t| t.id == id) {
            template.usage_count += count;
        }
        Ok(())
    }

    async fn insert_campaign(&self, campaign: NewCampaign) -> Result<Campaign, EngineError> {
        let mut inner = self.inner.lock().await;
        inner.next_campaign_id += 1;
        let campaign = Campaign {
            id: inner.next_campaign_id,
            name: campaign.name,
            kind: campaign.kind,
            target_audience: campaign.target_audience,
            status: CampaignStatus::Draft,
            subject: campaign.subject,
            content: campaign.content,
            template_id: campaign.template_id,
            variables: campaign.variables,
            scheduled_date: campaign.scheduled_date,
            start_date: campaign.start_date,
            end_date: campaign.end_date,
            total_sent: 0,
            total_opened: 0,
            total_clicked: 0,
            total_converted: 0,
        };
        inner.campaigns.push(campaign.clone());
        Ok(campaign)
    }

    async fn campaign_by_id(&self, id: i64) -> Result<Option<Campaign>, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner.campaigns.iter().find(|c| c.id == id).cloned())
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner.campaigns.clone())
    }

    async fn set_campaign_status(
        &self,
        id: i64,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        match inner.campaigns.iter_mut().find(|c| c.id == id) {
            Some(campaign) if from.contains(&campaign.status) => {
                campaign.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_campaign_sent(&self, id: i64, count: i64) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if let Some(campaign) = inner.campaigns.iter_mut().find(|c| c.id == id) {
            campaign.total_sent += count;
        }
        Ok(())
    }

    async fn add_campaign_opened(&self, id: i64) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if let Some(campaign) = inner.campaigns.iter_mut().find(|c| c.id == id) {
            campaign.total_opened += 1;
        }
        Ok(())
    }

    async fn add_campaign_clicked(&self, id: i64) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if let Some(campaign) = inner.campaigns.iter_mut().find(|c| c.id == id) {
            campaign.total_clicked += 1;
        }
        Ok(())
    }

    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<u64, EngineError> {
        let mut inner = self.inner.lock().await;
        for job in jobs {
            inner.next_job_id += 1;
            let id = inner.next_job_id;
            inner.jobs.push(QueueJob {
                id,
                campaign_id: job.campaign_id,
                contact_id: job.contact_id,
                recipient: job.recipient.clone(),
                subject: job.subject.clone(),
                body: job.body.clone(),
                status: JobStatus::Pending,
                scheduled_time: job.scheduled_time,
                sent_time: None,
                error: None,
                opened_at: None,
                clicked_at: None,
            });
        }
        Ok(jobs.len() as u64)
    }

    async fn job_by_id(&self, id: i64) -> Result<Option<QueueJob>, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn jobs_for_campaign(&self, id: i64) -> Result<Vec<QueueJob>, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .iter()
            .filter(|j| j.campaign_id == Some(id))
            .cloned()
            .collect())
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueueJob>, EngineError> {
        let mut inner = self.inner.lock().await;
        let paused: HashSet<i64> = inner
            .campaigns
            .iter()
            .filter(|c| c.status == CampaignStatus::Paused)
            .map(|c| c.id)
            .collect();
        // Earliest due first, job id breaks ties.
        let mut due: Vec<(DateTime<Utc>, i64)> = inner
            .jobs
            .iter()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && j.scheduled_time <= now
                    && j.campaign_id.map_or(true, |id| !paused.contains(&id))
            })
            .map(|j| (j.scheduled_time, j.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) {
                job.status = JobStatus::Sending;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_job_sent(&self, id: i64, at: DateTime<Utc>) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.status == JobStatus::Sending => {
                job.status = JobStatus::Sent;
                job.sent_time = Some(at);
                job.error = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_job_failed(&self, id: i64, error: &str) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.status == JobStatus::Sending => {
                job.status = JobStatus::Failed;
                job.error = Some(error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_job(&self, id: i64) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_open(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, EngineError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.status == JobStatus::Sent && job.opened_at.is_none() => {
                job.opened_at = Some(at);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn record_click(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, EngineError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.status == JobStatus::Sent && job.clicked_at.is_none() => {
                job.clicked_at = Some(at);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn open_jobs_for_campaign(&self, id: i64) -> Result<i64, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .iter()
            .filter(|j| {
                j.campaign_id == Some(id)
                    && matches!(j.status, JobStatus::Pending | JobStatus::Sending)
            })
            .count() as i64)
    }

    async fn overdue_pending(&self, now: DateTime<Utc>) -> Result<Vec<QueueJob>, EngineError> {
        let inner = self.inner.lock().await;
        let mut overdue: Vec<QueueJob> = inner
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending && j.scheduled_time <= now)
            .cloned()
            .collect();
        overdue.sort_by_key(|j| (j.scheduled_time, j.id));
        Ok(overdue)
    }

    async fn queue_counts(&self) -> Result<QueueSummary, EngineError> {
        let inner = self.inner.lock().await;
        let mut counts: HashMap<JobStatus, u64> = HashMap::new();
        for job in &inner.jobs {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(QueueSummary {
            pending: counts.get(&JobStatus::Pending).copied().unwrap_or(0),
            sending: counts.get(&JobStatus::Sending).copied().unwrap_or(0),
            sent: counts.get(&JobStatus::Sent).copied().unwrap_or(0),
            failed: counts.get(&JobStatus::Failed).copied().unwrap_or(0),
            cancelled: counts.get(&JobStatus::Cancelled).copied().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContactType;
    use chrono::Duration;

    fn job_at(offset_secs: i64) -> NewJob {
        NewJob {
            campaign_id: None,
            contact_id: 1,
            recipient: "a@x.com".to_string(),
            subject: "s".to_string(),
            body: "b".to_string(),
            scheduled_time: Utc::now() + Duration::seconds(offset_secs),
        }
    }

    #[tokio::test]
    async fn claim_marks_jobs_sending_and_orders_by_due_time() {
        let store = MemStore::new();
        store
            .insert_jobs(&[job_at(-10), job_at(-30), job_at(-20), job_at(60)])
            .await
            .unwrap();

        let claimed = store.claim_due_jobs(Utc::now(), 50).await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed.windows(2).all(|w| w[0].scheduled_time <= w[1].scheduled_time));
        assert!(claimed.iter().all(|j| j.status == JobStatus::Sending));

        // A second claim finds nothing until jobs leave the sending state.
        let again = store.claim_due_jobs(Utc::now(), 50).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn record_open_requires_sent_and_applies_once() {
        let store = MemStore::new();
        store.insert_jobs(&[job_at(-5)]).await.unwrap();

        // Still pending: no stamp.
        assert!(store.record_open(1, Utc::now()).await.unwrap().is_none());

        store.claim_due_jobs(Utc::now(), 1).await.unwrap();
        store.mark_job_sent(1, Utc::now()).await.unwrap();

        assert!(store.record_open(1, Utc::now()).await.unwrap().is_some());
        assert!(store.record_open(1, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_counts_group_jobs_by_status() {
        let store = MemStore::new();
        store
            .insert_jobs(&[job_at(-10), job_at(-5), job_at(60)])
            .await
            .unwrap();

        store.claim_due_jobs(Utc::now(), 1).await.unwrap();
        store.mark_job_sent(1, Utc::now()).await.unwrap();
        store.claim_due_jobs(Utc::now(), 1).await.unwrap();
        store.mark_job_failed(2, "mailbox full").await.unwrap();

        let counts = store.queue_counts().await.unwrap();
        assert_eq!(counts.sent, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.sending, 0);
        assert_eq!(counts.cancelled, 0);
    }

    #[tokio::test]
    async fn duplicate_contact_email_is_rejected() {
        let store = MemStore::new();
        let new = NewContact {
            email: "dup@x.com".to_string(),
            name: "Dup".to_string(),
            company: None,
            contact_type: ContactType::Customer,
            tags: Vec::new(),
        };
        store.insert_contact(new.clone()).await.unwrap();
        assert!(matches!(
            store.insert_contact(new).await,
            Err(EngineError::Validation(_))
        ));
    }
}
