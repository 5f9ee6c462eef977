use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Row};

use crate::error::EngineError;
use crate::models::{
    Audience, Campaign, CampaignStatus, Contact, ContactStatus, ContactType, JobStatus,
    NewCampaign, NewContact, NewJob, NewTemplate, QueueJob, QueueSummary, Template,
};
use crate::store::Store;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS contacts (
    id BIGSERIAL PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    company TEXT,
    contact_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    tags JSONB NOT NULL DEFAULT '[]',
    last_contacted TIMESTAMPTZ
);
CREATE TABLE IF NOT EXISTS templates (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    category TEXT,
    audience TEXT,
    subject TEXT NOT NULL,
    content TEXT NOT NULL,
    variables JSONB NOT NULL DEFAULT '[]',
    active BOOLEAN NOT NULL DEFAULT TRUE,
    usage_count BIGINT NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS campaigns (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'email',
    target_audience TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft',
    subject TEXT,
    content TEXT,
    template_id BIGINT REFERENCES templates(id),
    variables JSONB NOT NULL DEFAULT '{}',
    scheduled_date TIMESTAMPTZ,
    start_date TIMESTAMPTZ,
    end_date TIMESTAMPTZ,
    total_sent BIGINT NOT NULL DEFAULT 0,
    total_opened BIGINT NOT NULL DEFAULT 0,
    total_clicked BIGINT NOT NULL DEFAULT 0,
    total_converted BIGINT NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS queue_jobs (
    id BIGSERIAL PRIMARY KEY,
    campaign_id BIGINT REFERENCES campaigns(id),
    contact_id BIGINT NOT NULL REFERENCES contacts(id),
    recipient TEXT NOT NULL,
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    scheduled_time TIMESTAMPTZ NOT NULL,
    sent_time TIMESTAMPTZ,
    error TEXT,
    opened_at TIMESTAMPTZ,
    clicked_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_queue_jobs_due ON queue_jobs (status, scheduled_time);
CREATE INDEX IF NOT EXISTS idx_queue_jobs_campaign ON queue_jobs (campaign_id);
";

const SQL_INSERT_CONTACT: &str = "INSERT INTO contacts (email, name, company, contact_type, tags) \
VALUES ($1, $2, $3, $4, $5) RETURNING *";
const SQL_CONTACT_BY_EMAIL: &str = "SELECT * FROM contacts WHERE email = $1";
const SQL_SET_CONTACT_STATUS: &str = "UPDATE contacts SET status = $2 WHERE email = $1";
const SQL_TOUCH_CONTACT: &str = "UPDATE contacts SET last_contacted = $2 WHERE id = $1";
const SQL_ACTIVE_CONTACTS: &str = "SELECT * FROM contacts WHERE status = 'active' ORDER BY id";
const SQL_ACTIVE_CONTACTS_BY_TYPE: &str =
    "SELECT * FROM contacts WHERE status = 'active' AND contact_type = $1 ORDER BY id";

const SQL_INSERT_TEMPLATE: &str =
    "INSERT INTO templates (name, category, audience, subject, content, variables) \
VALUES ($1, $2, $3, $4, $5, $6) RETURNING *";
const SQL_TEMPLATE_BY_ID: &str = "SELECT * FROM templates WHERE id = $1";
const SQL_ADD_TEMPLATE_USAGE: &str =
    "UPDATE templates SET usage_count = usage_count + $2 WHERE id = $1";

const SQL_INSERT_CAMPAIGN: &str = "INSERT INTO campaigns \
(name, kind, target_audience, subject, content, template_id, variables, scheduled_date, start_date, end_date) \
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING *";
const SQL_CAMPAIGN_BY_ID: &str = "SELECT * FROM campaigns WHERE id = $1";
const SQL_LIST_CAMPAIGNS: &str = "SELECT * FROM campaigns ORDER BY id";
const SQL_SET_CAMPAIGN_STATUS: &str =
    "UPDATE campaigns SET status = $2 WHERE id = $1 AND status = ANY($3)";
const SQL_ADD_CAMPAIGN_SENT: &str =
    "UPDATE campaigns SET total_sent = total_sent + $2 WHERE id = $1";
const SQL_ADD_CAMPAIGN_OPENED: &str =
    "UPDATE campaigns SET total_opened = total_opened + 1 WHERE id = $1";
const SQL_ADD_CAMPAIGN_CLICKED: &str =
    "UPDATE campaigns SET total_clicked = total_clicked + 1 WHERE id = $1";

const SQL_INSERT_JOB: &str = "INSERT INTO queue_jobs \
(campaign_id, contact_id, recipient, subject, body, scheduled_time) \
VALUES ($1, $2, $3, $4, $5, $6)";
const SQL_JOB_BY_ID: &str = "SELECT * FROM queue_jobs WHERE id = $1";
const SQL_JOBS_FOR_CAMPAIGN: &str =
    "SELECT * FROM queue_jobs WHERE campaign_id = $1 ORDER BY id";
// The claim step: move due pending jobs to 'sending' in one statement so
// concurrent processors never pick up the same job. Jobs of a paused
// campaign stay pending.
const SQL_CLAIM_DUE_JOBS: &str = "WITH due AS (\
  SELECT id FROM queue_jobs \
  WHERE status = 'pending' AND scheduled_time <= $1 \
  AND NOT EXISTS (\
    SELECT 1 FROM campaigns \
    WHERE campaigns.id = queue_jobs.campaign_id AND campaigns.status = 'paused'\
  ) \
  ORDER BY scheduled_time ASC, id ASC \
  LIMIT $2 \
  FOR UPDATE SKIP LOCKED\
) \
UPDATE queue_jobs SET status = 'sending' \
FROM due WHERE queue_jobs.id = due.id \
RETURNING queue_jobs.*";
const SQL_MARK_JOB_SENT: &str = "UPDATE queue_jobs \
SET status = 'sent', sent_time = $2, error = NULL \
WHERE id = $1 AND status = 'sending'";
const SQL_MARK_JOB_FAILED: &str = "UPDATE queue_jobs \
SET status = 'failed', error = $2 \
WHERE id = $1 AND status = 'sending'";
const SQL_CANCEL_JOB: &str =
    "UPDATE queue_jobs SET status = 'cancelled' WHERE id = $1 AND status = 'pending'";
const SQL_RECORD_OPEN: &str = "UPDATE queue_jobs SET opened_at = $2 \
WHERE id = $1 AND status = 'sent' AND opened_at IS NULL RETURNING *";
const SQL_RECORD_CLICK: &str = "UPDATE queue_jobs SET clicked_at = $2 \
WHERE id = $1 AND status = 'sent' AND clicked_at IS NULL RETURNING *";
const SQL_OPEN_JOBS_FOR_CAMPAIGN: &str = "SELECT COUNT(*) AS count FROM queue_jobs \
WHERE campaign_id = $1 AND status IN ('pending', 'sending')";
const SQL_OVERDUE_PENDING: &str = "SELECT * FROM queue_jobs \
WHERE status = 'pending' AND scheduled_time <= $1 \
ORDER BY scheduled_time ASC, id ASC LIMIT 100";
const SQL_QUEUE_COUNTS: &str =
    "SELECT status, COUNT(*) AS count FROM queue_jobs GROUP BY status";

pub async fn init_schema(client: &Client) -> Result<(), EngineError> {
    client.batch_execute(SCHEMA).await?;
    Ok(())
}

/// Postgres-backed store. All transitions ride on conditional single-row
/// updates; the batch claim relies on `FOR UPDATE SKIP LOCKED`.
pub struct PgStore {
    client: Arc<Mutex<Client>>,
}

impl PgStore {
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
        }
    }
}

fn parse<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, EngineError> {
    value
        .parse()
        .map_err(|_| EngineError::Store(format!("unexpected {what} value: {value}")))
}

fn string_list(value: serde_json::Value) -> Vec<String> {
    serde_json::from_value(value).unwrap_or_default()
}

fn string_map(value: serde_json::Value) -> HashMap<String, String> {
    serde_json::from_value(value).unwrap_or_default()
}

fn contact_from_row(row: &Row) -> Result<Contact, EngineError> {
    let contact_type: String = row.get("contact_type");
    let status: String = row.get("status");
    Ok(Contact {
        id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        company: row.get("company"),
        contact_type: parse::<ContactType>(&contact_type, "contact_type")?,
        status: parse::<ContactStatus>(&status, "contact status")?,
        tags: string_list(row.get("tags")),
        last_contacted: row.get("last_contacted"),
    })
}

fn template_from_row(row: &Row) -> Result<Template, EngineError> {
    let audience: Option<String> = row.get("audience");
    let audience = match audience {
        Some(value) => Some(parse::<ContactType>(&value, "template audience")?),
        None => None,
    };
    Ok(Template {
        id: row.get("id"),
        name: row.get("name"),
        category: row.get("category"),
        audience,
        subject: row.get("subject"),
        content: row.get("content"),
        variables: string_list(row.get("variables")),
        active: row.get("active"),
        usage_count: row.get("usage_count"),
    })
}

fn campaign_from_row(row: &Row) -> Result<Campaign, EngineError> {
    let kind: String = row.get("kind");
    let target_audience: String = row.get("target_audience");
    let status: String = row.get("status");
    Ok(Campaign {
        id: row.get("id"),
        name: row.get("name"),
        kind: parse(&kind, "campaign kind")?,
        target_audience: parse::<Audience>(&target_audience, "target_audience")?,
        status: parse::<CampaignStatus>(&status, "campaign status")?,
        subject: row.get("subject"),
        content: row.get("content"),
        template_id: row.get("template_id"),
        variables: string_map(row.get("variables")),
        scheduled_date: row.get("scheduled_date"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        total_sent: row.get("total_sent"),
        total_opened: row.get("total_opened"),
        total_clicked: row.get("total_clicked"),
        total_converted: row.get("total_converted"),
    })
}

fn job_from_row(row: &Row) -> Result<QueueJob, EngineError> {
    let status: String = row.get("status");
    Ok(QueueJob {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        contact_id: row.get("contact_id"),
        recipient: row.get("recipient"),
        subject: row.get("subject"),
        body: row.get("body"),
        status: parse::<JobStatus>(&status, "job status")?,
        scheduled_time: row.get("scheduled_time"),
        sent_time: row.get("sent_time"),
        error: row.get("error"),
        opened_at: row.get("opened_at"),
        clicked_at: row.get("clicked_at"),
    })
}

#[async_trait]
impl Store for PgStore {
    async fn insert_contact(&self, contact: NewContact) -> Result<Contact, EngineError> {
        let client = self.client.lock().await;
        let tags = serde_json::to_value(&contact.tags)
            .map_err(|err| EngineError::Store(err.to_string()))?;
        let row = client
            .query_one(
                SQL_INSERT_CONTACT,
                &[
                    &contact.email,
                    &contact.name,
                    &contact.company,
                    &contact.contact_type.as_str(),
                    &tags,
                ],
            )
            .await
            .map_err(|err| {
                if let Some(db_err) = err.as_db_error() {
                    if db_err.code() == &SqlState::UNIQUE_VIOLATION {
                        return EngineError::Validation(format!(
                            "contact email already exists: {}",
                            contact.email
                        ));
                    }
                }
                EngineError::from(err)
            })?;
        contact_from_row(&row)
    }

    async fn contact_by_email(&self, email: &str) -> Result<Option<Contact>, EngineError> {
        let client = self.client.lock().await;
        let row = client.query_opt(SQL_CONTACT_BY_EMAIL, &[&email]).await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn set_contact_status(
        &self,
        email: &str,
        status: ContactStatus,
    ) -> Result<bool, EngineError> {
        let client = self.client.lock().await;
        let updated = client
            .execute(SQL_SET_CONTACT_STATUS, &[&email, &status.as_str()])
            .await?;
        Ok(updated == 1)
    }

    async fn touch_contact(&self, id: i64, at: DateTime<Utc>) -> Result<(), EngineError> {
        let client = self.client.lock().await;
        client.execute(SQL_TOUCH_CONTACT, &[&id, &at]).await?;
        Ok(())
    }

    async fn contacts_for_audience(&self, audience: Audience) -> Result<Vec<Contact>, EngineError> {
        let client = self.client.lock().await;
        let rows = match audience {
            Audience::All => client.query(SQL_ACTIVE_CONTACTS, &[]).await?,
            Audience::Only(contact_type) => {
                client
                    .query(SQL_ACTIVE_CONTACTS_BY_TYPE, &[&contact_type.as_str()])
                    .await?
            }
        };
        rows.iter().map(contact_from_row).collect()
    }

    async fn insert_template(&self, template: NewTemplate) -> Result<Template, EngineError> {
        let client = self.client.lock().await;
        let variables = serde_json::to_value(&template.variables)
            .map_err(|err| EngineError::Store(err.to_string()))?;
        let row = client
            .query_one(
                SQL_INSERT_TEMPLATE,
                &[
                    &template.name,
                    &template.category,
                    &template.audience.map(|a| a.as_str()),
                    &template.subject,
                    &template.content,
                    &variables,
                ],
            )
            .await?;
        template_from_row(&row)
    }

    async fn template_by_id(&self, id: i64) -> Result<Option<Template>, EngineError> {
        let client = self.client.lock().await;
        let row = client.query_opt(SQL_TEMPLATE_BY_ID, &[&id]).await?;
        row.as_ref().map(template_from_row).transpose()
    }

    async fn add_template_usage(&self, id: i64, count: i64) -> Result<(), EngineError> {
        let client = self.client.lock().await;
        client
            .execute(SQL_ADD_TEMPLATE_USAGE, &[&id, &count])
            .await?;
        Ok(())
    }

    async fn insert_campaign(&self, campaign: NewCampaign) -> Result<Campaign, EngineError> {
        let client = self.client.lock().await;
        let variables = serde_json::to_value(&campaign.variables)
            .map_err(|err| EngineError::Store(err.to_string()))?;
        let row = client
            .query_one(
                SQL_INSERT_CAMPAIGN,
                &[
                    &campaign.name,
                    &campaign.kind.as_str(),
                    &campaign.target_audience.as_str(),
                    &campaign.subject,
                    &campaign.content,
                    &campaign.template_id,
                    &variables,
                    &campaign.scheduled_date,
                    &campaign.start_date,
                    &campaign.end_date,
                ],
            )
            .await?;
        campaign_from_row(&row)
    }

    async fn campaign_by_id(&self, id: i64) -> Result<Option<Campaign>, EngineError> {
        let client = self.client.lock().await;
        let row = client.query_opt(SQL_CAMPAIGN_BY_ID, &[&id]).await?;
        row.as_ref().map(campaign_from_row).transpose()
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>, EngineError> {
        let client = self.client.lock().await;
        let rows = client.query(SQL_LIST_CAMPAIGNS, &[]).await?;
        rows.iter().map(campaign_from_row).collect()
    }

    async fn set_campaign_status(
        &self,
        id: i64,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool, EngineError> {
        let client = self.client.lock().await;
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let updated = client
            .execute(SQL_SET_CAMPAIGN_STATUS, &[&id, &to.as_str(), &from])
            .await?;
        Ok(updated == 1)
    }

    async fn add_campaign_sent(&self, id: i64, count: i64) -> Result<(), EngineError> {
        let client = self.client.lock().await;
        client.execute(SQL_ADD_CAMPAIGN_SENT, &[&id, &count]).await?;
        Ok(())
    }

    async fn add_campaign_opened(&self, id: i64) -> Result<(), EngineError> {
        let client = self.client.lock().await;
        client.execute(SQL_ADD_CAMPAIGN_OPENED, &[&id]).await?;
        Ok(())
    }

    async fn add_campaign_clicked(&self, id: i64) -> Result<(), EngineError> {
        let client = self.client.lock().await;
        client.execute(SQL_ADD_CAMPAIGN_CLICKED, &[&id]).await?;
        Ok(())
    }

    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<u64, EngineError> {
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        for job in jobs {
            transaction
                .execute(
                    SQL_INSERT_JOB,
                    &[
                        &job.campaign_id,
                        &job.contact_id,
                        &job.recipient,
                        &job.subject,
                        &job.body,
                        &job.scheduled_time,
                    ],
                )
                .await?;
        }
        transaction.commit().await?;
        Ok(jobs.len() as u64)
    }

    async fn job_by_id(&self, id: i64) -> Result<Option<QueueJob>, EngineError> {
        let client = self.client.lock().await;
        let row = client.query_opt(SQL_JOB_BY_ID, &[&id]).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn jobs_for_campaign(&self, id: i64) -> Result<Vec<QueueJob>, EngineError> {
        let client = self.client.lock().await;
        let rows = client.query(SQL_JOBS_FOR_CAMPAIGN, &[&id]).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueueJob>, EngineError> {
        let client = self.client.lock().await;
        let rows = client.query(SQL_CLAIM_DUE_JOBS, &[&now, &limit]).await?;
        let mut jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not guarantee order; restore the due ordering.
        jobs.sort_by_key(|job| (job.scheduled_time, job.id));
        Ok(jobs)
    }

    async fn mark_job_sent(&self, id: i64, at: DateTime<Utc>) -> Result<bool, EngineError> {
        let client = self.client.lock().await;
        let updated = client.execute(SQL_MARK_JOB_SENT, &[&id, &at]).await?;
        Ok(updated == 1)
    }

    async fn mark_job_failed(&self, id: i64, error: &str) -> Result<bool, EngineError> {
        let client = self.client.lock().await;
        let updated = client.execute(SQL_MARK_JOB_FAILED, &[&id, &error]).await?;
        Ok(updated == 1)
    }

    async fn cancel_job(&self, id: i64) -> Result<bool, EngineError> {
        let client = self.client.lock().await;
        let updated = client.execute(SQL_CANCEL_JOB, &[&id]).await?;
        Ok(updated == 1)
    }

    async fn record_open(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, EngineError> {
        let client = self.client.lock().await;
        let row = client.query_opt(SQL_RECORD_OPEN, &[&id, &at]).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn record_click(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, EngineError> {
        let client = self.client.lock().await;
        let row = client.query_opt(SQL_RECORD_CLICK, &[&id, &at]).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn open_jobs_for_campaign(&self, id: i64) -> Result<i64, EngineError> {
        let client = self.client.lock().await;
        let row = client.query_one(SQL_OPEN_JOBS_FOR_CAMPAIGN, &[&id]).await?;
        Ok(row.get("count"))
    }

    async fn overdue_pending(&self, now: DateTime<Utc>) -> Result<Vec<QueueJob>, EngineError> {
        let client = self.client.lock().await;
        let rows = client.query(SQL_OVERDUE_PENDING, &[&now]).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn queue_counts(&self) -> Result<QueueSummary, EngineError> {
        let client = self.client.lock().await;
        let rows = client.query(SQL_QUEUE_COUNTS, &[]).await?;

        let mut summary = QueueSummary::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            let count = count.max(0) as u64;
            match status.as_str() {
                "pending" => summary.pending += count,
                "sending" => summary.sending += count,
                "sent" => summary.sent += count,
                "failed" => summary.failed += count,
                "cancelled" => summary.cancelled += count,
                _ => {}
            }
        }
        Ok(summary)
    }
}
