use std::collections::BTreeSet;

use chrono::Utc;
use tokio::time::timeout;

use crate::error::EngineError;
use crate::models::{
    Campaign, CampaignStatus, Contact, ContactStatus, LiveSummary, NewCampaign, NewContact,
    NewJob, NewTemplate, ProcessReport, QueueJob, QueueReport, Template,
};
use crate::state::AppState;
use crate::template;
use crate::transport::OutboundMessage;

pub fn notify_update(state: &AppState) {
    let _ = state.updates.send(());
}

pub async fn create_contact(
    state: &AppState,
    contact: NewContact,
) -> Result<Contact, EngineError> {
    if !contact.email.contains('@') {
        return Err(EngineError::Validation(format!(
            "invalid email: {}",
            contact.email
        )));
    }
    if contact.name.trim().is_empty() {
        return Err(EngineError::Validation("contact name is required".to_string()));
    }
    state.store.insert_contact(contact).await
}

pub async fn unsubscribe_contact(state: &AppState, email: &str) -> Result<(), EngineError> {
    let updated = state
        .store
        .set_contact_status(email, ContactStatus::Unsubscribed)
        .await?;
    if !updated {
        return Err(EngineError::NotFound("contact"));
    }
    tracing::info!(email, "contact unsubscribed");
    Ok(())
}

pub async fn create_template(
    state: &AppState,
    template: NewTemplate,
) -> Result<Template, EngineError> {
    if template.name.trim().is_empty() {
        return Err(EngineError::Validation("template name is required".to_string()));
    }
    if template.subject.trim().is_empty() || template.content.trim().is_empty() {
        return Err(EngineError::Validation(
            "template subject and content are required".to_string(),
        ));
    }
    state.store.insert_template(template).await
}

pub async fn create_campaign(
    state: &AppState,
    campaign: NewCampaign,
) -> Result<Campaign, EngineError> {
    if campaign.name.trim().is_empty() {
        return Err(EngineError::Validation("campaign name is required".to_string()));
    }
    if campaign.template_id.is_none()
        && (campaign.subject.is_none() || campaign.content.is_none())
    {
        return Err(EngineError::Validation(
            "campaign needs a template or inline subject and content".to_string(),
        ));
    }
    state.store.insert_campaign(campaign).await
}

pub async fn list_campaigns(state: &AppState) -> Result<Vec<Campaign>, EngineError> {
    state.store.list_campaigns().await
}

/// Pause a scheduled or running campaign. Its queued jobs stay `pending`
/// and are skipped by the processor until the campaign resumes.
pub async fn pause_campaign(state: &AppState, campaign_id: i64) -> Result<(), EngineError> {
    state
        .store
        .campaign_by_id(campaign_id)
        .await?
        .ok_or(EngineError::NotFound("campaign"))?;

    let paused = state
        .store
        .set_campaign_status(
            campaign_id,
            &[CampaignStatus::Scheduled, CampaignStatus::Running],
            CampaignStatus::Paused,
        )
        .await?;
    if !paused {
        return Err(EngineError::Validation(
            "only scheduled or running campaigns can be paused".to_string(),
        ));
    }
    tracing::info!(campaign = campaign_id, "campaign paused");
    notify_update(state);
    Ok(())
}

pub async fn resume_campaign(state: &AppState, campaign_id: i64) -> Result<(), EngineError> {
    state
        .store
        .campaign_by_id(campaign_id)
        .await?
        .ok_or(EngineError::NotFound("campaign"))?;

    let resumed = state
        .store
        .set_campaign_status(
            campaign_id,
            &[CampaignStatus::Paused],
            CampaignStatus::Scheduled,
        )
        .await?;
    if !resumed {
        return Err(EngineError::Validation("campaign is not paused".to_string()));
    }
    tracing::info!(campaign = campaign_id, "campaign resumed");
    notify_update(state);
    Ok(())
}

/// Expand a campaign into per-recipient queue jobs: resolve the audience,
/// render subject and body for each contact, enqueue everything at the
/// campaign's scheduled date (or now). Zero eligible contacts is not an
/// error.
pub async fn queue_campaign(state: &AppState, campaign_id: i64) -> Result<QueueReport, EngineError> {
    let campaign = state
        .store
        .campaign_by_id(campaign_id)
        .await?
        .ok_or(EngineError::NotFound("campaign"))?;

    if campaign.status == CampaignStatus::Completed {
        return Err(EngineError::Validation(
            "campaign is already completed".to_string(),
        ));
    }

    let (subject, content, template_id) = match campaign.template_id {
        Some(template_id) => {
            let template = state
                .store
                .template_by_id(template_id)
                .await?
                .ok_or(EngineError::NotFound("template"))?;
            if !template.active {
                return Err(EngineError::Validation(format!(
                    "template {template_id} is inactive"
                )));
            }
            (template.subject, template.content, Some(template_id))
        }
        None => match (campaign.subject.clone(), campaign.content.clone()) {
            (Some(subject), Some(content)) => (subject, content, None),
            _ => {
                return Err(EngineError::Validation(
                    "campaign has neither a template nor inline subject and content".to_string(),
                ))
            }
        },
    };

    let contacts = state
        .store
        .contacts_for_audience(campaign.target_audience)
        .await?;
    let scheduled_time = campaign.scheduled_date.unwrap_or_else(Utc::now);

    let jobs: Vec<NewJob> = contacts
        .iter()
        .map(|contact| {
            let vars = template::contact_vars(contact, &campaign.variables);
            NewJob {
                campaign_id: Some(campaign.id),
                contact_id: contact.id,
                recipient: contact.email.clone(),
                subject: template::render(&subject, &vars),
                body: template::render(&content, &vars),
                scheduled_time,
            }
        })
        .collect();

    let queued = state.store.insert_jobs(&jobs).await?;
    if queued > 0 {
        if let Some(template_id) = template_id {
            state
                .store
                .add_template_usage(template_id, queued as i64)
                .await?;
        }
        state
            .store
            .set_campaign_status(campaign.id, &[CampaignStatus::Draft], CampaignStatus::Scheduled)
            .await?;
        notify_update(state);
    }

    tracing::info!(campaign = campaign.id, queued, "campaign queued");
    Ok(QueueReport {
        campaign_id: campaign.id,
        queued,
    })
}

/// One processor pass: claim due jobs, deliver them sequentially with a
/// rate-limit pause between sends, record each outcome. Transport failures
/// stay on their job; store failures abort the batch.
pub async fn process_queue(state: &AppState) -> Result<ProcessReport, EngineError> {
    let claimed = state
        .store
        .claim_due_jobs(Utc::now(), state.batch_size)
        .await?;

    let mut report = ProcessReport::default();
    let mut touched: BTreeSet<i64> = BTreeSet::new();

    for (index, job) in claimed.iter().enumerate() {
        if index > 0 && !state.send_delay.is_zero() {
            tokio::time::sleep(state.send_delay).await;
        }
        report.processed += 1;

        let message = OutboundMessage {
            to: job.recipient.clone(),
            subject: job.subject.clone(),
            body: job.body.clone(),
        };

        let outcome = match timeout(state.send_timeout, state.transport.deliver(&message)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Transport(format!(
                "delivery timed out after {}ms",
                state.send_timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(receipt) => {
                let now = Utc::now();
                state.store.mark_job_sent(job.id, now).await?;
                state.store.touch_contact(job.contact_id, now).await?;
                if let Some(campaign_id) = job.campaign_id {
                    state.store.add_campaign_sent(campaign_id, 1).await?;
                    state
                        .store
                        .set_campaign_status(
                            campaign_id,
                            &[CampaignStatus::Scheduled],
                            CampaignStatus::Running,
                        )
                        .await?;
                    touched.insert(campaign_id);
                }
                report.sent += 1;
                tracing::info!(job = job.id, message_id = %receipt.message_id, "job delivered");
            }
            Err(err) => {
                let detail = err.to_string();
                state.store.mark_job_failed(job.id, &detail).await?;
                if let Some(campaign_id) = job.campaign_id {
                    touched.insert(campaign_id);
                }
                report.failed += 1;
                tracing::warn!(job = job.id, error = %detail, "job delivery failed");
            }
        }
    }

    // A campaign with nothing left in flight is done.
    for campaign_id in touched {
        if state.store.open_jobs_for_campaign(campaign_id).await? == 0 {
            state
                .store
                .set_campaign_status(
                    campaign_id,
                    &[CampaignStatus::Running, CampaignStatus::Scheduled],
                    CampaignStatus::Completed,
                )
                .await?;
        }
    }

    if report.processed > 0 {
        notify_update(state);
    }
    Ok(report)
}

/// First-open-wins: the timestamp is stamped at most once, and the campaign
/// counter moves only on that first stamp. Unknown job ids are a no-op.
pub async fn track_open(state: &AppState, job_id: i64) -> Result<bool, EngineError> {
    match state.store.record_open(job_id, Utc::now()).await? {
        Some(job) => {
            if let Some(campaign_id) = job.campaign_id {
                state.store.add_campaign_opened(campaign_id).await?;
            }
            notify_update(state);
            Ok(true)
        }
        None => {
            tracing::debug!(job = job_id, "open event ignored");
            Ok(false)
        }
    }
}

pub async fn track_click(state: &AppState, job_id: i64) -> Result<bool, EngineError> {
    match state.store.record_click(job_id, Utc::now()).await? {
        Some(job) => {
            if let Some(campaign_id) = job.campaign_id {
                state.store.add_campaign_clicked(campaign_id).await?;
            }
            notify_update(state);
            Ok(true)
        }
        None => {
            tracing::debug!(job = job_id, "click event ignored");
            Ok(false)
        }
    }
}

pub async fn cancel_job(state: &AppState, job_id: i64) -> Result<(), EngineError> {
    let job = state
        .store
        .job_by_id(job_id)
        .await?
        .ok_or(EngineError::NotFound("job"))?;

    if !state.store.cancel_job(job.id).await? {
        return Err(EngineError::Validation(format!(
            "job {} is {} and can no longer be cancelled",
            job.id,
            job.status.as_str()
        )));
    }
    notify_update(state);
    Ok(())
}

pub async fn jobs_for_campaign(
    state: &AppState,
    campaign_id: i64,
) -> Result<Vec<QueueJob>, EngineError> {
    state
        .store
        .campaign_by_id(campaign_id)
        .await?
        .ok_or(EngineError::NotFound("campaign"))?;
    state.store.jobs_for_campaign(campaign_id).await
}

/// Pending jobs past their scheduled time: if this list grows while nothing
/// errors, the processor is not running.
pub async fn overdue_jobs(state: &AppState) -> Result<Vec<QueueJob>, EngineError> {
    state.store.overdue_pending(Utc::now()).await
}

pub async fn build_live_summary(state: &AppState) -> Result<LiveSummary, EngineError> {
    Ok(LiveSummary {
        updated_at: Utc::now().to_rfc3339(),
        queue: state.store.queue_counts().await?,
        campaigns: state.store.list_campaigns().await?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::broadcast;

    use super::*;
    use crate::models::{Audience, ContactType, JobStatus};
    use crate::store::MemStore;
    use crate::transport::mock::MockTransport;
    use crate::transport::Transport;

    fn state_with(transport: Arc<dyn Transport>) -> AppState {
        let (updates, _) = broadcast::channel(8);
        AppState {
            store: Arc::new(MemStore::new()),
            transport,
            updates,
            stream_interval: Duration::from_secs(5),
            batch_size: 50,
            send_delay: Duration::ZERO,
            send_timeout: Duration::from_secs(5),
        }
    }

    async fn seed_contact(
        state: &AppState,
        email: &str,
        name: &str,
        company: Option<&str>,
        contact_type: ContactType,
        status: ContactStatus,
    ) -> Contact {
        let contact = state
            .store
            .insert_contact(NewContact {
                email: email.to_string(),
                name: name.to_string(),
                company: company.map(|c| c.to_string()),
                contact_type,
                tags: Vec::new(),
            })
            .await
            .unwrap();
        if status != ContactStatus::Active {
            state
                .store
                .set_contact_status(email, status)
                .await
                .unwrap();
        }
        contact
    }

    async fn seed_campaign(
        state: &AppState,
        audience: Audience,
        subject: &str,
        content: &str,
        variables: HashMap<String, String>,
    ) -> Campaign {
        create_campaign(
            state,
            NewCampaign {
                name: "launch".to_string(),
                kind: Default::default(),
                target_audience: audience,
                subject: Some(subject.to_string()),
                content: Some(content.to_string()),
                template_id: None,
                variables,
                scheduled_date: None,
                start_date: None,
                end_date: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn queueing_all_targets_every_active_contact() {
        let state = state_with(Arc::new(MockTransport::new()));
        seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        seed_contact(&state, "b@x.com", "Bo", None, ContactType::Team, ContactStatus::Active).await;
        seed_contact(&state, "c@x.com", "Cy", None, ContactType::Partner, ContactStatus::Unsubscribed).await;
        seed_contact(&state, "d@x.com", "Di", None, ContactType::Sponsor, ContactStatus::Bounced).await;

        let campaign = seed_campaign(&state, Audience::All, "Hi", "Hello", HashMap::new()).await;
        let report = queue_campaign(&state, campaign.id).await.unwrap();
        assert_eq!(report.queued, 2);

        let jobs = state.store.jobs_for_campaign(campaign.id).await.unwrap();
        let recipients: Vec<&str> = jobs.iter().map(|j| j.recipient.as_str()).collect();
        assert!(recipients.contains(&"a@x.com"));
        assert!(recipients.contains(&"b@x.com"));
        assert!(!recipients.contains(&"c@x.com"));
        assert!(!recipients.contains(&"d@x.com"));
    }

    #[tokio::test]
    async fn queueing_renders_subject_and_body_per_contact() {
        let state = state_with(Arc::new(MockTransport::new()));
        seed_contact(&state, "a@x.com", "Ana", Some("Acme"), ContactType::Customer, ContactStatus::Active).await;
        seed_contact(&state, "b@x.com", "Bo", None, ContactType::Team, ContactStatus::Active).await;

        let campaign = seed_campaign(
            &state,
            Audience::Only(ContactType::Customer),
            "Hi {{name}}",
            "Welcome {{company}}",
            HashMap::new(),
        )
        .await;
        let report = queue_campaign(&state, campaign.id).await.unwrap();
        assert_eq!(report.queued, 1);

        let jobs = state.store.jobs_for_campaign(campaign.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].subject, "Hi Ana");
        assert_eq!(jobs[0].body, "Welcome Acme");
        assert_eq!(jobs[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn campaign_variables_override_contact_defaults() {
        let state = state_with(Arc::new(MockTransport::new()));
        seed_contact(&state, "a@x.com", "Ana", Some("Acme"), ContactType::Customer, ContactStatus::Active).await;

        let mut variables = HashMap::new();
        variables.insert("name".to_string(), "friend".to_string());
        let campaign = seed_campaign(
            &state,
            Audience::All,
            "Hi {{name}}",
            "From {{company}}",
            variables,
        )
        .await;
        queue_campaign(&state, campaign.id).await.unwrap();

        let jobs = state.store.jobs_for_campaign(campaign.id).await.unwrap();
        assert_eq!(jobs[0].subject, "Hi friend");
        assert_eq!(jobs[0].body, "From Acme");
    }

    #[tokio::test]
    async fn queueing_unknown_campaign_is_not_found() {
        let state = state_with(Arc::new(MockTransport::new()));
        assert!(matches!(
            queue_campaign(&state, 99).await,
            Err(EngineError::NotFound("campaign"))
        ));
    }

    #[tokio::test]
    async fn empty_audience_queues_zero_jobs_without_error() {
        let state = state_with(Arc::new(MockTransport::new()));
        seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;

        let campaign = seed_campaign(
            &state,
            Audience::Only(ContactType::Sponsor),
            "Hi",
            "Hello",
            HashMap::new(),
        )
        .await;
        let report = queue_campaign(&state, campaign.id).await.unwrap();
        assert_eq!(report.queued, 0);
        // No jobs queued, so the campaign stays a draft.
        let campaign = state.store.campaign_by_id(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Draft);
    }

    #[tokio::test]
    async fn campaign_without_content_is_rejected_before_any_job_exists() {
        let state = state_with(Arc::new(MockTransport::new()));
        let result = create_campaign(
            &state,
            NewCampaign {
                name: "bare".to_string(),
                kind: Default::default(),
                target_audience: Audience::All,
                subject: None,
                content: None,
                template_id: None,
                variables: HashMap::new(),
                scheduled_date: None,
                start_date: None,
                end_date: None,
            },
        )
        .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn template_campaign_renders_and_counts_usage() {
        let state = state_with(Arc::new(MockTransport::new()));
        seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        seed_contact(&state, "b@x.com", "Bo", None, ContactType::Customer, ContactStatus::Active).await;

        let template = create_template(
            &state,
            NewTemplate {
                name: "welcome".to_string(),
                category: None,
                audience: Some(ContactType::Customer),
                subject: "Hello {{name}}".to_string(),
                content: "Glad you are here, {{name}}.".to_string(),
                variables: vec!["name".to_string()],
            },
        )
        .await
        .unwrap();

        let campaign = create_campaign(
            &state,
            NewCampaign {
                name: "onboarding".to_string(),
                kind: Default::default(),
                target_audience: Audience::Only(ContactType::Customer),
                subject: None,
                content: None,
                template_id: Some(template.id),
                variables: HashMap::new(),
                scheduled_date: None,
                start_date: None,
                end_date: None,
            },
        )
        .await
        .unwrap();

        let report = queue_campaign(&state, campaign.id).await.unwrap();
        assert_eq!(report.queued, 2);

        let template = state.store.template_by_id(template.id).await.unwrap().unwrap();
        assert_eq!(template.usage_count, 2);
        let campaign = state.store.campaign_by_id(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Scheduled);

        let jobs = state.store.jobs_for_campaign(campaign.id).await.unwrap();
        assert!(jobs.iter().any(|j| j.subject == "Hello Ana"));
        assert!(jobs.iter().any(|j| j.subject == "Hello Bo"));
    }

    #[tokio::test]
    async fn processing_reports_sent_and_failed_and_counts_only_successes() {
        let state = state_with(Arc::new(MockTransport::rejecting(&["b@x.com"])));
        seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        seed_contact(&state, "b@x.com", "Bo", None, ContactType::Customer, ContactStatus::Active).await;
        seed_contact(&state, "c@x.com", "Cy", None, ContactType::Customer, ContactStatus::Active).await;

        let campaign = seed_campaign(&state, Audience::All, "Hi", "Hello", HashMap::new()).await;
        queue_campaign(&state, campaign.id).await.unwrap();

        let report = process_queue(&state).await.unwrap();
        assert_eq!(
            report,
            ProcessReport {
                processed: 3,
                sent: 2,
                failed: 1
            }
        );

        let jobs = state.store.jobs_for_campaign(campaign.id).await.unwrap();
        let failed = jobs.iter().find(|j| j.recipient == "b@x.com").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.as_deref().is_some_and(|e| !e.is_empty()));
        assert!(jobs
            .iter()
            .filter(|j| j.recipient != "b@x.com")
            .all(|j| j.status == JobStatus::Sent && j.sent_time.is_some()));

        let campaign = state.store.campaign_by_id(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.total_sent, 2);
        // Everything left the queue, so the campaign completed.
        assert_eq!(campaign.status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn campaign_completes_even_when_every_delivery_fails() {
        let state = state_with(Arc::new(MockTransport::rejecting(&["a@x.com"])));
        seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        let campaign = seed_campaign(&state, Audience::All, "Hi", "Hello", HashMap::new()).await;
        queue_campaign(&state, campaign.id).await.unwrap();

        let report = process_queue(&state).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, 0);

        let campaign = state.store.campaign_by_id(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(campaign.total_sent, 0);
    }

    #[tokio::test]
    async fn paused_campaign_holds_delivery_until_resumed() {
        let transport = Arc::new(MockTransport::new());
        let state = state_with(transport.clone());
        seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        let campaign = seed_campaign(&state, Audience::All, "Hi", "Hello", HashMap::new()).await;
        queue_campaign(&state, campaign.id).await.unwrap();

        pause_campaign(&state, campaign.id).await.unwrap();
        let report = process_queue(&state).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(transport.sent_count().await, 0);

        resume_campaign(&state, campaign.id).await.unwrap();
        let report = process_queue(&state).await.unwrap();
        assert_eq!(report.sent, 1);
    }

    #[tokio::test]
    async fn pause_and_resume_guard_their_source_states() {
        let state = state_with(Arc::new(MockTransport::new()));
        let draft = seed_campaign(&state, Audience::All, "Hi", "Hello", HashMap::new()).await;

        // Drafts have nothing queued to hold back.
        assert!(matches!(
            pause_campaign(&state, draft.id).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            resume_campaign(&state, draft.id).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            pause_campaign(&state, 999).await,
            Err(EngineError::NotFound("campaign"))
        ));
    }

    #[tokio::test]
    async fn second_pass_never_redelivers() {
        let transport = Arc::new(MockTransport::new());
        let state = state_with(transport.clone());
        seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        let campaign = seed_campaign(&state, Audience::All, "Hi", "Hello", HashMap::new()).await;
        queue_campaign(&state, campaign.id).await.unwrap();

        let first = process_queue(&state).await.unwrap();
        assert_eq!(first.sent, 1);
        let second = process_queue(&state).await.unwrap();
        assert_eq!(second, ProcessReport::default());
        assert_eq!(transport.sent_count().await, 1);
    }

    #[tokio::test]
    async fn future_jobs_are_not_claimed() {
        let state = state_with(Arc::new(MockTransport::new()));
        seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        let campaign = create_campaign(
            &state,
            NewCampaign {
                name: "later".to_string(),
                kind: Default::default(),
                target_audience: Audience::All,
                subject: Some("Hi".to_string()),
                content: Some("Hello".to_string()),
                template_id: None,
                variables: HashMap::new(),
                scheduled_date: Some(Utc::now() + chrono::Duration::hours(1)),
                start_date: None,
                end_date: None,
            },
        )
        .await
        .unwrap();
        queue_campaign(&state, campaign.id).await.unwrap();

        let report = process_queue(&state).await.unwrap();
        assert_eq!(report.processed, 0);
        assert!(overdue_jobs(&state).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn earliest_due_jobs_go_first() {
        let transport = Arc::new(MockTransport::new());
        let state = state_with(transport.clone());
        let first = seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        let second = seed_contact(&state, "b@x.com", "Bo", None, ContactType::Customer, ContactStatus::Active).await;

        // Enqueue directly with staggered times, latest first.
        state
            .store
            .insert_jobs(&[
                NewJob {
                    campaign_id: None,
                    contact_id: second.id,
                    recipient: second.email.clone(),
                    subject: "second".to_string(),
                    body: "b".to_string(),
                    scheduled_time: Utc::now() - chrono::Duration::minutes(1),
                },
                NewJob {
                    campaign_id: None,
                    contact_id: first.id,
                    recipient: first.email.clone(),
                    subject: "first".to_string(),
                    body: "a".to_string(),
                    scheduled_time: Utc::now() - chrono::Duration::minutes(10),
                },
            ])
            .await
            .unwrap();

        process_queue(&state).await.unwrap();
        let sent = transport.sent.lock().await;
        assert_eq!(sent[0].subject, "first");
        assert_eq!(sent[1].subject, "second");
    }

    #[tokio::test]
    async fn open_tracking_is_first_wins_and_idempotent() {
        let state = state_with(Arc::new(MockTransport::new()));
        seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        let campaign = seed_campaign(&state, Audience::All, "Hi", "Hello", HashMap::new()).await;
        queue_campaign(&state, campaign.id).await.unwrap();

        let jobs = state.store.jobs_for_campaign(campaign.id).await.unwrap();
        let job_id = jobs[0].id;

        // Not sent yet: open events are ignored.
        assert!(!track_open(&state, job_id).await.unwrap());

        process_queue(&state).await.unwrap();

        assert!(track_open(&state, job_id).await.unwrap());
        assert!(!track_open(&state, job_id).await.unwrap());

        let job = state.store.job_by_id(job_id).await.unwrap().unwrap();
        let opened_at = job.opened_at.unwrap();
        let campaign = state.store.campaign_by_id(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.total_opened, 1);

        // The stamp does not move on repeat calls.
        assert!(!track_open(&state, job_id).await.unwrap());
        let job = state.store.job_by_id(job_id).await.unwrap().unwrap();
        assert_eq!(job.opened_at.unwrap(), opened_at);
    }

    #[tokio::test]
    async fn click_tracking_counts_once() {
        let state = state_with(Arc::new(MockTransport::new()));
        seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        let campaign = seed_campaign(&state, Audience::All, "Hi", "Hello", HashMap::new()).await;
        queue_campaign(&state, campaign.id).await.unwrap();
        process_queue(&state).await.unwrap();

        let jobs = state.store.jobs_for_campaign(campaign.id).await.unwrap();
        assert!(track_click(&state, jobs[0].id).await.unwrap());
        assert!(!track_click(&state, jobs[0].id).await.unwrap());

        let campaign = state.store.campaign_by_id(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.total_clicked, 1);
    }

    #[tokio::test]
    async fn tracking_unknown_job_is_a_noop() {
        let state = state_with(Arc::new(MockTransport::new()));
        assert!(!track_open(&state, 404).await.unwrap());
        assert!(!track_click(&state, 404).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_applies_only_to_pending_jobs() {
        let state = state_with(Arc::new(MockTransport::new()));
        seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        seed_contact(&state, "b@x.com", "Bo", None, ContactType::Customer, ContactStatus::Active).await;
        let campaign = seed_campaign(&state, Audience::All, "Hi", "Hello", HashMap::new()).await;
        queue_campaign(&state, campaign.id).await.unwrap();

        let jobs = state.store.jobs_for_campaign(campaign.id).await.unwrap();
        cancel_job(&state, jobs[0].id).await.unwrap();

        let report = process_queue(&state).await.unwrap();
        assert_eq!(report.processed, 1);

        // Sent and cancelled jobs both refuse further cancellation.
        assert!(matches!(
            cancel_job(&state, jobs[1].id).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            cancel_job(&state, 999).await,
            Err(EngineError::NotFound("job"))
        ));
    }

    #[tokio::test]
    async fn overdue_pending_jobs_are_observable() {
        let state = state_with(Arc::new(MockTransport::new()));
        let contact = seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        state
            .store
            .insert_jobs(&[NewJob {
                campaign_id: None,
                contact_id: contact.id,
                recipient: contact.email.clone(),
                subject: "s".to_string(),
                body: "b".to_string(),
                scheduled_time: Utc::now() - chrono::Duration::minutes(5),
            }])
            .await
            .unwrap();

        let overdue = overdue_jobs(&state).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn delivery_stamps_last_contacted() {
        let state = state_with(Arc::new(MockTransport::new()));
        seed_contact(&state, "a@x.com", "Ana", None, ContactType::Customer, ContactStatus::Active).await;
        let campaign = seed_campaign(&state, Audience::All, "Hi", "Hello", HashMap::new()).await;
        queue_campaign(&state, campaign.id).await.unwrap();
        process_queue(&state).await.unwrap();

        let contact = state.store.contact_by_email("a@x.com").await.unwrap().unwrap();
        assert!(contact.last_contacted.is_some());
    }
}
