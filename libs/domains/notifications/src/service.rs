//! Collaborator-facing notification service.
//!
//! Producers (HR, CRM, workflow, ...) only ever touch this type. Enqueue-time
//! errors come back synchronously; everything after acceptance is visible
//! through `latest_status` and `history`.

use crate::config::ChannelPolicies;
use crate::error::{NotificationError, NotificationResult};
use crate::models::{
    EmailContent, EnqueueNotification, Enqueued, MessageContent, NotificationJob,
    NotificationPayload, PushContent, Recipient, ScheduledContent, SmsContent,
};
use crate::tracker::{DeliveryTracker, History, StatusSnapshot};
use chrono::{DateTime, Utc};
use job_queue::{EnqueueRequest, JobId, JobQueue};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Service for enqueueing notifications and reading their delivery status.
#[derive(Clone)]
pub struct NotificationService {
    queue: Arc<dyn JobQueue<NotificationJob>>,
    tracker: Arc<DeliveryTracker>,
    policies: ChannelPolicies,
}

impl NotificationService {
    pub fn new(
        queue: Arc<dyn JobQueue<NotificationJob>>,
        tracker: Arc<DeliveryTracker>,
        policies: ChannelPolicies,
    ) -> Self {
        Self {
            queue,
            tracker,
            policies,
        }
    }

    /// Accept a job for delivery.
    ///
    /// `max_attempts` comes from the channel policy. Scheduled-user jobs are
    /// held until their `deliver_at`.
    pub async fn enqueue(
        &self,
        job: NotificationJob,
        dedupe_key: Option<String>,
    ) -> NotificationResult<Enqueued> {
        let not_before = job.deliver_at();
        self.submit(job, not_before, dedupe_key).await
    }

    /// Accept a job that must not be delivered before `at`.
    pub async fn schedule(
        &self,
        job: NotificationJob,
        at: DateTime<Utc>,
        dedupe_key: Option<String>,
    ) -> NotificationResult<Enqueued> {
        self.submit(job, Some(at), dedupe_key).await
    }

    /// Accept a job in its wire form.
    ///
    /// `dedupe_key` overrides a key carried in the body.
    pub async fn enqueue_json(
        &self,
        value: serde_json::Value,
        dedupe_key: Option<String>,
    ) -> NotificationResult<Enqueued> {
        let request: EnqueueNotification = serde_json::from_value(value)
            .map_err(|e| NotificationError::InvalidJob(e.to_string()))?;
        self.enqueue(request.job, dedupe_key.or(request.dedupe_key)).await
    }

    async fn submit(
        &self,
        job: NotificationJob,
        not_before: Option<DateTime<Utc>>,
        dedupe_key: Option<String>,
    ) -> NotificationResult<Enqueued> {
        let channel = job.channel();
        let policy = self.policies.get(channel);

        let mut request = EnqueueRequest::new(job).with_max_attempts(policy.max_attempts);
        if let Some(at) = not_before {
            request = request.not_before(at);
        }
        if let Some(key) = dedupe_key {
            request = request.with_dedupe_key(key);
        }

        match self.queue.enqueue(request).await {
            Ok(id) => {
                debug!(job_id = %id, channel = %channel, not_before = ?not_before, "Notification enqueued");
                Ok(Enqueued { id, channel })
            }
            Err(e) => {
                let err = NotificationError::from(e);
                warn!(channel = %channel, error = %err, "Notification rejected");
                Err(err)
            }
        }
    }

    /// Message to every member of each team.
    pub async fn notify_team(
        &self,
        team_ids: &[Uuid],
        content: MessageContent,
    ) -> NotificationResult<Enqueued> {
        let job = NotificationJob::new(
            NotificationPayload::Team(content),
            team_ids.iter().copied().map(Recipient::Team).collect(),
        );
        self.enqueue(job, None).await
    }

    /// Direct message to one user.
    pub async fn notify_user(
        &self,
        user_id: Uuid,
        content: MessageContent,
    ) -> NotificationResult<Enqueued> {
        let job = NotificationJob::new(
            NotificationPayload::User(content),
            vec![Recipient::User(user_id)],
        );
        self.enqueue(job, None).await
    }

    /// In-app notification for one or more users.
    pub async fn notify_in_app(
        &self,
        user_ids: &[Uuid],
        content: MessageContent,
    ) -> NotificationResult<Enqueued> {
        let job = NotificationJob::new(
            NotificationPayload::InApp(content),
            user_ids.iter().copied().map(Recipient::User).collect(),
        );
        self.enqueue(job, None).await
    }

    pub async fn send_email(
        &self,
        to: impl Into<String>,
        email: EmailContent,
    ) -> NotificationResult<Enqueued> {
        let job = NotificationJob::new(
            NotificationPayload::Email(email),
            vec![Recipient::Email(to.into())],
        );
        self.enqueue(job, None).await
    }

    pub async fn send_sms(
        &self,
        phone: impl Into<String>,
        body: impl Into<String>,
    ) -> NotificationResult<Enqueued> {
        let job = NotificationJob::new(
            NotificationPayload::Sms(SmsContent { body: body.into() }),
            vec![Recipient::Phone(phone.into())],
        );
        self.enqueue(job, None).await
    }

    pub async fn send_push(
        &self,
        user_id: Uuid,
        push: PushContent,
    ) -> NotificationResult<Enqueued> {
        let job = NotificationJob::new(
            NotificationPayload::Push(push),
            vec![Recipient::User(user_id)],
        );
        self.enqueue(job, None).await
    }

    /// User message held until `deliver_at`.
    pub async fn schedule_user(
        &self,
        user_id: Uuid,
        content: MessageContent,
        deliver_at: DateTime<Utc>,
    ) -> NotificationResult<Enqueued> {
        let job = NotificationJob::new(
            NotificationPayload::ScheduledUser(ScheduledContent {
                content,
                deliver_at,
            }),
            vec![Recipient::User(user_id)],
        );
        self.enqueue(job, None).await
    }

    pub async fn latest_status(&self, job_id: JobId) -> NotificationResult<Option<StatusSnapshot>> {
        self.tracker.latest_status(job_id).await
    }

    pub async fn history(&self, job_id: JobId) -> NotificationResult<History> {
        self.tracker.history(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelPolicy;
    use crate::models::Channel;
    use crate::tracker::MemoryAttemptStore;
    use chrono::TimeDelta;
    use job_queue::{JobStatus, MemoryJobQueue, QueueConfig};
    use serde_json::json;
    use std::time::Duration;

    fn service_with(config: QueueConfig) -> (NotificationService, Arc<MemoryJobQueue<NotificationJob>>) {
        let queue = Arc::new(MemoryJobQueue::new(config));
        let tracker = Arc::new(DeliveryTracker::new(Arc::new(MemoryAttemptStore::new()), queue.clone()));
        let service = NotificationService::new(queue.clone(), tracker, ChannelPolicies::default());
        (service, queue)
    }

    fn service() -> (NotificationService, Arc<MemoryJobQueue<NotificationJob>>) {
        service_with(QueueConfig::new("test"))
    }

    #[tokio::test]
    async fn test_max_attempts_from_channel_policy() {
        let (service, queue) = service();

        let email = service
            .send_email("ap@example.com", EmailContent::new("Invoice", "Due Friday"))
            .await
            .unwrap();
        assert_eq!(email.channel, Channel::Email);
        assert_eq!(queue.get(email.id).await.unwrap().unwrap().max_attempts, 5);

        let user = service
            .notify_user(Uuid::new_v4(), MessageContent::new("Hi", "there"))
            .await
            .unwrap();
        assert_eq!(queue.get(user.id).await.unwrap().unwrap().max_attempts, 3);
    }

    #[tokio::test]
    async fn test_custom_policy_applies() {
        let queue = Arc::new(MemoryJobQueue::new(QueueConfig::new("test")));
        let tracker = Arc::new(DeliveryTracker::new(Arc::new(MemoryAttemptStore::new()), queue.clone()));
        let policies = ChannelPolicies::default().with_policy(
            Channel::Sms,
            ChannelPolicy::new(9, Duration::from_secs(1), Duration::from_secs(2)),
        );
        let service = NotificationService::new(queue.clone(), tracker, policies);

        let sms = service.send_sms("+15550100", "Shipped").await.unwrap();
        assert_eq!(queue.get(sms.id).await.unwrap().unwrap().max_attempts, 9);
    }

    #[tokio::test]
    async fn test_schedule_user_holds_until_deliver_at() {
        let (service, queue) = service();
        let at = Utc::now() + TimeDelta::minutes(10);

        let enqueued = service
            .schedule_user(Uuid::new_v4(), MessageContent::new("Reminder", "Review due"), at)
            .await
            .unwrap();
        let job = queue.get(enqueued.id).await.unwrap().unwrap();
        assert_eq!(job.not_before, Some(at));
        assert!(queue.claim("w", Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_schedule_any_job() {
        let (service, queue) = service();
        let at = Utc::now() + TimeDelta::hours(1);
        let job = NotificationJob::new(
            NotificationPayload::Sms(SmsContent { body: "Shift starts".into() }),
            vec![Recipient::Phone("+15550100".into())],
        );

        let enqueued = service.schedule(job, at, None).await.unwrap();
        assert_eq!(queue.get(enqueued.id).await.unwrap().unwrap().not_before, Some(at));
    }

    #[tokio::test]
    async fn test_enqueue_json() {
        let (service, queue) = service();
        let user = Uuid::new_v4();
        let value = json!({
            "payload": { "channel": "in_app", "title": "Leave approved", "message": "Enjoy" },
            "recipients": [{ "kind": "user", "value": user }],
            "dedupe_key": "leave-42"
        });

        let first = service.enqueue_json(value.clone(), None).await.unwrap();
        assert_eq!(first.channel, Channel::InApp);
        let job = queue.get(first.id).await.unwrap().unwrap();
        assert_eq!(job.dedupe_key.as_deref(), Some("leave-42"));

        let second = service.enqueue_json(value, None).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_enqueue_json_unknown_channel_is_invalid() {
        let (service, _) = service();
        let value = json!({
            "payload": { "channel": "fax", "title": "x", "message": "y" },
            "recipients": [{ "kind": "user", "value": Uuid::new_v4() }]
        });

        let err = service.enqueue_json(value, None).await.unwrap_err();
        assert!(matches!(err, NotificationError::InvalidJob(_)));
    }

    #[tokio::test]
    async fn test_rejections_surface_synchronously() {
        let (service, _) = service_with(QueueConfig::new("test").with_max_depth(1));

        let err = service.notify_in_app(&[], MessageContent::new("Hi", "there")).await.unwrap_err();
        assert!(matches!(err, NotificationError::InvalidJob(_)));

        service
            .notify_team(&[Uuid::new_v4()], MessageContent::new("All hands", "Friday"))
            .await
            .unwrap();
        let err = service
            .send_push(
                Uuid::new_v4(),
                PushContent {
                    title: "Ping".into(),
                    body: "pong".into(),
                    data: json!({}),
                    badge: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::QueueFull(1)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_status_for_pending_job() {
        let (service, _) = service();
        let enqueued = service
            .notify_user(Uuid::new_v4(), MessageContent::new("Hi", "there"))
            .await
            .unwrap();

        let status = service.latest_status(enqueued.id).await.unwrap().unwrap();
        assert_eq!(status.status, Some(JobStatus::Pending));
        assert!(service.history(enqueued.id).await.unwrap().is_empty());
    }
}
