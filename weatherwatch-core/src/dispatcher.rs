//! One evaluate-and-notify pass over every subscription.
//!
//! Each subscription is handled in isolation: a failed weather fetch, a
//! condition that no longer parses, or a rejected email only skips that
//! subscription. Listing the subscriptions is the one failure that aborts a
//! run.
//!
//! Delivery is a two-step side effect. The email goes out first, then the
//! notification record is written on a best-effort basis. A failed send
//! writes no record, so the alert is attempted again on the next run. A
//! failed record write after a successful send is logged and counted but not
//! retried, so delivery is at-least-once and the history may miss entries.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ProviderError, RunError},
    mailer::{Email, Mailer},
    model::{NewNotification, NotificationRecord, Subscription},
    provider::WeatherProvider,
    store::SubscriptionStore,
};

/// What to do when a condition is still true on the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResendPolicy {
    /// Send on every run the condition holds.
    #[default]
    EveryRun,
    /// Send once, then hold further alerts until the condition is observed
    /// false again.
    OncePerActivation,
}

/// Where processing of a subscription stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Evaluate,
    Send,
    /// Writing the notification record after a successful send. A failure
    /// here surfaces as [`Outcome::DeliveredUnrecorded`], not as a skip.
    Record,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Fetch => "fetch",
            Stage::Evaluate => "evaluate",
            Stage::Send => "send",
            Stage::Record => "record",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    NotMet,
    Suppressed,
    Delivered(NotificationRecord),
    /// The email went out but the notification record could not be written.
    DeliveredUnrecorded,
    Skipped(Stage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub subscriptions: usize,
    pub met: usize,
    pub sent: usize,
    pub recorded: usize,
    pub unrecorded: usize,
    pub suppressed: usize,
    pub skipped_fetch: usize,
    pub skipped_evaluate: usize,
    pub skipped_send: usize,
}

impl RunReport {
    fn tally(&mut self, outcome: &Outcome) {
        self.subscriptions += 1;
        match outcome {
            Outcome::NotMet => {}
            Outcome::Suppressed => {
                self.met += 1;
                self.suppressed += 1;
            }
            Outcome::Delivered(_) => {
                self.met += 1;
                self.sent += 1;
                self.recorded += 1;
            }
            Outcome::DeliveredUnrecorded => {
                self.met += 1;
                self.sent += 1;
                self.unrecorded += 1;
            }
            Outcome::Skipped(Stage::Fetch) => self.skipped_fetch += 1,
            Outcome::Skipped(Stage::Evaluate) => self.skipped_evaluate += 1,
            Outcome::Skipped(Stage::Send) => {
                self.met += 1;
                self.skipped_send += 1;
            }
            Outcome::Skipped(Stage::Record) => {
                self.met += 1;
                self.sent += 1;
                self.unrecorded += 1;
            }
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped_fetch + self.skipped_evaluate + self.skipped_send
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn WeatherProvider>,
    mailer: Arc<dyn Mailer>,
    policy: ResendPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn WeatherProvider>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            store,
            provider,
            mailer,
            policy: ResendPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ResendPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ResendPolicy {
        self.policy
    }

    /// Evaluate every subscription once and send alerts for those whose
    /// condition holds.
    pub async fn run_once(&self) -> Result<RunReport, RunError> {
        let subscriptions = self
            .store
            .list_subscriptions()
            .await
            .map_err(RunError::ListSubscriptions)?;

        info!(count = subscriptions.len(), policy = ?self.policy, "notification run started");

        let mut report = RunReport::default();
        for subscription in &subscriptions {
            let outcome = self.process(subscription).await;
            report.tally(&outcome);
        }

        info!(
            subscriptions = report.subscriptions,
            met = report.met,
            sent = report.sent,
            recorded = report.recorded,
            unrecorded = report.unrecorded,
            suppressed = report.suppressed,
            skipped = report.skipped(),
            "notification run finished"
        );
        Ok(report)
    }

    /// Handle a single subscription. Never fails; problems are logged and
    /// reported through the returned outcome.
    pub async fn process(&self, sub: &Subscription) -> Outcome {
        let condition = match sub.parsed_condition() {
            Ok(condition) => condition,
            Err(e) => {
                warn!(subscription_id = sub.id, city = %sub.city, stage = %Stage::Evaluate, error = %e, "skipping subscription");
                return Outcome::Skipped(Stage::Evaluate);
            }
        };

        let snapshot = match self.provider.current(&sub.city).await {
            Ok(snapshot) => snapshot,
            Err(e @ ProviderError::CityNotFound(_)) => {
                warn!(subscription_id = sub.id, city = %sub.city, stage = %Stage::Fetch, error = %e, "skipping subscription");
                return Outcome::Skipped(Stage::Fetch);
            }
            Err(e) => {
                error!(subscription_id = sub.id, city = %sub.city, stage = %Stage::Fetch, error = %e, "skipping subscription");
                return Outcome::Skipped(Stage::Fetch);
            }
        };

        let suppressed = self.is_suppressed(sub).await;

        if !condition.evaluate(&snapshot) {
            debug!(subscription_id = sub.id, city = %sub.city, condition = %condition, "condition not met");
            if suppressed {
                self.set_suppressed(sub, false).await;
            }
            return Outcome::NotMet;
        }

        info!(subscription_id = sub.id, city = %sub.city, condition = %condition, "condition met");

        if suppressed {
            debug!(subscription_id = sub.id, "already notified for this activation");
            return Outcome::Suppressed;
        }

        let email = Email::condition_met(&sub.owner_email, &sub.condition, &sub.city);
        if let Err(e) = self.mailer.send(&email).await {
            error!(subscription_id = sub.id, city = %sub.city, stage = %Stage::Send, to = %sub.owner_email, error = %e, "failed to send notification");
            return Outcome::Skipped(Stage::Send);
        }
        info!(subscription_id = sub.id, to = %sub.owner_email, "notification sent");

        if self.policy == ResendPolicy::OncePerActivation {
            self.set_suppressed(sub, true).await;
        }

        let notification = NewNotification {
            subscription_id: sub.id,
            owner_id: sub.owner_id,
            sent_at: Utc::now(),
        };
        match self.store.record_notification(&notification).await {
            Ok(record) => Outcome::Delivered(record),
            Err(e) => {
                error!(
                    subscription_id = sub.id,
                    owner_id = sub.owner_id,
                    city = %sub.city,
                    stage = %Stage::Record,
                    error = %e,
                    "notification sent but not recorded"
                );
                Outcome::DeliveredUnrecorded
            }
        }
    }

    async fn is_suppressed(&self, sub: &Subscription) -> bool {
        if self.policy != ResendPolicy::OncePerActivation {
            return false;
        }
        match self.store.is_suppressed(sub.id).await {
            Ok(suppressed) => suppressed,
            Err(e) => {
                // Unknown state counts as not suppressed.
                warn!(subscription_id = sub.id, error = %e, "failed to read suppression state");
                false
            }
        }
    }

    async fn set_suppressed(&self, sub: &Subscription, suppressed: bool) {
        if let Err(e) = self.store.set_suppressed(sub.id, suppressed).await {
            warn!(subscription_id = sub.id, suppressed, error = %e, "failed to update suppression state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{MailError, StoreError},
        model::WeatherSnapshot,
    };
    use async_trait::async_trait;
    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
    };

    #[derive(Debug, Default)]
    struct FakeStore {
        subscriptions: Vec<Subscription>,
        fail_list: bool,
        fail_record: bool,
        recorded: Mutex<Vec<NewNotification>>,
        suppressed: Mutex<HashSet<i64>>,
    }

    #[async_trait]
    impl SubscriptionStore for FakeStore {
        async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
            if self.fail_list {
                return Err(StoreError::database(std::io::Error::other("connection lost")));
            }
            Ok(self.subscriptions.clone())
        }

        async fn record_notification(
            &self,
            notification: &NewNotification,
        ) -> Result<NotificationRecord, StoreError> {
            if self.fail_record {
                return Err(StoreError::database(std::io::Error::other("disk full")));
            }
            let mut recorded = self.recorded.lock().unwrap();
            recorded.push(notification.clone());
            Ok(NotificationRecord {
                id: recorded.len() as i64,
                subscription_id: notification.subscription_id,
                owner_id: notification.owner_id,
                sent_at: notification.sent_at,
            })
        }

        async fn is_suppressed(&self, subscription_id: i64) -> Result<bool, StoreError> {
            Ok(self.suppressed.lock().unwrap().contains(&subscription_id))
        }

        async fn set_suppressed(
            &self,
            subscription_id: i64,
            suppressed: bool,
        ) -> Result<(), StoreError> {
            let mut set = self.suppressed.lock().unwrap();
            if suppressed {
                set.insert(subscription_id);
            } else {
                set.remove(&subscription_id);
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone)]
    enum Reply {
        Weather(WeatherSnapshot),
        NotFound,
        Down,
    }

    #[derive(Debug, Default)]
    struct FakeProvider {
        cities: Mutex<HashMap<String, Reply>>,
    }

    impl FakeProvider {
        fn with(self, city: &str, reply: Reply) -> Self {
            self.set(city, reply);
            self
        }

        fn set(&self, city: &str, reply: Reply) {
            self.cities.lock().unwrap().insert(city.to_string(), reply);
        }
    }

    #[async_trait]
    impl WeatherProvider for FakeProvider {
        async fn current(&self, city: &str) -> Result<WeatherSnapshot, ProviderError> {
            let reply = self.cities.lock().unwrap().get(city).cloned();
            match reply {
                Some(Reply::Weather(s)) => Ok(s),
                Some(Reply::NotFound) | None => Err(ProviderError::CityNotFound(city.to_string())),
                Some(Reply::Down) => Err(ProviderError::Status {
                    provider: "fake",
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    body: "down".into(),
                }),
            }
        }
    }

    #[derive(Debug, Default)]
    struct FakeMailer {
        sent: Mutex<Vec<Email>>,
        reject: HashSet<String>,
    }

    #[async_trait]
    impl Mailer for FakeMailer {
        async fn send(&self, email: &Email) -> Result<(), MailError> {
            if self.reject.contains(&email.to) {
                return Err(MailError::Rejected {
                    to: email.to.clone(),
                    status: reqwest::StatusCode::UNPROCESSABLE_ENTITY,
                    body: "rejected".into(),
                });
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    fn weather(temperature_c: f64, main: &str) -> Reply {
        Reply::Weather(WeatherSnapshot {
            city: "any".into(),
            temperature_c,
            feels_like_c: temperature_c,
            humidity_pct: 50,
            main: main.into(),
            description: main.to_lowercase(),
            observed_at: Utc::now(),
        })
    }

    fn sub(id: i64, email: &str, city: &str, condition: &str) -> Subscription {
        Subscription {
            id,
            owner_id: id * 10,
            owner_email: email.into(),
            city: city.into(),
            condition: condition.into(),
        }
    }

    fn dispatcher(
        store: &Arc<FakeStore>,
        provider: &Arc<FakeProvider>,
        mailer: &Arc<FakeMailer>,
    ) -> Dispatcher {
        Dispatcher::new(store.clone(), provider.clone(), mailer.clone())
    }

    #[tokio::test]
    async fn one_failing_fetch_does_not_stop_the_run() {
        let store = Arc::new(FakeStore {
            subscriptions: vec![
                sub(1, "x@example.com", "X", "temperature:>:30"),
                sub(2, "y@example.com", "Y", "temperature:>:30"),
                sub(3, "z@example.com", "Z", "temperature:>:30"),
            ],
            ..Default::default()
        });
        let provider = Arc::new(
            FakeProvider::default()
                .with("X", weather(35.0, "Clear"))
                .with("Y", Reply::Down)
                .with("Z", weather(20.0, "Clear")),
        );
        let mailer = Arc::new(FakeMailer::default());

        let report = dispatcher(&store, &provider, &mailer)
            .run_once()
            .await
            .expect("run succeeds");

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "x@example.com");
        assert_eq!(sent[0].subject, "Weather Update");

        let recorded = store.recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].subscription_id, 1);
        assert_eq!(recorded[0].owner_id, 10);

        assert_eq!(
            report,
            RunReport {
                subscriptions: 3,
                met: 1,
                sent: 1,
                recorded: 1,
                skipped_fetch: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn listing_failure_aborts_the_run() {
        let store = Arc::new(FakeStore {
            fail_list: true,
            ..Default::default()
        });
        let provider = Arc::new(FakeProvider::default());
        let mailer = Arc::new(FakeMailer::default());

        let err = dispatcher(&store, &provider, &mailer)
            .run_once()
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::ListSubscriptions(_)));
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_city_and_bad_condition_are_skipped() {
        let store = Arc::new(FakeStore {
            subscriptions: vec![
                sub(1, "a@example.com", "Atlantis", "temperature:>:0"),
                sub(2, "b@example.com", "Lviv", "pressure:>:10"),
                sub(3, "c@example.com", "Lviv", "main:rain"),
            ],
            ..Default::default()
        });
        let provider = Arc::new(
            FakeProvider::default()
                .with("Atlantis", Reply::NotFound)
                .with("Lviv", weather(10.0, "Rain")),
        );
        let mailer = Arc::new(FakeMailer::default());

        let report = dispatcher(&store, &provider, &mailer).run_once().await.unwrap();

        assert_eq!(report.skipped_fetch, 1);
        assert_eq!(report.skipped_evaluate, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(mailer.sent.lock().unwrap()[0].to, "c@example.com");
    }

    #[tokio::test]
    async fn failed_send_writes_no_record() {
        let store = Arc::new(FakeStore {
            subscriptions: vec![
                sub(1, "bounce@example.com", "X", "temperature:>:30"),
                sub(2, "ok@example.com", "X", "temperature:>:30"),
            ],
            ..Default::default()
        });
        let provider = Arc::new(FakeProvider::default().with("X", weather(31.0, "Clear")));
        let mailer = Arc::new(FakeMailer {
            reject: HashSet::from(["bounce@example.com".to_string()]),
            ..Default::default()
        });

        let report = dispatcher(&store, &provider, &mailer).run_once().await.unwrap();

        assert_eq!(report.met, 2);
        assert_eq!(report.skipped_send, 1);
        assert_eq!(report.recorded, 1);
        let recorded = store.recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].subscription_id, 2);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn failed_record_after_send_is_not_an_error() {
        let store = Arc::new(FakeStore {
            subscriptions: vec![sub(1, "x@example.com", "X", "temperature:>:30")],
            fail_record: true,
            ..Default::default()
        });
        let provider = Arc::new(FakeProvider::default().with("X", weather(35.0, "Clear")));
        let mailer = Arc::new(FakeMailer::default());

        let report = dispatcher(&store, &provider, &mailer)
            .run_once()
            .await
            .expect("record failure is not fatal");

        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
        assert_eq!(report.sent, 1);
        assert_eq!(report.recorded, 0);
        assert_eq!(report.unrecorded, 1);

        assert!(logs_contain("notification sent but not recorded"));
        assert!(logs_contain("stage=record"));
        assert!(logs_contain("subscription_id=1"));
        assert!(logs_contain("city=X"));
    }

    #[test]
    fn stage_names() {
        let names: Vec<String> = [Stage::Fetch, Stage::Evaluate, Stage::Send, Stage::Record]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, ["fetch", "evaluate", "send", "record"]);
    }

    #[tokio::test]
    async fn every_run_policy_resends_while_condition_holds() {
        let store = Arc::new(FakeStore {
            subscriptions: vec![sub(1, "x@example.com", "X", "main:Rain")],
            ..Default::default()
        });
        let provider = Arc::new(FakeProvider::default().with("X", weather(5.0, "rain")));
        let mailer = Arc::new(FakeMailer::default());
        let d = dispatcher(&store, &provider, &mailer);

        d.run_once().await.unwrap();
        d.run_once().await.unwrap();

        assert_eq!(mailer.sent.lock().unwrap().len(), 2);
        assert_eq!(store.recorded.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn once_per_activation_waits_for_condition_to_clear() {
        let store = Arc::new(FakeStore {
            subscriptions: vec![sub(1, "x@example.com", "X", "temperature:>=:30")],
            ..Default::default()
        });
        let provider = Arc::new(FakeProvider::default().with("X", weather(30.0, "Clear")));
        let mailer = Arc::new(FakeMailer::default());
        let d = dispatcher(&store, &provider, &mailer).with_policy(ResendPolicy::OncePerActivation);

        let first = d.run_once().await.unwrap();
        let second = d.run_once().await.unwrap();
        assert_eq!(first.sent, 1);
        assert_eq!(second.sent, 0);
        assert_eq!(second.suppressed, 1);

        provider.set("X", weather(25.0, "Clear"));
        let cleared = d.run_once().await.unwrap();
        assert_eq!(cleared.met, 0);
        assert!(store.suppressed.lock().unwrap().is_empty());

        provider.set("X", weather(32.0, "Clear"));
        let again = d.run_once().await.unwrap();
        assert_eq!(again.sent, 1);

        assert_eq!(mailer.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_send_does_not_suppress() {
        let store = Arc::new(FakeStore {
            subscriptions: vec![sub(1, "bounce@example.com", "X", "temperature:>:0")],
            ..Default::default()
        });
        let provider = Arc::new(FakeProvider::default().with("X", weather(10.0, "Clear")));
        let mailer = Arc::new(FakeMailer {
            reject: HashSet::from(["bounce@example.com".to_string()]),
            ..Default::default()
        });
        let d = dispatcher(&store, &provider, &mailer).with_policy(ResendPolicy::OncePerActivation);

        d.run_once().await.unwrap();
        assert!(store.suppressed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_store_is_a_successful_run() {
        let store = Arc::new(FakeStore::default());
        let provider = Arc::new(FakeProvider::default());
        let mailer = Arc::new(FakeMailer::default());

        let report = dispatcher(&store, &provider, &mailer).run_once().await.unwrap();
        assert_eq!(report, RunReport::default());
    }

    #[test]
    fn policy_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            resend: ResendPolicy,
        }
        let w: Wrapper = toml::from_str("resend = \"every-run\"").unwrap();
        assert_eq!(w.resend, ResendPolicy::EveryRun);
        let w: Wrapper = toml::from_str("resend = \"once-per-activation\"").unwrap();
        assert_eq!(w.resend, ResendPolicy::OncePerActivation);
    }
}
