use crate::client::{FetchOutcome, KeyFetch, KeyStoreClient};
use crate::errors::{EndpointFailure, Error, Result, Role};
use crate::types::{Action, KeySource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, debug, error, info, info_span, warn};

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Both redundant sources of the same logical key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedundantSources {
    pub primary: KeySource,
    pub secondary: KeySource,
}

impl RedundantSources {
    pub fn new(primary: KeySource, secondary: KeySource) -> Self {
        Self { primary, secondary }
    }

    fn iter(&self) -> impl Iterator<Item = (Role, &KeySource)> {
        [(Role::Primary, &self.primary), (Role::Secondary, &self.secondary)].into_iter()
    }
}

/// Races one logical request against two endpoints and keeps the first success.
pub struct RedundantFetcher<F = KeyStoreClient>
where
    F: KeyFetch + 'static,
{
    fetcher: Arc<F>,
    sources: RedundantSources,
    operation_timeout: Duration,
}

impl<F> Clone for RedundantFetcher<F>
where
    F: KeyFetch + 'static,
{
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            sources: self.sources.clone(),
            operation_timeout: self.operation_timeout,
        }
    }
}

impl<F> RedundantFetcher<F>
where
    F: KeyFetch + 'static,
{
    pub fn new(fetcher: F, sources: RedundantSources) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            sources,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Overall deadline covering both attempts.
    pub fn with_operation_timeout(mut self, duration: Duration) -> Self {
        self.operation_timeout = duration;
        self
    }

    pub fn sources(&self) -> &RedundantSources {
        &self.sources
    }

    /// Sends `action` to both sources concurrently.
    ///
    /// Returns the body of the first attempt to succeed. The slower attempt keeps running in the
    /// background and its result is dropped. When neither succeeds the error is
    /// [`Error::KeyUnavailable`] carrying each endpoint's failure.
    pub async fn race_fetch(&self, action: Action, payload: &[u8]) -> Result<Vec<u8>> {
        let span = info_span!("race_fetch", %action);
        self.race(action, payload).instrument(span).await
    }

    async fn race(&self, action: Action, payload: &[u8]) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.operation_timeout;
        // Capacity equals the number of attempts, so senders never wait on an abandoned receiver.
        let (tx, mut rx) = mpsc::channel::<(Role, FetchOutcome)>(2);

        for (role, source) in self.sources.iter() {
            let tx = tx.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let source = source.clone();
            let payload = payload.to_vec();
            tokio::spawn(async move {
                let outcome = fetcher
                    .fetch(&source.address, source.location, action, &payload)
                    .await;
                let _ = tx.send((role, outcome)).await;
            });
        }
        drop(tx);

        let mut failures = Vec::with_capacity(2);
        loop {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some((role, Ok(body)))) => {
                    info!(%role, endpoint = %self.source(role).address, "key-custody request served");
                    return Ok(body);
                }
                Ok(Some((role, Err(err)))) => {
                    let endpoint = self.source(role).address.clone();
                    warn!(%role, endpoint = %endpoint, error = %err, "key-custody attempt failed");
                    failures.push(EndpointFailure {
                        role,
                        endpoint,
                        error: err,
                    });
                }
                Ok(None) => break,
                Err(_) => {
                    for (role, source) in self.sources.iter() {
                        if failures.iter().any(|failure| failure.role == role) {
                            continue;
                        }
                        let error = Error::transport(
                            source.address.clone(),
                            format!("operation deadline of {:?} elapsed", self.operation_timeout),
                        );
                        warn!(%role, endpoint = %source.address, error = %error, "key-custody attempt abandoned");
                        failures.push(EndpointFailure {
                            role,
                            endpoint: source.address.clone(),
                            error,
                        });
                    }
                    break;
                }
            }
        }

        error!(attempts = failures.len(), "every key-custody endpoint failed");
        debug!(?failures, "redundant fetch failures");
        Err(Error::KeyUnavailable { failures })
    }

    fn source(&self, role: Role) -> &KeySource {
        match role {
            Role::Primary => &self.sources.primary,
            Role::Secondary => &self.sources.secondary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyLocation;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone)]
    enum Scripted {
        Reply(Vec<u8>, Duration),
        Fail(Error, Duration),
        Hang,
    }

    #[derive(Default)]
    struct ScriptedFetch {
        script: HashMap<String, Scripted>,
        seen: Mutex<Vec<(String, KeyLocation, Action, Vec<u8>)>>,
    }

    impl ScriptedFetch {
        fn with(mut self, address: &str, behaviour: Scripted) -> Self {
            self.script.insert(address.to_string(), behaviour);
            self
        }
    }

    #[async_trait]
    impl KeyFetch for ScriptedFetch {
        async fn fetch(
            &self,
            address: &str,
            location: KeyLocation,
            action: Action,
            payload: &[u8],
        ) -> FetchOutcome {
            self.seen.lock().unwrap().push((
                address.to_string(),
                location,
                action,
                payload.to_vec(),
            ));
            match self.script.get(address).cloned() {
                Some(Scripted::Reply(body, delay)) => {
                    tokio::time::sleep(delay).await;
                    Ok(body)
                }
                Some(Scripted::Fail(err, delay)) => {
                    tokio::time::sleep(delay).await;
                    Err(err)
                }
                Some(Scripted::Hang) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                None => Err(Error::transport(address, "not scripted")),
            }
        }
    }

    fn sources() -> RedundantSources {
        RedundantSources::new(
            KeySource::new("a", KeyLocation::new(40, 1)),
            KeySource::new("b", KeyLocation::new(41, 1)),
        )
    }

    fn rejected(endpoint: &str) -> Error {
        Error::RequestRejected {
            endpoint: endpoint.into(),
            status: 1,
        }
    }

    #[tokio::test]
    async fn each_source_gets_its_own_location() {
        let fetch = Arc::new(
            ScriptedFetch::default()
                .with("a", Scripted::Fail(rejected("a"), Duration::ZERO))
                .with("b", Scripted::Fail(rejected("b"), Duration::ZERO)),
        );
        let fetcher = RedundantFetcher::new(Arc::clone(&fetch), sources());
        let _ = fetcher.race_fetch(Action::WrapKey, &[0; 32]).await;

        let mut seen = fetch.seen.lock().unwrap().clone();
        seen.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, KeyLocation::new(40, 1));
        assert_eq!(seen[1].1, KeyLocation::new(41, 1));
        assert!(seen.iter().all(|entry| entry.2 == Action::WrapKey));
        assert!(seen.iter().all(|entry| entry.3 == vec![0; 32]));
    }

    #[tokio::test]
    async fn primary_failure_falls_through_to_secondary() {
        let fetch = ScriptedFetch::default()
            .with("a", Scripted::Fail(rejected("a"), Duration::ZERO))
            .with("b", Scripted::Reply(vec![0xBB; 16], Duration::from_millis(20)));
        let fetcher = RedundantFetcher::new(fetch, sources());
        let key = fetcher.race_fetch(Action::GetKey, &[]).await.unwrap();
        assert_eq!(key, vec![0xBB; 16]);
    }

    #[tokio::test]
    async fn secondary_failure_is_absorbed() {
        let fetch = ScriptedFetch::default()
            .with("a", Scripted::Reply(vec![0xAA; 16], Duration::from_millis(20)))
            .with("b", Scripted::Fail(rejected("b"), Duration::ZERO));
        let fetcher = RedundantFetcher::new(fetch, sources());
        let key = fetcher.race_fetch(Action::GetKey, &[]).await.unwrap();
        assert_eq!(key, vec![0xAA; 16]);
    }

    #[tokio::test]
    async fn first_success_wins_without_waiting_for_hung_peer() {
        let fetch = ScriptedFetch::default()
            .with("a", Scripted::Hang)
            .with("b", Scripted::Reply(vec![0xBB; 16], Duration::ZERO));
        let fetcher = RedundantFetcher::new(fetch, sources())
            .with_operation_timeout(Duration::from_secs(30));
        let started = std::time::Instant::now();
        let key = fetcher.race_fetch(Action::GetKey, &[]).await.unwrap();
        assert_eq!(key, vec![0xBB; 16]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn total_failure_reports_both_causes() {
        let fetch = ScriptedFetch::default()
            .with("a", Scripted::Fail(rejected("a"), Duration::ZERO))
            .with(
                "b",
                Scripted::Fail(Error::transport("b", "refused"), Duration::from_millis(5)),
            );
        let fetcher = RedundantFetcher::new(fetch, sources());
        let err = fetcher.race_fetch(Action::GetKey, &[]).await.unwrap_err();
        let Error::KeyUnavailable { failures } = err else {
            panic!("expected KeyUnavailable");
        };
        assert_eq!(failures.len(), 2);
        let primary = failures.iter().find(|f| f.role == Role::Primary).unwrap();
        let secondary = failures.iter().find(|f| f.role == Role::Secondary).unwrap();
        assert_eq!(primary.error, rejected("a"));
        assert!(matches!(secondary.error, Error::Transport { .. }));
    }

    #[tokio::test]
    async fn deadline_turns_hung_attempts_into_failures() {
        let fetch = ScriptedFetch::default()
            .with("a", Scripted::Fail(rejected("a"), Duration::ZERO))
            .with("b", Scripted::Hang);
        let fetcher = RedundantFetcher::new(fetch, sources())
            .with_operation_timeout(Duration::from_millis(50));
        let err = fetcher.race_fetch(Action::GetKey, &[]).await.unwrap_err();
        let Error::KeyUnavailable { failures } = err else {
            panic!("expected KeyUnavailable");
        };
        assert_eq!(failures.len(), 2);
        let secondary = failures.iter().find(|f| f.role == Role::Secondary).unwrap();
        match &secondary.error {
            Error::Transport { message, .. } => assert!(message.contains("deadline")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
