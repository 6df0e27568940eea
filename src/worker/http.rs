//! Rate/time-bounded conditional downloader
//!
//! [`HttpDownloader::retrieve`] never returns an error: every failure is
//! written into the [`RetrievalOutcome`] as a terminal state plus a log line.
//! Redirects are followed by hand so each hop is recorded and counted against
//! the task's own budget. All waits on the network are bounded by the task's
//! limits; the body is read in slices of `limit_check_interval` so that the
//! total-time and throughput limits are checked even while the origin stalls.

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Response, Url};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::domain::{
    Phase, RetrievalError, RetrievalLimits, RetrievalOutcome, RetrieveTask, RetrievingState, TaskType,
};
use crate::humanize::ByteSize;
use crate::observability::Metrics;
use crate::storage::ResponseSink;

#[derive(Debug, Error)]
pub enum DownloaderError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Downloader configuration shared by every task on a node
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub user_agent: String,
    /// Time after transfer start before the throughput floor is enforced
    pub throughput_grace: Duration,
    /// Longest wait on the body before limits are re-checked
    pub limit_check_interval: Duration,
    /// Redirect cap applied when a task declares "unlimited" redirects
    pub redirect_ceiling: u32,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("harvester/", env!("CARGO_PKG_VERSION")).to_string(),
            throughput_grace: Duration::from_secs(5),
            limit_check_interval: Duration::from_millis(250),
            redirect_ceiling: 30,
        }
    }
}

pub struct HttpDownloader {
    client: Client,
    config: DownloaderConfig,
    metrics: Arc<Metrics>,
}

impl HttpDownloader {
    pub fn new(config: DownloaderConfig, metrics: Arc<Metrics>) -> Result<Self, DownloaderError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(Policy::none())
            .build()?;

        Ok(Self {
            client,
            config,
            metrics,
        })
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Execute one retrieval into `sink` and return its terminal outcome
    pub async fn retrieve(&self, task: &RetrieveTask, sink: &mut dyn ResponseSink) -> RetrievalOutcome {
        let mut outcome = RetrievalOutcome::new(sink.location());
        self.retrieve_into(task, sink, &mut outcome).await;
        outcome
    }

    /// Like [`retrieve`](Self::retrieve), writing into a caller-owned outcome.
    /// If this future is dropped the outcome keeps everything measured so far
    /// and can be terminated with [`abandon`](Self::abandon).
    pub async fn retrieve_into(
        &self,
        task: &RetrieveTask,
        sink: &mut dyn ResponseSink,
        outcome: &mut RetrievalOutcome,
    ) {
        let started = Instant::now();

        let result = match self.execute(task, sink, outcome).await {
            Ok(bytes) => sink
                .finish()
                .await
                .map(|()| bytes)
                .map_err(|e| RetrievalError::Sink(e.to_string())),
            Err(error) => Err(error),
        };

        match result {
            Ok(bytes) => outcome.complete(bytes),
            Err(error) => discard(sink, outcome, &error).await,
        }
        self.report(task, outcome, started.elapsed());
    }

    /// Terminate an interrupted retrieval with `error`. No-op on an outcome
    /// that is already terminal.
    pub async fn abandon(
        &self,
        task: &RetrieveTask,
        sink: &mut dyn ResponseSink,
        outcome: &mut RetrievalOutcome,
        error: &RetrievalError,
        elapsed: Duration,
    ) {
        if outcome.is_terminal() {
            return;
        }
        discard(sink, outcome, error).await;
        self.report(task, outcome, elapsed);
    }

    fn report(&self, task: &RetrieveTask, outcome: &RetrievalOutcome, elapsed: Duration) {
        self.metrics.retrieval_finished(outcome.state, elapsed);
        if outcome.state == RetrievingState::Completed {
            info!(
                task_id = %task.id,
                resource_id = %task.resource_id,
                state = outcome.state.as_str(),
                bytes = outcome.bytes_transferred,
                status = ?outcome.http_status,
                "Retrieval finished"
            );
        } else {
            warn!(
                task_id = %task.id,
                resource_id = %task.resource_id,
                state = outcome.state.as_str(),
                status = ?outcome.http_status,
                log = %outcome.log,
                "Retrieval failed"
            );
        }
    }

    /// Runs the state machine up to (not including) the terminal transition.
    /// Returns the number of body bytes written to the sink.
    async fn execute(
        &self,
        task: &RetrieveTask,
        sink: &mut dyn ResponseSink,
        outcome: &mut RetrievalOutcome,
    ) -> Result<u64, RetrievalError> {
        let url = parse_url(task.url.as_deref())?;
        let limits = &task.limits;
        let deadline = limits.max_retrieval_time().map(|bound| Instant::now() + bound);

        match task.task_type {
            TaskType::CheckLink => {
                outcome.transition(RetrievingState::CheckingExistence);
                self.check(url, limits, deadline, outcome).await?;
                return Ok(0);
            }
            TaskType::ConditionalDownload => {
                if let Some(previous) = task.previous_content_length() {
                    outcome.transition(RetrievingState::CheckingExistence);
                    let current = self.check(url.clone(), limits, deadline, outcome).await?;
                    if current == Some(previous) {
                        debug!(task_id = %task.id, length = previous, "Content length unchanged");
                        outcome.transition(RetrievingState::SkippedCompleted);
                        return Ok(0);
                    }
                    outcome.note(format!(
                        "content length changed from {previous} to {}",
                        current.map_or_else(|| "unknown".to_string(), |c| c.to_string())
                    ));
                    outcome.redirection_path.clear();
                }
            }
            TaskType::UnconditionalDownload => {}
        }

        outcome.transition(RetrievingState::Downloading);
        self.download(url, limits, deadline, sink, outcome).await
    }

    /// Metadata-only request; returns the declared content length
    async fn check(
        &self,
        url: Url,
        limits: &RetrievalLimits,
        deadline: Option<Instant>,
        outcome: &mut RetrievalOutcome,
    ) -> Result<Option<u64>, RetrievalError> {
        outcome.begin_phase(Phase::Checking);
        let response = self.fetch(Method::HEAD, url, limits, deadline, outcome).await;
        outcome.end_phase();

        let response = response?;
        record_headers(outcome, response.headers());
        Ok(declared_length(response.headers()))
    }

    async fn download(
        &self,
        url: Url,
        limits: &RetrievalLimits,
        deadline: Option<Instant>,
        sink: &mut dyn ResponseSink,
        outcome: &mut RetrievalOutcome,
    ) -> Result<u64, RetrievalError> {
        outcome.begin_phase(Phase::Connect);
        let response = self.fetch(Method::GET, url, limits, deadline, outcome).await;
        outcome.end_phase();

        let response = response?;
        record_headers(outcome, response.headers());

        if let (Some(limit), Some(declared)) =
            (limits.max_content_size(), declared_length(response.headers()))
        {
            if declared > limit {
                return Err(RetrievalError::SizeLimitExceeded {
                    observed: declared,
                    limit,
                });
            }
        }

        outcome.begin_phase(Phase::Retrieval);
        let result = self
            .stream_body(response, limits, deadline, Instant::now(), sink)
            .await;
        outcome.end_phase();
        result
    }

    async fn stream_body(
        &self,
        mut response: Response,
        limits: &RetrievalLimits,
        deadline: Option<Instant>,
        started: Instant,
        sink: &mut dyn ResponseSink,
    ) -> Result<u64, RetrievalError> {
        let mut received: u64 = 0;

        loop {
            let wait = match remaining(deadline) {
                Some(left) if left.is_zero() => {
                    return Err(RetrievalError::ReadTimeout(limits.max_retrieval_time));
                }
                Some(left) => left.min(self.config.limit_check_interval),
                None => self.config.limit_check_interval,
            };

            match timeout(wait, response.chunk()).await {
                Ok(Ok(Some(chunk))) => {
                    received += chunk.len() as u64;
                    if let Some(limit) = limits.max_content_size() {
                        if received > limit {
                            return Err(RetrievalError::SizeLimitExceeded {
                                observed: received,
                                limit,
                            });
                        }
                    }
                    sink.write(&chunk)
                        .await
                        .map_err(|e| RetrievalError::Sink(e.to_string()))?;
                }
                Ok(Ok(None)) => return Ok(received),
                Ok(Err(e)) => return Err(classify(e)),
                // Origin stalled for a whole check interval
                Err(_) => {}
            }

            self.check_throughput(limits, started, received)?;
        }
    }

    fn check_throughput(
        &self,
        limits: &RetrievalLimits,
        started: Instant,
        received: u64,
    ) -> Result<(), RetrievalError> {
        let Some(floor) = limits.min_throughput() else {
            return Ok(());
        };
        let elapsed = started.elapsed();
        if elapsed < self.config.throughput_grace {
            return Ok(());
        }

        let observed = ByteSize(received).rate_over(elapsed);
        if observed < floor {
            return Err(RetrievalError::ThroughputTooLow { observed, floor });
        }
        Ok(())
    }

    /// Issue `method` against `url`, following redirects within the budget.
    /// Returns the first non-redirect response, which is always 2xx.
    async fn fetch(
        &self,
        method: Method,
        url: Url,
        limits: &RetrievalLimits,
        deadline: Option<Instant>,
        outcome: &mut RetrievalOutcome,
    ) -> Result<Response, RetrievalError> {
        let budget = limits.redirect_budget(self.config.redirect_ceiling);
        let mut current = url;
        let mut hops = 0u32;

        loop {
            let response = self
                .send(method.clone(), &current, limits, deadline, outcome)
                .await?;
            if let Some(addr) = response.remote_addr() {
                outcome.source_ip = Some(addr.ip());
            }

            let status = response.status();
            if status.is_redirection() {
                if let Some(next) = redirect_target(&current, response.headers()) {
                    hops += 1;
                    if hops > budget {
                        outcome.http_status = Some(status.as_u16());
                        return Err(RetrievalError::RedirectLimitExceeded(budget));
                    }
                    debug!(from = %current, to = %next, hops, "Following redirect");
                    outcome.redirection_path.push(next.to_string());
                    current = next;
                    continue;
                }
            }

            outcome.http_status = Some(status.as_u16());
            if !status.is_success() {
                return Err(RetrievalError::HttpStatus(status.as_u16()));
            }
            return Ok(response);
        }
    }

    /// One request up to the response headers, bounded by the connection
    /// timeout and by whatever is left of the total retrieval time
    async fn send(
        &self,
        method: Method,
        url: &Url,
        limits: &RetrievalLimits,
        deadline: Option<Instant>,
        outcome: &mut RetrievalOutcome,
    ) -> Result<Response, RetrievalError> {
        let bound = request_bound(limits, deadline);

        let resolve = resolve(url);
        let resolved = match &bound {
            Some((wait, on_timeout)) => timeout(*wait, resolve)
                .await
                .map_err(|_| on_timeout.clone())?,
            None => resolve.await,
        }?;
        outcome.source_ip = Some(resolved.ip());

        self.metrics.network_attempt();
        let request = self.client.request(method, url.clone()).send();
        let response = match bound {
            Some((wait, on_timeout)) => timeout(wait, request).await.map_err(|_| on_timeout)?,
            None => request.await,
        };
        response.map_err(classify)
    }
}

/// Drop whatever reached the sink and close it, then fail the outcome
async fn discard(sink: &mut dyn ResponseSink, outcome: &mut RetrievalOutcome, error: &RetrievalError) {
    if let Err(e) = sink.truncate().await {
        outcome.note(format!("failed to discard partial body: {e}"));
    }
    if let Err(e) = sink.finish().await {
        outcome.note(format!("failed to close sink: {e}"));
    }
    outcome.fail(error);
}

fn parse_url(raw: Option<&str>) -> Result<Url, RetrievalError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RetrievalError::MalformedInput("missing url".to_string()))?;
    let url = Url::parse(raw)
        .map_err(|e| RetrievalError::MalformedInput(format!("{raw}: {e}")))?;

    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(RetrievalError::MalformedInput(format!(
            "{raw}: unsupported url"
        ))),
    }
}

/// Tightest of the connection timeout and the remaining total time, paired
/// with the error reported when it elapses
fn request_bound(
    limits: &RetrievalLimits,
    deadline: Option<Instant>,
) -> Option<(Duration, RetrievalError)> {
    let connect = limits
        .connection_timeout()
        .map(|bound| (bound, RetrievalError::ConnectTimeout(bound)));
    let total = remaining(deadline)
        .map(|left| (left, RetrievalError::ReadTimeout(limits.max_retrieval_time)));

    match (connect, total) {
        (Some(connect), Some(total)) => Some(if connect.0 <= total.0 { connect } else { total }),
        (connect, total) => connect.or(total),
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

async fn resolve(url: &Url) -> Result<SocketAddr, RetrievalError> {
    let port = url.port_or_known_default().unwrap_or(80);
    let host = url
        .host_str()
        .ok_or_else(|| RetrievalError::MalformedInput(format!("{url}: no host")))?;

    // IPv6 literals come bracketed
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| RetrievalError::DnsResolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
    addrs.next().ok_or_else(|| RetrievalError::DnsResolution {
        host: host.to_string(),
        reason: "no addresses".to_string(),
    })
}

fn classify(error: reqwest::Error) -> RetrievalError {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(&error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    RetrievalError::Network(message)
}

fn redirect_target(current: &Url, headers: &HeaderMap) -> Option<Url> {
    let location = headers.get(LOCATION)?.to_str().ok()?;
    current.join(location).ok()
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn record_headers(outcome: &mut RetrievalOutcome, headers: &HeaderMap) {
    outcome.content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    outcome.headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
}
