//! Paced replay of captured uplinks toward a network server
//!
//! Every job is driven by exactly one spawned worker that sends one
//! PUSH_DATA packet per record, sleeping `delay_ms` between sends. Control
//! calls (`stop`, `resume`) and status polls only touch the job through its
//! lock, so a poller never sees a log line without its counter update.
//!
//! Stopping is cooperative: the worker checks the job status before each
//! send, and a send that has started is always completed and logged.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ReplayError;
use crate::lorawan::parse_phy_payload;
use crate::store::TokenStore;
use crate::udp::protocol::{build_push_data, Rxpk, UplinkRecord};

const ERROR_PREVIEW_CHARS: usize = 100;
const DATA_PREVIEW_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayParams {
    pub host: String,
    pub port: u16,
    pub delay_ms: u64,
    /// Rewrite timing/radio fields so strict network servers accept old captures
    pub override_rxpk: bool,
}

impl Default for ReplayParams {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1700,
            delay_ms: 500,
            override_rxpk: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Stopped,
    Done,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LineStatus {
    Sent,
    Error,
    Stopped,
}

/// One entry of a job's append-only event log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayLogLine {
    /// 1-based record number; `None` for the synthetic stop line
    pub index: Option<usize>,
    pub status: LineStatus,
    pub send_time_ms: Option<i64>,
    pub gateway: String,
    pub fcnt: Option<u16>,
    pub freq: Option<f64>,
    pub size: Option<u64>,
    pub message: String,
}

/// Snapshot returned to pollers
#[derive(Debug, Clone, Serialize)]
pub struct ReplayStatus {
    pub status: JobStatus,
    pub total: usize,
    pub sent: usize,
    pub errors: usize,
    pub host: String,
    pub port: u16,
    pub delay_ms: u64,
    pub current_index: usize,
    /// Log lines from `since` onward
    pub lines: Vec<ReplayLogLine>,
    /// Full log length, the next `since`
    pub count: usize,
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    start_index: usize,
    /// Number of records processed so far, sent or failed
    current_index: usize,
    sent: usize,
    errors: usize,
    log: Vec<ReplayLogLine>,
    /// Set once a resume has taken over this job
    superseded: bool,
    /// Cleared by the worker, under the lock, as it exits
    worker_active: bool,
}

pub struct ReplayJob {
    records: Arc<Vec<UplinkRecord>>,
    params: ReplayParams,
    state: Mutex<JobState>,
    wake: Notify,
    exited: Notify,
}

pub type ReplayJobStore = dyn TokenStore<Arc<ReplayJob>>;

#[derive(Clone)]
pub struct ReplayJobManager {
    jobs: Arc<ReplayJobStore>,
}

impl ReplayJobManager {
    pub fn new(jobs: Arc<ReplayJobStore>) -> Self {
        Self { jobs }
    }

    /// Create a job and spawn its worker; returns without waiting for any send
    pub async fn start(
        &self,
        records: Arc<Vec<UplinkRecord>>,
        params: ReplayParams,
    ) -> Result<String, ReplayError> {
        if records.is_empty() {
            return Err(ReplayError::NoRecords);
        }
        let state = JobState {
            status: JobStatus::Running,
            start_index: 0,
            current_index: 0,
            sent: 0,
            errors: 0,
            log: Vec::new(),
            superseded: false,
            worker_active: true,
        };
        Ok(self.spawn(records, params, state).await)
    }

    /// Stop a running job between packets. No-op for jobs that are not running.
    pub async fn stop(&self, token: &str) -> Result<(), ReplayError> {
        let job = self.jobs.get(token).await.ok_or(ReplayError::NotFound)?;
        let mut state = job.state.lock().await;
        if state.status != JobStatus::Running {
            return Ok(());
        }
        state.log.push(ReplayLogLine {
            index: None,
            status: LineStatus::Stopped,
            send_time_ms: Some(Utc::now().timestamp_millis()),
            gateway: String::new(),
            fcnt: None,
            freq: None,
            size: None,
            message: "Replay stopped by user.".to_string(),
        });
        state.status = JobStatus::Stopped;
        drop(state);

        job.wake.notify_one();
        info!("Replay {} stopped", token);
        Ok(())
    }

    /// Continue a stopped job under a new token from where it stopped.
    ///
    /// A packet the old worker had already started is finished and logged
    /// first, so the new worker picks up after it.
    pub async fn resume(&self, token: &str) -> Result<String, ReplayError> {
        let job = self.jobs.get(token).await.ok_or(ReplayError::NotFound)?;
        let mut state = loop {
            let exited = job.exited.notified();
            let state = job.state.lock().await;
            if state.superseded {
                return Err(ReplayError::NotResumable("superseded".to_string()));
            }
            if state.status != JobStatus::Stopped {
                return Err(ReplayError::NotResumable(state.status.to_string()));
            }
            if !state.worker_active {
                break state;
            }
            drop(state);
            debug!("Replay {} waiting for its worker to exit", token);
            exited.await;
        };
        state.superseded = true;

        let carried = JobState {
            status: JobStatus::Running,
            start_index: state.current_index,
            current_index: state.current_index,
            sent: state.sent,
            errors: state.errors,
            log: state.log.clone(),
            superseded: false,
            worker_active: true,
        };
        drop(state);

        info!(
            "Resuming replay {} at record {}/{}",
            token,
            carried.start_index + 1,
            job.records.len()
        );
        Ok(self
            .spawn(job.records.clone(), job.params.clone(), carried)
            .await)
    }

    /// `None` once the job is unknown or has expired
    pub async fn status(&self, token: &str, since: usize) -> Option<ReplayStatus> {
        let job = self.jobs.get(token).await?;
        let state = job.state.lock().await;
        let since = since.min(state.log.len());
        Some(ReplayStatus {
            status: state.status,
            total: job.records.len(),
            sent: state.sent,
            errors: state.errors,
            host: job.params.host.clone(),
            port: job.params.port,
            delay_ms: job.params.delay_ms,
            current_index: state.current_index,
            lines: state.log[since..].to_vec(),
            count: state.log.len(),
        })
    }

    async fn spawn(
        &self,
        records: Arc<Vec<UplinkRecord>>,
        params: ReplayParams,
        state: JobState,
    ) -> String {
        let job = Arc::new(ReplayJob {
            records,
            params,
            state: Mutex::new(state),
            wake: Notify::new(),
            exited: Notify::new(),
        });
        let token = self.jobs.insert(job.clone()).await;
        info!(
            "Replay {} -> {}:{} ({} records, {} ms delay)",
            token,
            job.params.host,
            job.params.port,
            job.records.len(),
            job.params.delay_ms
        );

        let jobs = self.jobs.clone();
        let worker_token = token.clone();
        tokio::spawn(async move {
            run_worker(jobs, worker_token, job).await;
        });
        token
    }
}

async fn run_worker(jobs: Arc<ReplayJobStore>, token: String, job: Arc<ReplayJob>) {
    let params = &job.params;
    let total = job.records.len();
    let delay = Duration::from_millis(params.delay_ms);
    let started = Instant::now();

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| e.to_string());
    if let Err(e) = &socket {
        warn!("Replay {}: failed to bind UDP socket: {}", token, e);
    }

    let start_index = job.state.lock().await.start_index;
    for (offset, record) in job.records.iter().enumerate().skip(start_index) {
        let index = offset + 1;
        if job.state.lock().await.status != JobStatus::Running {
            debug!("Replay {} no longer running before record {}", token, index);
            break;
        }

        let mut rxpk = record.rxpk.clone();
        if params.override_rxpk {
            apply_rxpk_override(&mut rxpk, started.elapsed());
        }
        let fcnt = rxpk
            .phy_payload()
            .and_then(|phy| parse_phy_payload(&phy))
            .ok()
            .map(|frame| frame.fcnt);

        let mut line = ReplayLogLine {
            index: Some(index),
            status: LineStatus::Error,
            send_time_ms: None,
            gateway: record.gateway_eui.clone(),
            fcnt,
            freq: rxpk.freq(),
            size: rxpk.size(),
            message: String::new(),
        };

        let mut attempted = false;
        match build_push_data(&record.gateway_eui, &rxpk) {
            Err(e) => {
                line.message = format!("Build error: {} -- {}", e, rxpk_preview(&rxpk));
            }
            Ok(packet) => {
                attempted = true;
                let result = match &socket {
                    Ok(socket) => socket
                        .send_to(&packet, (params.host.as_str(), params.port))
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.clone()),
                };
                line.send_time_ms = Some(Utc::now().timestamp_millis());
                match result {
                    Ok(()) => {
                        line.status = LineStatus::Sent;
                        line.size = rxpk.size().or(Some(packet.len() as u64));
                        line.message = sent_message(&rxpk);
                    }
                    Err(e) => {
                        line.message = format!("Send error: {} -- {}", e, rxpk_preview(&rxpk));
                    }
                }
            }
        }

        if line.status == LineStatus::Error {
            warn!("Replay {} record {}: {}", token, index, line.message);
        } else {
            debug!("Replay {} record {}: {}", token, index, line.message);
        }

        {
            let mut state = job.state.lock().await;
            match line.status {
                LineStatus::Sent => state.sent += 1,
                _ => state.errors += 1,
            }
            state.log.push(line);
            state.current_index = index;
        }
        jobs.touch(&token).await;

        if attempted && !delay.is_zero() && index < total {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = job.wake.notified() => {}
            }
        }
    }

    let mut state = job.state.lock().await;
    if state.status == JobStatus::Running {
        state.status = JobStatus::Done;
    }
    state.worker_active = false;
    info!(
        "Replay {} finished: {} (sent={}, errors={})",
        token, state.status, state.sent, state.errors
    );
    drop(state);
    job.exited.notify_waiters();
}

/// Present an old capture as if it had just been received
pub fn apply_rxpk_override(rxpk: &mut Rxpk, elapsed: Duration) {
    rxpk.set("time", Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true));
    // Concentrator counter is a wrapping u32 of microseconds
    rxpk.set("tmst", elapsed.as_micros() as u64 & 0xFFFF_FFFF);
    rxpk.set("chan", 0);
    rxpk.set("rfch", 0);
    rxpk.set("stat", 1);
    rxpk.set("modu", "LORA");
    if let Ok(phy) = rxpk.phy_payload() {
        rxpk.set("size", phy.len());
    }
}

fn sent_message(rxpk: &Rxpk) -> String {
    let data = rxpk.data();
    let data = if data.is_empty() {
        "n/a".to_string()
    } else if data.chars().count() > DATA_PREVIEW_CHARS {
        format!(
            "{}...",
            data.chars().take(DATA_PREVIEW_CHARS).collect::<String>()
        )
    } else {
        data.to_string()
    };
    let field = |key: &str| rxpk.display(key).unwrap_or_else(|| "?".to_string());
    format!(
        "{} datr={}, rssi={} dBm, lsnr={} dB, data={}",
        field("time"),
        field("datr"),
        field("rssi"),
        field("lsnr"),
        data
    )
}

fn rxpk_preview(rxpk: &Rxpk) -> String {
    let serialized = serde_json::to_string(rxpk).unwrap_or_default();
    if serialized.chars().count() > ERROR_PREVIEW_CHARS {
        format!(
            "{}...",
            serialized.chars().take(ERROR_PREVIEW_CHARS).collect::<String>()
        )
    } else {
        serialized
    }
}
