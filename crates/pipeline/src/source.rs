//! Source boundary
//!
//! A [`BinlogSource`] yields primitive binlog events in order and can be
//! repositioned, which the shard needs to replay overflowed transactions.
//!
//! Implementations:
//! - [`ReplaySource`]: events held in memory, for replays and tests
//! - [`ChannelSource`]: the consuming end of a bounded queue filled by a
//!   reader task (see [`spawn_replay_reader`])
//!
//! Connecting to a live server goes through a [`SourceConnector`], tried
//! against each candidate endpoint in turn by [`connect_with_failover`].

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::event::SourceEvent;
use crate::position::Position;

/// Outcome of one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Polled {
    Event(SourceEvent),
    /// Nothing arrived within the timeout.
    Idle,
    /// The stream ended; no further events will arrive.
    Closed,
}

#[async_trait]
pub trait BinlogSource: Send {
    /// Wait up to `timeout` for the next event.
    async fn poll_event(&mut self, timeout: Duration) -> Result<Polled>;

    /// Continue from the first event at or after `position`.
    async fn seek(&mut self, position: &Position) -> Result<()>;
}

fn seek_index(events: &[SourceEvent], position: &Position) -> usize {
    events
        .iter()
        .position(|e| e.position.cmp_location(position).is_ge())
        .unwrap_or(events.len())
}

/// Source over an in-memory list of events.
pub struct ReplaySource {
    events: Vec<SourceEvent>,
    cursor: usize,
    idle_polls: usize,
    seeks: Vec<Position>,
}

impl ReplaySource {
    pub fn new(events: Vec<SourceEvent>) -> Self {
        Self {
            events,
            cursor: 0,
            idle_polls: 0,
            seeks: Vec::new(),
        }
    }

    /// Report `polls` idle polls at the end of the events before closing.
    pub fn with_idle_polls(mut self, polls: usize) -> Self {
        self.idle_polls = polls;
        self
    }

    /// Every position sought so far.
    pub fn seeks(&self) -> &[Position] {
        &self.seeks
    }
}

#[async_trait]
impl BinlogSource for ReplaySource {
    async fn poll_event(&mut self, _timeout: Duration) -> Result<Polled> {
        if let Some(event) = self.events.get(self.cursor) {
            self.cursor += 1;
            return Ok(Polled::Event(event.clone()));
        }
        if self.idle_polls > 0 {
            self.idle_polls -= 1;
            return Ok(Polled::Idle);
        }
        Ok(Polled::Closed)
    }

    async fn seek(&mut self, position: &Position) -> Result<()> {
        self.cursor = seek_index(&self.events, position);
        self.seeks.push(position.clone());
        Ok(())
    }
}

/// Message from a reader task to a [`ChannelSource`].
#[derive(Debug)]
pub enum SourceMessage {
    Event { generation: u64, event: SourceEvent },
    /// The reader reached the end of its stream.
    End { generation: u64 },
    /// The reader failed; the shard stops with a recoverable fault.
    Failed(String),
}

/// Request from a [`ChannelSource`] to its reader task.
#[derive(Debug)]
pub enum SourceControl {
    /// Restart at the first event at or after `position`, tagging everything
    /// sent from now on with `generation`.
    Seek { position: Position, generation: u64 },
}

/// Consuming end of the bounded event queue.
///
/// Every seek bumps a generation counter. Messages already queued under an
/// older generation are discarded, so events read ahead before a seek never
/// reach the shard.
pub struct ChannelSource {
    events: mpsc::Receiver<SourceMessage>,
    control: mpsc::Sender<SourceControl>,
    generation: u64,
}

impl ChannelSource {
    pub fn new(events: mpsc::Receiver<SourceMessage>, control: mpsc::Sender<SourceControl>) -> Self {
        Self {
            events,
            control,
            generation: 0,
        }
    }
}

#[async_trait]
impl BinlogSource for ChannelSource {
    async fn poll_event(&mut self, timeout: Duration) -> Result<Polled> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let message = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Err(_) => return Ok(Polled::Idle),
                Ok(None) => return Ok(Polled::Closed),
                Ok(Some(message)) => message,
            };
            match message {
                SourceMessage::Event { generation, event } if generation == self.generation => {
                    return Ok(Polled::Event(event));
                }
                SourceMessage::End { generation } if generation == self.generation => {
                    return Ok(Polled::Closed);
                }
                SourceMessage::Failed(reason) => {
                    anyhow::bail!("source reader failed: {reason}");
                }
                stale => debug!("discarding message from before the last seek: {stale:?}"),
            }
        }
    }

    async fn seek(&mut self, position: &Position) -> Result<()> {
        self.generation += 1;
        self.control
            .send(SourceControl::Seek {
                position: position.clone(),
                generation: self.generation,
            })
            .await
            .map_err(|_| anyhow::anyhow!("source reader is gone, cannot seek to {position}"))
    }
}

/// Feed `events` into a bounded queue of `capacity` from a background task.
///
/// The task ends once the returned [`ChannelSource`] is dropped.
pub fn spawn_replay_reader(
    events: Vec<SourceEvent>,
    capacity: usize,
) -> (ChannelSource, JoinHandle<()>) {
    let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
    let (control_tx, mut control_rx) = mpsc::channel(8);

    let handle = tokio::spawn(async move {
        let mut cursor = 0;
        let mut generation = 0;
        let mut end_sent = false;
        loop {
            if cursor >= events.len() {
                if !end_sent {
                    if event_tx.send(SourceMessage::End { generation }).await.is_err() {
                        break;
                    }
                    end_sent = true;
                }
                match control_rx.recv().await {
                    Some(SourceControl::Seek {
                        position,
                        generation: g,
                    }) => {
                        cursor = seek_index(&events, &position);
                        generation = g;
                        end_sent = false;
                        continue;
                    }
                    None => break,
                }
            }

            let message = SourceMessage::Event {
                generation,
                event: events[cursor].clone(),
            };
            tokio::select! {
                control = control_rx.recv() => match control {
                    Some(SourceControl::Seek { position, generation: g }) => {
                        cursor = seek_index(&events, &position);
                        generation = g;
                        end_sent = false;
                    }
                    None => break,
                },
                sent = event_tx.send(message) => {
                    if sent.is_err() {
                        break;
                    }
                    cursor += 1;
                }
            }
        }
        debug!("replay reader stopped");
    });

    (ChannelSource::new(event_rx, control_tx), handle)
}

/// Opens a source against one endpoint.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        resume: Option<&Position>,
    ) -> Result<Box<dyn BinlogSource>>;
}

/// Connect to the first endpoint that accepts, in order.
///
/// When every endpoint fails, `on_exhausted` sees the final error before it
/// is returned.
pub async fn connect_with_failover<C, F>(
    connector: &C,
    endpoints: &[String],
    resume: Option<&Position>,
    on_exhausted: F,
) -> Result<Box<dyn BinlogSource>>
where
    C: SourceConnector + ?Sized,
    F: FnOnce(&anyhow::Error),
{
    let mut last_error = None;
    for endpoint in endpoints {
        match connector.connect(endpoint, resume).await {
            Ok(source) => {
                debug!("connected to source endpoint {endpoint}");
                return Ok(source);
            }
            Err(e) => {
                warn!("error connecting to {endpoint}, falling over to the next one: {e:#}");
                last_error = Some(e);
            }
        }
    }

    let err = match last_error {
        Some(e) => e.context(format!("all {} source endpoints failed", endpoints.len())),
        None => anyhow::anyhow!("no source endpoints configured"),
    };
    on_exhausted(&err);
    Err(err)
}
