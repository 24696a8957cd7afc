//! Recurring full-state snapshot broadcast
//!
//! The dispatcher publishes a [`BroadcastView`] whenever records or participants
//! change; the broadcaster task only ever reads the latest published view. It is
//! idle until [`SnapshotBroadcaster::start`] is called and keeps firing after the
//! participant count drops back to zero, where a firing simply has no recipients.

use crate::transport::ConnectionSender;
use log::{debug, info};
use shared::{PlayerRecord, SessionId, TcpMessage, TcpPayload, MAX_PLAYERS};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// What a firing sends and to whom
#[derive(Debug, Clone)]
pub struct BroadcastView {
    pub records: [PlayerRecord; MAX_PLAYERS],
    pub recipients: Vec<(SessionId, ConnectionSender)>,
}

impl Default for BroadcastView {
    fn default() -> Self {
        Self {
            records: [PlayerRecord::FILLER; MAX_PLAYERS],
            recipients: Vec::new(),
        }
    }
}

pub struct SnapshotBroadcaster {
    period: Duration,
    view: watch::Sender<BroadcastView>,
    task: Option<JoinHandle<()>>,
}

impl SnapshotBroadcaster {
    pub fn new(period: Duration) -> Self {
        let (view, _) = watch::channel(BroadcastView::default());
        Self {
            period,
            view,
            task: None,
        }
    }

    /// Replaces the view used by subsequent firings
    pub fn publish(&self, view: BroadcastView) {
        self.view.send_replace(view);
    }

    /// Arms the recurring timer; later calls are no-ops
    pub fn start(&mut self, runtime: &Handle) -> bool {
        if self.is_running() {
            return false;
        }

        info!("Snapshot broadcaster armed every {:?}", self.period);
        let view = self.view.subscribe();
        self.task = Some(runtime.spawn(broadcast_loop(self.period, view)));
        true
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SnapshotBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn broadcast_loop(period: Duration, view: watch::Receiver<BroadcastView>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let current = view.borrow().clone();
        fire(&current);
    }
}

/// Sends one snapshot to every recipient in `view`
///
/// A recipient whose queue is full or closed is skipped for this firing only.
pub fn fire(view: &BroadcastView) -> usize {
    let message = TcpMessage::new(TcpPayload::Snapshot {
        records: view.records,
    });

    let mut delivered = 0;
    for (id, sender) in &view.recipients {
        match sender.send(message.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => debug!("Snapshot skipped for session {}: {}", id, e),
        }
    }
    delivered
}
