use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{info, warn};

use crate::counter::Counter;
use crate::error::{BenchError, BenchResult};
use crate::protocol::MessageGenerator;
use crate::session::{ReceivedMessage, Session};
use crate::subject::connect::Connector;
use crate::subject::short_id;

/// The session list of one subject. The lock wraps pool-mutating verbs
/// only; per-session I/O runs on each session's own tasks.
pub struct SessionPool {
    sessions: Mutex<Vec<Session>>,
    received_tx: mpsc::Sender<ReceivedMessage>,
    counter: Arc<Counter>,
}

impl SessionPool {
    pub fn new(received_tx: mpsc::Sender<ReceivedMessage>, counter: Arc<Counter>) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            received_tx,
            counter,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Converges the pool to `count` sessions. Growth is paced: each
    /// one-second tick admits up to `per_second` dials in parallel, each
    /// smeared by a random 0-1000 ms delay. Dial failures are counted and
    /// skipped. Shrinking closes and drops the tail of the list.
    pub async fn ensure_connections(
        &self,
        count: usize,
        per_second: usize,
        connector: &Connector,
    ) -> BenchResult<()> {
        let mut sessions = self.sessions.lock().await;

        if count >= sessions.len() {
            let mut remaining = count - sessions.len();
            let per_second = per_second.max(1);
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            while remaining > 0 {
                ticker.tick().await;
                let batch = remaining.min(per_second);
                let mut dials = JoinSet::new();
                for _ in 0..batch {
                    let connector = connector.clone();
                    let received = self.received_tx.clone();
                    let counter = Arc::clone(&self.counter);
                    dials.spawn(async move {
                        let jitter = rand::thread_rng().gen_range(0..1000u64);
                        tokio::time::sleep(Duration::from_millis(jitter)).await;
                        connector.open(received, counter).await
                    });
                }
                while let Some(dialed) = dials.join_next().await {
                    match dialed {
                        Ok(Ok(session)) => sessions.push(session),
                        Ok(Err(err)) => warn!(error = %err, "failed to build connection"),
                        Err(err) => warn!(error = %err, "connection task failed"),
                    }
                }
                remaining -= batch;
            }
        } else {
            info!(
                "reducing session count from {} to {}",
                sessions.len(),
                count
            );
            let extra = sessions.split_off(count);
            for session in extra {
                session.close().await;
            }
        }

        Ok(())
    }

    /// Stops any current sending, then installs a fresh generator on
    /// `clients` sessions picked uniformly at random.
    pub async fn install_generators<F>(&self, clients: usize, make: F) -> BenchResult<()>
    where
        F: Fn(&Session) -> MessageGenerator,
    {
        let sessions = self.sessions.lock().await;
        stop_all(&sessions).await;

        let bound = clients.min(sessions.len());
        let mut indices: Vec<usize> = (0..sessions.len()).collect();
        indices.shuffle(&mut rand::thread_rng());
        for &index in indices.iter().take(bound) {
            let generator = make(&sessions[index]);
            sessions[index].install_generator(generator).await;
        }
        Ok(())
    }

    /// Removes the generator from every session; connections stay up.
    pub async fn stop_send(&self) {
        let sessions = self.sessions.lock().await;
        stop_all(&sessions).await;
    }

    /// Assigns a fresh group id to each consecutive block of
    /// `members_per_group` sessions (in shuffled order) and sends one
    /// join frame per session.
    pub async fn join_groups<F>(&self, members_per_group: usize, make_frame: F) -> BenchResult<()>
    where
        F: Fn(&str) -> BenchResult<Message>,
    {
        if members_per_group == 0 {
            return Err(BenchError::invalid_command(
                "members per group must be positive",
            ));
        }

        let mut sessions = self.sessions.lock().await;
        stop_all(&sessions).await;

        let mut indices: Vec<usize> = (0..sessions.len()).collect();
        indices.shuffle(&mut rand::thread_rng());
        let mut group = String::new();
        for (position, &index) in indices.iter().enumerate() {
            if position % members_per_group == 0 {
                group = short_id();
            }
            let frame = make_frame(&group)?;
            sessions[index].group_name = Some(group.clone());
            if let Err(err) = sessions[index].write_message(frame).await {
                warn!(client = %sessions[index].id, error = %err, "failed to send join frame");
            }
        }
        Ok(())
    }

    /// Sends one leave frame per session that has a stored group name,
    /// clearing it.
    pub async fn leave_groups<F>(&self, make_frame: F) -> BenchResult<()>
    where
        F: Fn(&str) -> BenchResult<Message>,
    {
        let mut sessions = self.sessions.lock().await;
        stop_all(&sessions).await;

        for session in sessions.iter_mut() {
            let Some(group) = session.group_name.take() else {
                continue;
            };
            let frame = make_frame(&group)?;
            if let Err(err) = session.write_message(frame).await {
                warn!(client = %session.id, error = %err, "failed to send leave frame");
            }
        }
        Ok(())
    }
}

async fn stop_all(sessions: &[Session]) {
    for session in sessions {
        session.remove_generator().await;
    }
}
