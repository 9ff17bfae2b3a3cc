//! Single writer per identity. Webhook handlers enqueue and return at once; a
//! router task hands each message to the lane for its sender, and a lane
//! handles its messages strictly in arrival order.

use crate::conversation::ConversationEngine;
use crate::models::{ApiError, InboundMessage};
use crate::ports::mask_phone;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, warn};

const LANE_IDLE: Duration = Duration::from_secs(60);
const PRUNE_THRESHOLD: usize = 256;

#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, message: InboundMessage);
}

#[async_trait]
impl InboundHandler for ConversationEngine {
    async fn handle(&self, message: InboundMessage) {
        ConversationEngine::handle(self, message).await;
    }
}

#[derive(Clone)]
pub struct InboundQueue {
    tx: mpsc::Sender<InboundMessage>,
}

struct Lane {
    tx: mpsc::UnboundedSender<InboundMessage>,
    handle: JoinHandle<()>,
}

impl InboundQueue {
    pub fn spawn<H: InboundHandler>(handler: H) -> (Self, JoinHandle<()>) {
        Self::spawn_with_idle(Arc::new(handler), LANE_IDLE)
    }

    fn spawn_with_idle<H: InboundHandler>(
        handler: Arc<H>,
        idle: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(queue_capacity_from_env());

        let handle = tokio::spawn(async move {
            let mut lanes: HashMap<String, Lane> = HashMap::new();
            while let Some(message) = rx.recv().await {
                if lanes.len() > PRUNE_THRESHOLD {
                    lanes.retain(|_, lane| !lane.handle.is_finished());
                }
                let phone = message.from.clone();
                let message = match lanes.get(&phone) {
                    Some(lane) => match lane.tx.send(message) {
                        Ok(()) => continue,
                        Err(mpsc::error::SendError(message)) => message,
                    },
                    None => message,
                };
                // The previous lane (if any) went idle; its successor waits for
                // it so queued messages keep their order.
                let previous = lanes.remove(&phone).map(|lane| lane.handle);
                let lane = spawn_lane(handler.clone(), phone.clone(), previous, idle);
                if lane.tx.send(message).is_err() {
                    warn!(target = "closet.api", phone = %mask_phone(&phone), "lane_rejected_message");
                }
                lanes.insert(phone, lane);
            }
            for (_, lane) in lanes.drain() {
                drop(lane.tx);
                let _ = lane.handle.await;
            }
        });

        (Self { tx }, handle)
    }

    pub async fn enqueue(&self, message: InboundMessage) -> Result<(), ApiError> {
        self.tx.send(message).await.map_err(|_| ApiError {
            error: "queue_send_failed".into(),
            detail: Some("worker not available".into()),
        })
    }
}

fn spawn_lane<H: InboundHandler>(
    handler: Arc<H>,
    phone: String,
    previous: Option<JoinHandle<()>>,
    idle: Duration,
) -> Lane {
    let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
    let handle = tokio::spawn(async move {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        loop {
            match timeout(idle, rx.recv()).await {
                Ok(Some(message)) => handler.handle(message).await,
                Ok(None) => break,
                Err(_) => {
                    rx.close();
                    while let Some(message) = rx.recv().await {
                        handler.handle(message).await;
                    }
                    debug!(target = "closet.api", phone = %mask_phone(&phone), "lane_idle_closed");
                    break;
                }
            }
        }
    });
    Lane { tx, handle }
}

fn queue_capacity_from_env() -> usize {
    crate::config::env_parse::<usize>("QUEUE_CAPACITY")
        .filter(|v| *v > 0)
        .unwrap_or(256)
}
