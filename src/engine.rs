//! Engine runtime: consumes bus topics and drives the alert pipeline.
//!
//! One consumer task per chain topic plus a periodic expiry sweeper. Each
//! message runs the full pipeline (decode, resolve, authorize, charge,
//! deliver) before its cursor is committed; errors that mean the work was
//! not durably applied hold the commit back so the bus redelivers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::billing::NotificationPolicy;
use crate::bus::{decode_event, AlertEvent, BusClient, BusEvent, BusStream};
use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::errors::{EngineError, Result};
use crate::resolver::AddressResolver;
use crate::store::{BillingStore, ChargeOutcome, TrackerStore};
use crate::types::Blockchain;
use crate::watch::WatchProtocol;

/// The message-handling pipeline, independent of any consumer loop.
pub struct EngineCore {
    resolver: AddressResolver,
    policy: NotificationPolicy,
    dispatcher: Arc<Dispatcher>,
    watch: Arc<WatchProtocol>,
    chains: HashMap<u16, Blockchain>,
}

impl EngineCore {
    pub fn new(
        tracker: Arc<dyn TrackerStore>,
        billing: Arc<dyn BillingStore>,
        bus: Arc<dyn BusClient>,
        dispatcher: Arc<Dispatcher>,
        templates: Arc<crate::messages::MessageTemplates>,
        config: &EngineConfig,
    ) -> Self {
        let watch = Arc::new(WatchProtocol::new(
            tracker.clone(),
            bus,
            dispatcher.clone(),
            templates,
            config,
        ));
        Self {
            resolver: AddressResolver::new(tracker),
            policy: NotificationPolicy::new(billing),
            dispatcher,
            watch,
            chains: config
                .chains
                .iter()
                .map(|c| (c.id, Blockchain::from(c)))
                .collect(),
        }
    }

    /// The watch-request entry point, for the bot surface driving this
    /// engine.
    pub fn watch(&self) -> &Arc<WatchProtocol> {
        &self.watch
    }

    /// Handle one raw bus payload end to end. `Ok` means the cursor may be
    /// committed.
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<()> {
        match decode_event(payload)? {
            BusEvent::Alert(event) => self.handle_alert(&event).await,
            BusEvent::WatchConfirmed {
                cluster_id,
                blockchain,
                wallet,
            } => {
                self.watch
                    .handle_outcome(cluster_id, &wallet, blockchain, true)
                    .await
            }
            BusEvent::WatchRejected {
                cluster_id,
                blockchain,
                wallet,
            } => {
                self.watch
                    .handle_outcome(cluster_id, &wallet, blockchain, false)
                    .await
            }
        }
    }

    async fn handle_alert(&self, event: &AlertEvent) -> Result<()> {
        let chain = self.chains.get(&event.blockchain).ok_or_else(|| {
            EngineError::ProtocolViolation(format!("alert for unknown chain {}", event.blockchain))
        })?;
        let resolved = match self.resolver.resolve_alert(&event.wallet, event.blockchain).await {
            Ok(resolved) => resolved,
            Err(e) if e.is_benign() => {
                debug!(wallet = %event.wallet, chain = %chain.tag, "alert for untracked wallet dropped");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for tx in &event.transactions {
            // Chats already served for this transaction. Two links of the
            // same user sharing a chat must not double-post there.
            let mut claimed: HashSet<i64> = HashSet::new();
            for sub in &resolved.subscriptions {
                if !self.policy.authorize(sub) {
                    debug!(link_id = sub.link_id, "link not authorized, skipped");
                    continue;
                }
                let chats: Vec<i64> = sub
                    .chats
                    .iter()
                    .copied()
                    .filter(|c| !claimed.contains(c))
                    .collect();
                // Every chat already served by an earlier link; nothing to
                // deliver, so nothing to charge.
                if chats.is_empty() {
                    continue;
                }
                match self
                    .policy
                    .charge(sub, event.blockchain, &event.wallet, tx)
                    .await?
                {
                    ChargeOutcome::Denied => {
                        debug!(link_id = sub.link_id, "charge denied, alert skipped");
                        continue;
                    }
                    // Duplicate means a bus redelivery already paid for this
                    // pair; the send is repeated, the charge is not.
                    ChargeOutcome::Charged(_) | ChargeOutcome::Duplicate => {
                        claimed.extend(&chats);
                        self.dispatcher
                            .deliver(chain, event, tx, sub, &chats)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Running engine: consumer tasks plus the expiry sweeper.
pub struct Engine {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl Engine {
    /// Subscribe to every configured chain topic and start consuming.
    pub async fn start(
        core: Arc<EngineCore>,
        bus: Arc<dyn BusClient>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();

        for chain in &config.chains {
            let stream = bus.subscribe(&chain.tag).await?;
            info!(topic = %chain.tag, "consuming chain topic");
            tasks.push(tokio::spawn(run_topic(
                core.clone(),
                bus.clone(),
                stream,
                chain.tag.clone(),
                shutdown.subscribe(),
            )));
        }

        tasks.push(tokio::spawn(run_sweeper(
            core.clone(),
            Duration::from_secs(config.watch.sweep_interval_secs),
            shutdown.subscribe(),
        )));

        Ok(Self {
            shutdown,
            tasks,
            grace: Duration::from_millis(config.delivery.shutdown_grace_ms),
        })
    }

    /// Signal shutdown and wait for in-flight work, up to the grace period.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if tokio::time::timeout(self.grace, task).await.is_err() {
                warn!("consumer task did not stop within grace period");
            }
        }
        info!("engine stopped");
    }
}

async fn run_topic(
    core: Arc<EngineCore>,
    bus: Arc<dyn BusClient>,
    mut stream: Box<dyn BusStream>,
    topic: String,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => break,
            message = stream.next() => message,
        };
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %topic, error = %e, "bus read failed, backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        // Retry in place while the failure means the work was not applied;
        // committing would lose the message.
        let mut backoff = Duration::from_millis(500);
        loop {
            match core.handle_payload(&message.payload).await {
                Ok(()) => {
                    if let Err(e) = bus.commit(&message.cursor).await {
                        warn!(topic = %topic, error = %e, "commit failed, message will redeliver");
                    }
                    break;
                }
                Err(e) if e.blocks_commit() => {
                    e.log();
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
                // Malformed or contradictory message; redelivering it would
                // fail the same way forever. Log and drop.
                Err(e) => {
                    e.log();
                    if let Err(e) = bus.commit(&message.cursor).await {
                        warn!(topic = %topic, error = %e, "commit failed, message will redeliver");
                    }
                    break;
                }
            }
        }
    }
    debug!(topic = %topic, "consumer stopped");
}

async fn run_sweeper(
    core: Arc<EngineCore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        match core.watch().sweep_expired().await {
            Ok(0) => {}
            Ok(n) => info!(expired = n, "retired expired watch requests"),
            Err(e) => error!(error = %e, "expiry sweep failed"),
        }
    }
}
