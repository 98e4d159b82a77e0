//! Tokio driver for the provisioner
//!
//! One task owns the [`MeshProvisioner`]. Transport events, scan results and
//! user intents reach it through a single `mpsc` queue, and the task sleeps
//! until the next timer deadline in between, so every input is applied on one
//! serialized path. Outputs are executed against the platform [`TransportLink`]
//! and [`Scanner`] and notifications are broadcast to subscribers.

use crate::config::ProvisionerSettings;
use crate::events::{CoreEvent, Output};
use crate::model::{AuthMethod, DeviceRef, MeshAddress, MeshNetwork};
use crate::provisioner::{Input, LinkState, MeshProvisioner};
use crate::provisioning::{ConfigStep, ProvisioningState};
use crate::proxy::FilterType;
use crate::transport::{Advertisement, LinkCommand, LinkEvent, ScanCommand, Scanner, TransportLink};
use crate::CoreError;
use anyhow::Context;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_QUEUE_SIZE: usize = 256;
const EVENT_BUFFER_SIZE: usize = 256;

type Intent = Box<dyn FnOnce(&mut MeshProvisioner) + Send>;

enum Message {
    Input(Input),
    Intent(Intent),
    Shutdown,
}

/// Latest provisioner state, readable without a round trip to the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: Option<ProvisioningState>,
    pub link: LinkState,
    pub filter_type: Option<FilterType>,
    pub filtered_addresses: Vec<MeshAddress>,
    pub proxy_address: Option<MeshAddress>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: None,
            link: LinkState::Disconnected,
            filter_type: None,
            filtered_addresses: Vec::new(),
            proxy_address: None,
        }
    }
}

/// Start the driver task for `provisioner`
pub fn spawn(
    provisioner: MeshProvisioner,
    link: Arc<dyn TransportLink>,
    scanner: Arc<dyn Scanner>,
) -> ProvisionerHandle {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
    let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
    let snapshot = Arc::new(RwLock::new(Snapshot::default()));

    let driver = Driver {
        provisioner,
        link,
        scanner,
        events: events.clone(),
        snapshot: snapshot.clone(),
        started: Instant::now(),
    };
    tokio::spawn(driver.run(rx));

    ProvisionerHandle {
        tx,
        events,
        snapshot,
    }
}

/// Platform callbacks into the driver
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Message>,
}

impl EventSink {
    pub async fn link_event(&self, event: LinkEvent) -> Result<(), CoreError> {
        self.send(Input::Link(event)).await
    }

    pub async fn advertisement(&self, advertisement: Advertisement) -> Result<(), CoreError> {
        self.send(Input::Advertisement(advertisement)).await
    }

    pub async fn lower_transport_failed(
        &self,
        src: MeshAddress,
        incomplete_timer_expired: bool,
    ) -> Result<(), CoreError> {
        self.send(Input::LowerTransportFailed {
            src,
            incomplete_timer_expired,
        })
        .await
    }

    /// Non-async variant for platform threads; fails when the queue is full
    pub fn try_link_event(&self, event: LinkEvent) -> Result<(), CoreError> {
        self.tx
            .try_send(Message::Input(Input::Link(event)))
            .map_err(|_| CoreError::Stopped)
    }

    async fn send(&self, input: Input) -> Result<(), CoreError> {
        self.tx
            .send(Message::Input(input))
            .await
            .map_err(|_| CoreError::Stopped)
    }
}

/// Cloneable handle to a running provisioner
#[derive(Clone)]
pub struct ProvisionerHandle {
    tx: mpsc::Sender<Message>,
    events: broadcast::Sender<CoreEvent>,
    snapshot: Arc<RwLock<Snapshot>>,
}

impl ProvisionerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn event_sink(&self) -> EventSink {
        EventSink {
            tx: self.tx.clone(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    pub async fn select_device(&self, device: DeviceRef) -> Result<(), CoreError> {
        self.call(move |p| p.select_device(device)).await
    }

    pub async fn start_provisioning(&self, choice: Option<AuthMethod>) -> Result<AuthMethod, CoreError> {
        self.call(move |p| p.start_provisioning(choice)).await
    }

    pub async fn submit_authentication(&self, value: impl Into<String>) -> Result<(), CoreError> {
        let value = value.into();
        self.call(move |p| p.submit_authentication(&value)).await
    }

    pub async fn cancel_session(&self) -> Result<(), CoreError> {
        self.call(|p| {
            p.cancel_session();
            Ok(())
        })
        .await
    }

    pub async fn resume_configuration(&self) -> Result<ConfigStep, CoreError> {
        self.call(|p| p.resume_configuration()).await
    }

    pub async fn connect_node(&self) -> Result<(), CoreError> {
        self.call(|p| p.connect_node()).await
    }

    pub async fn connect_proxy(&self, device: DeviceRef) -> Result<(), CoreError> {
        self.call(move |p| p.connect_proxy(device)).await
    }

    pub async fn set_proxy_filter_type(&self, filter_type: FilterType) -> Result<(), CoreError> {
        self.call(move |p| p.set_proxy_filter_type(filter_type)).await
    }

    pub async fn add_filter_addresses(&self, addresses: Vec<MeshAddress>) -> Result<(), CoreError> {
        self.call(move |p| p.add_filter_addresses(&addresses)).await
    }

    pub async fn remove_filter_addresses(&self, addresses: Vec<MeshAddress>) -> Result<(), CoreError> {
        self.call(move |p| p.remove_filter_addresses(&addresses)).await
    }

    pub async fn clear_filter_addresses(&self) -> Result<bool, CoreError> {
        self.call(|p| p.clear_filter_addresses()).await
    }

    pub async fn disable_proxy_filter(&self) -> Result<(), CoreError> {
        self.call(|p| p.disable_proxy_filter()).await
    }

    pub async fn update_network(&self, network: MeshNetwork) -> Result<(), CoreError> {
        self.call(move |p| {
            p.update_network(network);
            Ok(())
        })
        .await
    }

    pub async fn update_settings(&self, settings: ProvisionerSettings) -> Result<(), CoreError> {
        self.call(move |p| p.update_settings(settings)).await
    }

    /// Stop the driver; pending intents fail with `Stopped`
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown).await;
    }

    async fn call<R, F>(&self, f: F) -> Result<R, CoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut MeshProvisioner) -> Result<R, CoreError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let intent: Intent = Box::new(move |provisioner| {
            let _ = reply_tx.send(f(provisioner));
        });
        self.tx
            .send(Message::Intent(intent))
            .await
            .map_err(|_| CoreError::Stopped)?;
        reply_rx.await.map_err(|_| CoreError::Stopped)?
    }
}

struct Driver {
    provisioner: MeshProvisioner,
    link: Arc<dyn TransportLink>,
    scanner: Arc<dyn Scanner>,
    events: broadcast::Sender<CoreEvent>,
    snapshot: Arc<RwLock<Snapshot>>,
    started: Instant,
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        info!("Provisioner driver started");

        loop {
            let deadline = self
                .provisioner
                .next_deadline()
                .map(|ms| self.started + Duration::from_millis(ms));
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                message = rx.recv() => {
                    let now = self.now_ms();
                    match message {
                        Some(Message::Input(input)) => self.provisioner.apply(input, now),
                        Some(Message::Intent(intent)) => {
                            self.provisioner.apply(Input::Tick, now);
                            intent(&mut self.provisioner);
                        }
                        Some(Message::Shutdown) | None => break,
                    }
                }
                _ = timer => {
                    let now = self.now_ms();
                    self.provisioner.apply(Input::Tick, now);
                }
            }

            self.flush().await;
        }

        self.provisioner.cancel_session();
        self.flush().await;
        info!("Provisioner driver stopped");
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Execute outputs until the provisioner has nothing more to say.
    /// Command failures are fed back as link events and may produce more.
    async fn flush(&mut self) {
        loop {
            let outputs = self.provisioner.drain_outputs();
            if outputs.is_empty() {
                break;
            }
            for output in outputs {
                match output {
                    Output::Link(command) => {
                        let connecting = matches!(command, LinkCommand::Connect(_));
                        let sending = matches!(command, LinkCommand::Send(_));
                        if let Err(e) = self.execute_link(command).await {
                            warn!("Link command failed: {:#}", e);
                            let feedback = if connecting {
                                Some(LinkEvent::ConnectFailed {
                                    reason: format!("{:#}", e),
                                })
                            } else if sending {
                                Some(LinkEvent::LinkLoss)
                            } else {
                                None
                            };
                            if let Some(event) = feedback {
                                let now = self.now_ms();
                                self.provisioner.apply(Input::Link(event), now);
                            }
                        }
                    }
                    Output::Scan(command) => {
                        if let Err(e) = self.execute_scan(command).await {
                            warn!("Scan command failed: {:#}", e);
                        }
                    }
                    Output::Notify(event) => {
                        // no subscribers is fine
                        let _ = self.events.send(event);
                    }
                }
            }
        }
        self.refresh_snapshot();
    }

    async fn execute_link(&self, command: LinkCommand) -> anyhow::Result<()> {
        debug!("Executing {}", command);
        match command {
            LinkCommand::Connect(device) => self
                .link
                .connect(&device)
                .await
                .with_context(|| format!("connect to {}", device)),
            LinkCommand::Disconnect => self.link.disconnect().await.context("disconnect"),
            LinkCommand::Send(data) => {
                let len = data.len();
                self.link
                    .send(data)
                    .await
                    .with_context(|| format!("send {} byte(s)", len))
            }
        }
    }

    async fn execute_scan(&self, command: ScanCommand) -> anyhow::Result<()> {
        match command {
            ScanCommand::Start { service } => self
                .scanner
                .start_scan(service)
                .await
                .with_context(|| format!("start scan for {}", service)),
            ScanCommand::Stop => self.scanner.stop_scan().await.context("stop scan"),
        }
    }

    fn refresh_snapshot(&self) {
        let (filter_type, filtered_addresses) = self.provisioner.filter().snapshot();
        let mut snapshot = self.snapshot.write();
        snapshot.state = self.provisioner.session().map(|s| s.state());
        snapshot.link = self.provisioner.link_state();
        snapshot.filter_type = filter_type;
        snapshot.filtered_addresses = filtered_addresses;
        snapshot.proxy_address = self.provisioner.filter().proxy_address();
    }
}
