//! Mesh provisioner
//!
//! Owns the provisioning session, the proxy filter manager, the reconnection
//! supervisor, the timers and the pending transactions. Every transport event,
//! scan result and timer expiry enters through [`MeshProvisioner::apply`];
//! user intents are plain methods that validate synchronously. Nothing here
//! performs I/O: commands for the link and scanner and notifications for the
//! UI are queued as [`Output`]s and drained by the caller in order.

use crate::bookkeeping::{TimerId, TimerQueue, TransactionFailure, TransactionKey, TransactionTracker};
use crate::config::ProvisionerSettings;
use crate::events::{CoreEvent, FailureKind, Output, ReconnectOutcome};
use crate::model::address::UNASSIGNED_ADDRESS;
use crate::model::{AuthMethod, DeviceRef, MeshAddress, MeshNetwork};
use crate::provisioning::{
    Action, ConfigStep, Direction, ProtocolError, ProvisioningFlow, ProvisioningState, Session,
    StepOutcome,
};
use crate::proxy::{FilterType, ProxyFilterManager, StatusOutcome};
use crate::reconnect::{ReconnectAction, ReconnectPhase, ReconnectPolicy, ReconnectTimer, ReconnectionSupervisor};
use crate::transport::{
    Advertisement, Decoded, LinkCommand, LinkEvent, MeshCodec, MeshMessage, MeshPdu, ScanCommand,
};
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Everything that can happen to the provisioner from the outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Link(LinkEvent),
    Advertisement(Advertisement),
    /// The lower transport gave up on a message from `src`
    LowerTransportFailed {
        src: MeshAddress,
        incomplete_timer_expired: bool,
    },
    /// Only advances the clock
    Tick,
}

/// What the GATT link is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bearer {
    Provisioning,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting(Bearer),
    Ready(Bearer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Transaction,
    Reconnect(ReconnectTimer),
}

pub struct MeshProvisioner {
    codec: Arc<dyn MeshCodec>,
    settings: ProvisionerSettings,
    network: MeshNetwork,
    session: Option<Session>,
    filter: ProxyFilterManager,
    supervisor: ReconnectionSupervisor,
    timers: TimerQueue<TimerKind>,
    transactions: TransactionTracker,
    link: LinkState,
    mtu: Option<u16>,
    now_ms: u64,
    outputs: VecDeque<Output>,
}

impl MeshProvisioner {
    /// Fails when `settings` do not validate
    pub fn new(
        codec: Arc<dyn MeshCodec>,
        settings: ProvisionerSettings,
        network: MeshNetwork,
    ) -> Result<Self, CoreError> {
        settings.validate()?;
        let policy = ReconnectPolicy::from(&settings);
        Ok(Self {
            codec,
            settings,
            network,
            session: None,
            filter: ProxyFilterManager::new(),
            supervisor: ReconnectionSupervisor::new(policy),
            timers: TimerQueue::new(),
            transactions: TransactionTracker::new(),
            link: LinkState::Disconnected,
            mtu: None,
            now_ms: 0,
            outputs: VecDeque::new(),
        })
    }

    pub fn settings(&self) -> &ProvisionerSettings {
        &self.settings
    }

    pub fn network(&self) -> &MeshNetwork {
        &self.network
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn filter(&self) -> &ProxyFilterManager {
        &self.filter
    }

    pub fn reconnect_phase(&self) -> &ReconnectPhase {
        self.supervisor.phase()
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Earliest pending timer deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    /// Pending outputs, oldest first
    pub fn drain_outputs(&mut self) -> Vec<Output> {
        self.outputs.drain(..).collect()
    }

    /// The single entry point for transport events, scan results and time
    pub fn apply(&mut self, input: Input, now_ms: u64) {
        self.advance_clock(now_ms);
        match input {
            Input::Link(event) => self.on_link_event(event),
            Input::Advertisement(advertisement) => {
                let actions = self
                    .supervisor
                    .on_advertisement(&advertisement, self.codec.as_ref());
                self.run_reconnect(actions);
            }
            Input::LowerTransportFailed {
                src,
                incomplete_timer_expired,
            } => self.on_lower_transport_failed(src, incomplete_timer_expired),
            Input::Tick => {}
        }
    }

    // ------------------------------------------------------------------
    // Intents
    // ------------------------------------------------------------------

    /// Open a session for an unprovisioned device and connect to it
    pub fn select_device(&mut self, device: DeviceRef) -> Result<(), CoreError> {
        if let Some(session) = &self.session {
            if !session.state().is_terminal() {
                return Err(CoreError::SessionActive);
            }
        }

        self.teardown();
        info!("Selected {}", device);
        self.session = Some(Session::new(device.clone(), self.now_ms));
        self.publish_state(ProvisioningState::Discovered);
        self.link = LinkState::Connecting(Bearer::Provisioning);
        self.push(Output::Link(LinkCommand::Connect(device)));
        Ok(())
    }

    /// Choose the authentication method and start provisioning.
    ///
    /// `choice` may be omitted when the device offers a single method.
    pub fn start_provisioning(&mut self, choice: Option<AuthMethod>) -> Result<AuthMethod, CoreError> {
        let state = self
            .session
            .as_ref()
            .map(|s| s.state())
            .ok_or(CoreError::NoSession)?;

        if self.network.provisioner_address.is_none() {
            if !state.is_terminal() {
                self.transition(ProvisioningState::ProvisionerUnassigned, Direction::Local);
                self.teardown();
            }
            warn!("Provisioner has no unicast address assigned");
            return Err(CoreError::ProvisionerUnassigned);
        }
        if state != ProvisioningState::CapabilitiesReceived {
            return Err(CoreError::InvalidState {
                state,
                operation: "start provisioning",
            });
        }
        if self.network.primary_net_key().is_none() {
            return Err(CoreError::NoNetworkKey);
        }

        let selected = self
            .with_flow(|flow, session| flow.select_method(session, choice))
            .ok_or(CoreError::NoSession)?
            .map_err(CoreError::from);
        let method = self.reject_invalid(selected)?;
        let now = self.now_ms;
        let result = self.with_flow(|flow, session| flow.start(session, method, now));
        self.run_flow(result);
        Ok(method)
    }

    /// Static or Output OOB value entered by the user
    pub fn submit_authentication(&mut self, input: &str) -> Result<(), CoreError> {
        let session = self.session.as_ref().ok_or(CoreError::NoSession)?;
        let state = session.state();
        let waiting_for_user = state == ProvisioningState::AuthenticationWaiting
            && !session.confirmation_sent
            && session.method.map_or(false, |m| m.needs_user_value());
        if !waiting_for_user {
            return Err(CoreError::InvalidState {
                state,
                operation: "submit authentication",
            });
        }

        let submitted = self
            .with_flow(|flow, session| flow.submit_authentication(session, input))
            .ok_or(CoreError::NoSession)?
            .map_err(CoreError::from);
        let actions = self.reject_invalid(submitted)?;
        self.run_flow(Some(Ok(actions)));
        Ok(())
    }

    /// Drop the session and everything attached to it
    pub fn cancel_session(&mut self) {
        info!("Cancelling session");
        self.teardown();
        if self.session.take().is_some() {
            self.notify(CoreEvent::SessionClosed);
        }
    }

    /// Re-issue the configuration step abandoned after a timeout or link loss
    pub fn resume_configuration(&mut self) -> Result<ConfigStep, CoreError> {
        let session = self.session.as_ref().ok_or(CoreError::NoSession)?;
        let step = session.abandoned_step.ok_or(CoreError::NothingToResume)?;
        if self.link != LinkState::Ready(Bearer::Proxy) {
            return Err(CoreError::NotConnected);
        }

        let include_app_key = self.network.selected_app_key().is_some();
        if let Some(session) = self.session.as_mut() {
            session.abandoned_step = None;
            session.requeue_from(step, include_app_key);
        }
        info!("Resuming configuration at {}", step);
        self.issue_next_step();
        Ok(step)
    }

    /// Scan for the session's node and attach to it as a proxy
    pub fn connect_node(&mut self) -> Result<(), CoreError> {
        let session = self.session.as_ref().ok_or(CoreError::NoSession)?;
        let node = session.node.clone().ok_or(CoreError::InvalidState {
            state: session.state(),
            operation: "connect to node",
        })?;
        let device = session.device().clone();
        if self.link != LinkState::Disconnected || self.supervisor.is_active() {
            return Err(CoreError::LinkBusy);
        }

        let mut actions = self.supervisor.reset();
        actions.extend(self.supervisor.trigger(node, device));
        self.run_reconnect(actions);
        Ok(())
    }

    /// Attach to any proxy node, e.g. to manage its filter outside a session
    pub fn connect_proxy(&mut self, device: DeviceRef) -> Result<(), CoreError> {
        if self.link != LinkState::Disconnected || self.supervisor.is_active() {
            return Err(CoreError::LinkBusy);
        }
        if let Some(session) = &self.session {
            if session.state().is_pre_complete() {
                return Err(CoreError::SessionActive);
            }
        }
        info!("Connecting to proxy {}", device);
        self.link = LinkState::Connecting(Bearer::Proxy);
        self.push(Output::Link(LinkCommand::Connect(device)));
        Ok(())
    }

    pub fn set_proxy_filter_type(&mut self, filter_type: FilterType) -> Result<(), CoreError> {
        let message = self.filter.set_filter_type(filter_type)?;
        self.send_proxy_configuration(message)
    }

    pub fn add_filter_addresses(&mut self, addresses: &[MeshAddress]) -> Result<(), CoreError> {
        let requested = self.filter.add_addresses(addresses).map_err(CoreError::from);
        let message = self.reject_invalid(requested)?;
        self.send_proxy_configuration(message)
    }

    pub fn remove_filter_addresses(&mut self, addresses: &[MeshAddress]) -> Result<(), CoreError> {
        let requested = self.filter.remove_addresses(addresses).map_err(CoreError::from);
        let message = self.reject_invalid(requested)?;
        self.send_proxy_configuration(message)
    }

    /// Returns false when there was nothing confirmed to clear
    pub fn clear_filter_addresses(&mut self) -> Result<bool, CoreError> {
        match self.filter.clear_all()? {
            Some(message) => self.send_proxy_configuration(message).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn disable_proxy_filter(&mut self) -> Result<(), CoreError> {
        let message = self.filter.disable()?;
        self.send_proxy_configuration(message)
    }

    /// Replace the network snapshot (keys or nodes changed above us)
    pub fn update_network(&mut self, network: MeshNetwork) {
        self.network = network;
    }

    pub fn update_settings(&mut self, settings: ProvisionerSettings) -> Result<(), CoreError> {
        let validated = settings.validate().map_err(CoreError::from);
        self.reject_invalid(validated)?;
        self.supervisor.set_policy(ReconnectPolicy::from(&settings));
        self.settings = settings;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Serialized input path
    // ------------------------------------------------------------------

    fn advance_clock(&mut self, now_ms: u64) {
        self.now_ms = self.now_ms.max(now_ms);
        loop {
            let expired = self.timers.pop_expired(self.now_ms);
            if expired.is_empty() {
                break;
            }
            for (id, kind) in expired {
                self.on_timer(id, kind);
            }
        }
    }

    fn on_timer(&mut self, id: TimerId, kind: TimerKind) {
        match kind {
            TimerKind::Transaction => {
                if let Some(transaction) = self.transactions.expire(id) {
                    self.on_transaction_failed(transaction.key.dst, transaction.failure_on_expiry());
                }
            }
            TimerKind::Reconnect(timer) => {
                let actions = self.supervisor.on_timer(timer);
                self.run_reconnect(actions);
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        debug!("Link event {} in {:?}", event, self.link);
        match event {
            LinkEvent::Ready => self.on_link_ready(),
            LinkEvent::ConnectFailed { reason } => self.on_connect_failed(reason),
            LinkEvent::MtuNegotiated(mtu) => self.mtu = Some(mtu),
            LinkEvent::DataReceived(data) => self.on_data(data),
            event if event.is_disconnect() => {
                let reason = if event == LinkEvent::LinkLoss {
                    "Link lost"
                } else {
                    "Disconnected"
                };
                self.on_link_down(reason);
            }
            _ => {}
        }
    }

    fn on_link_ready(&mut self) {
        match self.link {
            LinkState::Connecting(Bearer::Provisioning) => {
                self.link = LinkState::Ready(Bearer::Provisioning);
                let discovered = self
                    .session
                    .as_ref()
                    .map_or(false, |s| s.state() == ProvisioningState::Discovered);
                if discovered {
                    let now = self.now_ms;
                    let result = self.with_flow(|flow, session| flow.invite(session, now));
                    self.run_flow(result);
                }
            }
            LinkState::Connecting(Bearer::Proxy) => {
                self.link = LinkState::Ready(Bearer::Proxy);
                self.filter.on_connected();
                let actions = self.supervisor.on_connected();
                self.run_reconnect(actions);
                self.issue_next_step();
            }
            other => debug!("Ready ignored in {:?}", other),
        }
    }

    fn on_link_down(&mut self, reason: &str) {
        let previous = self.link;
        self.link = LinkState::Disconnected;
        if previous == LinkState::Disconnected {
            debug!("{} on a closed link", reason);
            return;
        }
        if previous == LinkState::Connecting(Bearer::Proxy) && self.supervisor.is_connecting() {
            let actions = self.supervisor.on_connect_failed();
            self.run_reconnect(actions);
            return;
        }

        if self.filter.on_disconnected() {
            self.notify_filter();
        }
        for transaction in self.transactions.clear() {
            self.timers.cancel(transaction.deadline_timer);
        }

        let Some(state) = self.session.as_ref().map(|s| s.state()) else {
            return;
        };
        if state.is_pre_complete() && !state.is_terminal() {
            self.fail_session(FailureKind::Transport, reason.to_string(), Direction::Local);
            return;
        }

        let interrupted = self.session.as_mut().and_then(|session| {
            let step = session.active_step.take()?;
            session.abandoned_step = Some(step);
            Some(step)
        });
        if let Some(step) = interrupted {
            info!("{} interrupted by link loss", step);
            self.notify(CoreEvent::ConfigurationInterrupted { step });
        }
    }

    fn on_connect_failed(&mut self, reason: String) {
        let previous = self.link;
        self.link = LinkState::Disconnected;
        match previous {
            LinkState::Connecting(Bearer::Proxy) if self.supervisor.is_connecting() => {
                let actions = self.supervisor.on_connect_failed();
                self.run_reconnect(actions);
            }
            LinkState::Connecting(Bearer::Provisioning) => {
                self.fail_session(
                    FailureKind::Transport,
                    format!("Connection failed: {}", reason),
                    Direction::Local,
                );
            }
            LinkState::Connecting(Bearer::Proxy) => {
                self.notify(CoreEvent::Failure {
                    kind: FailureKind::Transport,
                    message: format!("Proxy connection failed: {}", reason),
                });
            }
            other => debug!("Connect failure ignored in {:?}", other),
        }
    }

    fn on_data(&mut self, data: Vec<u8>) {
        match self.link {
            LinkState::Ready(Bearer::Provisioning) => match self.codec.decode_provisioning(&data) {
                Ok(pdu) => {
                    let now = self.now_ms;
                    let result = self.with_flow(|flow, session| flow.on_pdu(session, pdu, now));
                    self.run_flow(result);
                }
                Err(e) => self.on_protocol_error(ProtocolError::Codec(e)),
            },
            LinkState::Ready(Bearer::Proxy) => match self.codec.decode_mesh(&data) {
                Ok(Decoded::Message(pdu)) => self.on_mesh_message(pdu),
                Ok(Decoded::Segment { src, .. }) => {
                    if !self.transactions.note_segment(src) {
                        debug!("Segment from {} with no transaction", src);
                    }
                }
                Ok(Decoded::Ignored) => {}
                Err(e) => {
                    warn!("Undecodable proxy PDU: {}", e);
                    self.notify(CoreEvent::Failure {
                        kind: FailureKind::Protocol,
                        message: e.to_string(),
                    });
                }
            },
            other => debug!("{} byte(s) ignored in {:?}", data.len(), other),
        }
    }

    fn on_mesh_message(&mut self, pdu: MeshPdu) {
        let MeshPdu { src, message, .. } = pdu;
        debug!("{} from {}", message, src);
        self.notify(CoreEvent::MeshMessageReceived {
            src,
            message: message.clone(),
        });

        match message {
            MeshMessage::ProxyFilterStatus {
                filter_type,
                list_size,
            } => self.on_filter_status(src, filter_type, list_size),
            message if message.is_proxy_configuration() => {
                debug!("{} from {} is not a status, ignored", message, src);
            }
            message => self.on_config_response(src, message),
        }
    }

    fn on_filter_status(&mut self, src: MeshAddress, filter_type: FilterType, list_size: u16) {
        let previous = self.filter.proxy_address();
        let outcome = self.filter.on_status(src, filter_type, list_size);
        if previous != Some(src) {
            self.notify(CoreEvent::ConnectedProxyAddress { address: src });
        }

        match outcome {
            StatusOutcome::Confirmed(_) => self.notify_filter(),
            StatusOutcome::Rejected {
                expected,
                filter_type,
                list_size,
            } => {
                self.notify(CoreEvent::Failure {
                    kind: FailureKind::Protocol,
                    message: format!(
                        "Proxy filter rejected: requested {} with {} address(es), proxy reports {} with {}",
                        expected.filter_type,
                        expected.addresses.len(),
                        filter_type,
                        list_size
                    ),
                });
                self.notify_filter();
            }
            StatusOutcome::Unsolicited => {
                if list_size == 0 {
                    self.notify_filter();
                }
            }
        }
    }

    fn on_config_response(&mut self, src: MeshAddress, message: MeshMessage) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(node_address) = session.node.as_ref().map(|n| n.range.primary()) else {
            return;
        };
        if src != node_address {
            debug!("{} from {} is not for this session", message, src);
            return;
        }
        let Some(step) = session.active_step.filter(|step| step.is_response(&message)) else {
            debug!("{} does not answer an outstanding step", message);
            return;
        };
        let Some(transaction) = self.transactions.resolve(src, message.opcode()) else {
            debug!("No transaction for {}", message);
            return;
        };
        self.timers.cancel(transaction.deadline_timer);
        if let Some(session) = self.session.as_mut() {
            session.active_step = None;
        }

        match self.with_flow(|flow, session| flow.on_config_status(session, step, message)) {
            Some(Ok(StepOutcome::Completed(step))) => {
                info!("{} completed", step);
                self.notify(CoreEvent::ConfigurationStepCompleted { step });
                self.issue_next_step();
            }
            Some(Ok(StepOutcome::Failed { step, status })) => {
                if let Some(session) = self.session.as_mut() {
                    session.abandoned_step = Some(step);
                }
                self.notify(CoreEvent::ConfigurationStepFailed { step, status });
                self.notify(CoreEvent::Failure {
                    kind: FailureKind::Protocol,
                    message: format!("{} failed with status 0x{:02X}", step, status),
                });
            }
            Some(Err(e)) => warn!("Configuration progress rejected: {}", e),
            None => {}
        }
    }

    fn on_lower_transport_failed(&mut self, src: MeshAddress, incomplete_timer_expired: bool) {
        let Some(step) = self.session.as_ref().and_then(|s| s.active_step) else {
            debug!("Lower transport failure from {} with no active step", src);
            return;
        };
        let key = TransactionKey {
            dst: src,
            opcode: step.request_opcode(),
        };
        let Some(transaction) = self.transactions.take(&key) else {
            debug!("Lower transport failure from {} is not for this session", src);
            return;
        };
        self.timers.cancel(transaction.deadline_timer);
        let reason = if incomplete_timer_expired || transaction.segments_seen > 0 {
            TransactionFailure::IncompleteSegments
        } else {
            TransactionFailure::Timeout
        };
        self.on_transaction_failed(src, reason);
    }

    fn on_transaction_failed(&mut self, dst: MeshAddress, reason: TransactionFailure) {
        let step = self.session.as_mut().and_then(|session| {
            let step = session.active_step.take();
            if step.is_some() {
                session.abandoned_step = step;
            }
            session.clear_pending_steps();
            step
        });
        warn!("Transaction to {} failed: {}", dst, reason);
        self.notify(CoreEvent::TransactionFailed { dst, step, reason });
        self.notify(CoreEvent::Failure {
            kind: FailureKind::Timeout,
            message: match step {
                Some(step) => format!("{} to {}: {}", step, dst, reason),
                None => format!("Transaction to {}: {}", dst, reason),
            },
        });
    }

    // ------------------------------------------------------------------
    // Configuration sequence
    // ------------------------------------------------------------------

    fn on_provisioning_complete(&mut self) {
        let include_app_key = self.network.selected_app_key().is_some();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.queue_configuration(include_app_key);
        let device = session.device().clone();
        let Some(node) = session.node.clone() else {
            return;
        };

        info!("Provisioned {} at {}", node.identity, node.range.primary());
        if self.network.node(&node.identity).is_none() {
            self.network.nodes.push(node.clone());
        }

        // the node drops the provisioning bearer and comes back as a proxy
        self.push(Output::Link(LinkCommand::Disconnect));
        self.link = LinkState::Disconnected;

        let actions = self.supervisor.trigger(node, device);
        self.run_reconnect(actions);
    }

    fn issue_next_step(&mut self) {
        if self.link != LinkState::Ready(Bearer::Proxy) {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.state().is_provisioned()
            || session.active_step.is_some()
            || session.abandoned_step.is_some()
        {
            return;
        }
        let Some(dst) = session.node.as_ref().map(|n| n.range.primary()) else {
            return;
        };

        match session.pending_steps.pop_front() {
            Some(step) => self.send_config_step(step, dst),
            None => self.finish_configuration(),
        }
    }

    fn send_config_step(&mut self, step: ConfigStep, dst: MeshAddress) {
        let request = ProvisioningFlow::new(self.codec.as_ref(), &self.network, &self.settings)
            .config_request(step);
        let Some(message) = request else {
            debug!("No application key, skipping {}", step);
            if let Some(session) = self.session.as_mut() {
                if let Err(e) = session.progress.skip_app_key() {
                    warn!("Cannot skip {}: {}", step, e);
                }
            }
            self.finish_configuration();
            return;
        };

        let bytes = match self.codec.encode_mesh(dst, &message) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Encoding {} failed: {}", message, e);
                if let Some(session) = self.session.as_mut() {
                    session.abandoned_step = Some(step);
                }
                self.notify(CoreEvent::Failure {
                    kind: FailureKind::Protocol,
                    message: e.to_string(),
                });
                return;
            }
        };

        let now = self.now_ms;
        let timer = self
            .timers
            .schedule(now, self.settings.transaction_timeout(), TimerKind::Transaction);
        let key = TransactionKey {
            dst,
            opcode: step.request_opcode(),
        };
        if let Err(e) = self
            .transactions
            .begin(key, vec![step.response_opcode()], timer, now)
        {
            warn!("{}", e);
            self.timers.cancel(timer);
            if let Some(session) = self.session.as_mut() {
                session.pending_steps.push_front(step);
            }
            return;
        }

        if let Some(session) = self.session.as_mut() {
            session.active_step = Some(step);
        }
        self.transition(step.requested_state(), Direction::Sending);
        debug!("Sending {} to {}", message, dst);
        self.push(Output::Link(LinkCommand::Send(bytes)));
    }

    fn finish_configuration(&mut self) {
        let no_app_key = self.network.selected_app_key().is_none();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if no_app_key && session.progress.next_expected() == Some(ConfigStep::AppKeyAdd) {
            if let Err(e) = session.progress.skip_app_key() {
                warn!("Cannot skip App Key Add: {}", e);
            }
        }
        if session.progress.is_finished() && session.state() != ProvisioningState::ConfigurationComplete {
            self.transition(ProvisioningState::ConfigurationComplete, Direction::Local);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn with_flow<R>(&mut self, f: impl FnOnce(&ProvisioningFlow<'_>, &mut Session) -> R) -> Option<R> {
        let session = self.session.as_mut()?;
        let flow = ProvisioningFlow::new(self.codec.as_ref(), &self.network, &self.settings);
        Some(f(&flow, session))
    }

    fn run_flow(&mut self, result: Option<Result<Vec<Action>, ProtocolError>>) {
        let actions = match result {
            Some(Ok(actions)) => actions,
            Some(Err(e)) => {
                self.on_protocol_error(e);
                return;
            }
            None => {
                debug!("No session for provisioning input");
                return;
            }
        };

        for action in actions {
            match action {
                Action::Send(request) => match self.codec.encode_provisioning(&request) {
                    Ok(bytes) => {
                        debug!("Sending {}", request.name());
                        self.push(Output::Link(LinkCommand::Send(bytes)));
                    }
                    Err(e) => {
                        self.on_protocol_error(ProtocolError::Codec(e));
                        return;
                    }
                },
                Action::Notify(event) => self.notify(event),
                Action::Transitioned(state) => self.publish_state(state),
                Action::Completed => self.on_provisioning_complete(),
            }
        }
    }

    fn on_protocol_error(&mut self, error: ProtocolError) {
        let active = self
            .session
            .as_ref()
            .map_or(false, |s| !s.state().is_terminal());
        if !active {
            debug!("Protocol error without an active session: {}", error);
            return;
        }
        let direction = match error {
            ProtocolError::DeviceFailed(_)
            | ProtocolError::UnexpectedPdu { .. }
            | ProtocolError::Codec(_) => Direction::Received,
            _ => Direction::Local,
        };
        self.fail_session(FailureKind::Protocol, error.to_string(), direction);
    }

    fn fail_session(&mut self, kind: FailureKind, message: String, direction: Direction) {
        let now = self.now_ms;
        let failed = match self.session.as_mut() {
            Some(session) if !session.state().is_terminal() => {
                session.fail(message.clone(), direction, now).is_ok()
            }
            _ => false,
        };
        error!("Provisioning failed ({}): {}", kind, message);
        if failed {
            self.publish_state(ProvisioningState::ProvisioningFailed);
        }
        self.notify(CoreEvent::Failure { kind, message });
        self.teardown();
    }

    /// Cancel timers and transactions, stop the supervisor and drop the link
    fn teardown(&mut self) {
        self.timers.cancel_all();
        for transaction in self.transactions.clear() {
            debug!("Dropping transaction 0x{:04X} to {}", transaction.key.opcode, transaction.key.dst);
        }
        let actions = self.supervisor.reset();
        self.run_reconnect(actions);
        if self.filter.on_disconnected() {
            self.notify_filter();
        }
        if self.link != LinkState::Disconnected {
            self.push(Output::Link(LinkCommand::Disconnect));
            self.link = LinkState::Disconnected;
        }
    }

    fn run_reconnect(&mut self, actions: Vec<ReconnectAction>) {
        for action in actions {
            match action {
                ReconnectAction::Schedule(timer, delay) => {
                    let kind = TimerKind::Reconnect(timer);
                    self.timers.cancel_where(|k| *k == kind);
                    self.timers.schedule(self.now_ms, delay, kind);
                }
                ReconnectAction::Cancel(timer) => {
                    let kind = TimerKind::Reconnect(timer);
                    self.timers.cancel_where(|k| *k == kind);
                }
                ReconnectAction::StartScan(service) => {
                    self.push(Output::Scan(ScanCommand::Start { service }));
                }
                ReconnectAction::StopScan => self.push(Output::Scan(ScanCommand::Stop)),
                ReconnectAction::Matched { address } => {
                    let before_reconnect = match self.session.as_mut() {
                        Some(session) => {
                            session.update_device_address(&address);
                            session.state().rank() < ProvisioningState::Reconnecting.rank()
                        }
                        None => false,
                    };
                    if before_reconnect {
                        self.transition(ProvisioningState::Reconnecting, Direction::Local);
                    }
                }
                ReconnectAction::Connect(device) => {
                    self.link = LinkState::Connecting(Bearer::Proxy);
                    self.push(Output::Link(LinkCommand::Connect(device)));
                }
                ReconnectAction::Finished(outcome) => {
                    match &outcome {
                        ReconnectOutcome::Found { .. } => {}
                        ReconnectOutcome::Timeout => {
                            let partial = self.session.as_ref().map_or(false, |s| s.is_partial());
                            let message = if partial {
                                "Reconnecting failed: node not found, configuration not finished"
                            } else {
                                "Reconnecting failed: node not found"
                            };
                            self.notify(CoreEvent::Failure {
                                kind: FailureKind::Timeout,
                                message: message.to_string(),
                            });
                        }
                        ReconnectOutcome::ConnectFailed { attempts } => self.notify(CoreEvent::Failure {
                            kind: FailureKind::Transport,
                            message: format!("Reconnecting failed after {} attempt(s)", attempts),
                        }),
                    }
                    self.notify(CoreEvent::ReconnectOutcome(outcome));
                }
            }
        }
    }

    /// Mirror rejected caller input as a validation failure event
    fn reject_invalid<T>(&mut self, result: Result<T, CoreError>) -> Result<T, CoreError> {
        if let Err(e) = &result {
            if e.is_validation() {
                debug!("Rejected input: {}", e);
                self.notify(CoreEvent::Failure {
                    kind: FailureKind::Validation,
                    message: e.to_string(),
                });
            }
        }
        result
    }

    fn send_proxy_configuration(&mut self, message: MeshMessage) -> Result<(), CoreError> {
        match self.codec.encode_mesh(MeshAddress::new(UNASSIGNED_ADDRESS), &message) {
            Ok(bytes) => {
                debug!("Sending {}", message);
                self.push(Output::Link(LinkCommand::Send(bytes)));
                Ok(())
            }
            Err(e) => {
                self.filter.discard_latest();
                Err(e.into())
            }
        }
    }

    fn transition(&mut self, to: ProvisioningState, direction: Direction) {
        let now = self.now_ms;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.transition(to, direction, now) {
            Ok(()) => self.publish_state(to),
            Err(e) => warn!("Transition refused: {}", e),
        }
    }

    /// Publish `state` with the log up to the entry that recorded it
    fn publish_state(&mut self, state: ProvisioningState) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let entries = session.log().entries();
        let end = entries
            .iter()
            .rposition(|e| e.state == state)
            .map_or(entries.len(), |i| i + 1);
        let log = entries[..end].to_vec();
        if log.len() > self.settings.log_warn_threshold {
            warn!("Session log has {} entries", log.len());
        }
        self.notify(CoreEvent::ProvisioningStateChanged { state, log });
    }

    fn notify_filter(&mut self) {
        let (filter_type, addresses) = self.filter.snapshot();
        self.notify(CoreEvent::ProxyFilterChanged {
            filter_type,
            addresses,
        });
    }

    fn notify(&mut self, event: CoreEvent) {
        self.push(Output::Notify(event));
    }

    fn push(&mut self, output: Output) {
        self.outputs.push_back(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceIdentity, NetworkKey, ProvisioningCapabilities};
    use crate::transport::{JsonCodec, ProvisioningPdu};

    fn network() -> MeshNetwork {
        MeshNetwork {
            provisioner_address: Some(MeshAddress(0x0001)),
            net_keys: vec![NetworkKey {
                index: 0,
                name: "primary".into(),
                key: vec![0u8; 16],
            }],
            ..Default::default()
        }
    }

    fn provisioner() -> MeshProvisioner {
        MeshProvisioner::new(Arc::new(JsonCodec::new()), ProvisionerSettings::default(), network())
            .unwrap()
    }

    fn data(pdu: ProvisioningPdu) -> Input {
        Input::Link(LinkEvent::DataReceived(JsonCodec::provisioning_pdu(&pdu)))
    }

    #[test]
    fn test_select_device_connects_and_invites_on_ready() {
        let mut p = provisioner();
        let device = DeviceRef::new("AA:BB", DeviceIdentity::random());
        p.select_device(device.clone()).unwrap();
        let outputs = p.drain_outputs();
        assert!(outputs.contains(&Output::Link(LinkCommand::Connect(device))));

        p.apply(Input::Link(LinkEvent::Ready), 10);
        assert_eq!(p.session().unwrap().state(), ProvisioningState::Inviting);
        let sent: Vec<_> = p
            .drain_outputs()
            .into_iter()
            .filter_map(|o| match o {
                Output::Link(LinkCommand::Send(bytes)) => JsonCodec::parse_request(&bytes).ok(),
                _ => None,
            })
            .collect();
        assert_eq!(
            sent,
            vec![crate::transport::ProvisioningRequest::Invite {
                attention_duration: 5
            }]
        );
    }

    #[test]
    fn test_second_session_rejected_while_active() {
        let mut p = provisioner();
        p.select_device(DeviceRef::new("AA", DeviceIdentity::random()))
            .unwrap();
        assert_eq!(
            p.select_device(DeviceRef::new("BB", DeviceIdentity::random())),
            Err(CoreError::SessionActive)
        );
    }

    #[test]
    fn test_link_loss_before_complete_fails_session() {
        let mut p = provisioner();
        p.select_device(DeviceRef::new("AA", DeviceIdentity::random()))
            .unwrap();
        p.apply(Input::Link(LinkEvent::Ready), 1);
        p.apply(data(ProvisioningPdu::Capabilities(ProvisioningCapabilities::no_oob(1))), 2);
        p.drain_outputs();

        p.apply(Input::Link(LinkEvent::LinkLoss), 3);
        let session = p.session().unwrap();
        assert_eq!(session.state(), ProvisioningState::ProvisioningFailed);
        assert_eq!(session.failure_reason.as_deref(), Some("Link lost"));
        assert!(p.drain_outputs().iter().any(|o| matches!(
            o,
            Output::Notify(CoreEvent::Failure {
                kind: FailureKind::Transport,
                ..
            })
        )));
        assert!(p.next_deadline().is_none());
    }

    #[test]
    fn test_unexpected_pdu_is_terminal() {
        let mut p = provisioner();
        p.select_device(DeviceRef::new("AA", DeviceIdentity::random()))
            .unwrap();
        p.apply(Input::Link(LinkEvent::Ready), 1);
        p.drain_outputs();

        p.apply(data(ProvisioningPdu::Random), 2);
        assert_eq!(p.session().unwrap().state(), ProvisioningState::ProvisioningFailed);
        let outputs = p.drain_outputs();
        assert!(outputs.contains(&Output::Link(LinkCommand::Disconnect)));
    }

    #[test]
    fn test_cancel_session_is_total() {
        let mut p = provisioner();
        p.select_device(DeviceRef::new("AA", DeviceIdentity::random()))
            .unwrap();
        p.apply(Input::Link(LinkEvent::Ready), 1);
        p.drain_outputs();

        p.cancel_session();
        assert!(p.session().is_none());
        assert_eq!(p.link_state(), LinkState::Disconnected);
        let outputs = p.drain_outputs();
        assert_eq!(
            outputs,
            vec![
                Output::Link(LinkCommand::Disconnect),
                Output::Notify(CoreEvent::SessionClosed)
            ]
        );
        // late events from the dropped link are harmless
        p.apply(Input::Link(LinkEvent::Disconnected), 2);
        assert!(p.drain_outputs().is_empty());
    }

    #[test]
    fn test_filter_intent_requires_proxy_link() {
        let mut p = provisioner();
        assert!(matches!(
            p.add_filter_addresses(&[MeshAddress(3)]),
            Err(CoreError::Filter(_))
        ));
        assert!(p.drain_outputs().is_empty());
    }

    #[test]
    fn test_unassigned_provisioner() {
        let mut net = network();
        net.provisioner_address = None;
        let mut p = MeshProvisioner::new(Arc::new(JsonCodec::new()), ProvisionerSettings::default(), net)
            .unwrap();
        p.select_device(DeviceRef::new("AA", DeviceIdentity::random()))
            .unwrap();
        p.apply(Input::Link(LinkEvent::Ready), 1);
        p.apply(data(ProvisioningPdu::Capabilities(ProvisioningCapabilities::no_oob(1))), 2);

        assert_eq!(p.start_provisioning(None), Err(CoreError::ProvisionerUnassigned));
        assert_eq!(
            p.session().unwrap().state(),
            ProvisioningState::ProvisionerUnassigned
        );
    }

    /// Run No OOB provisioning up to Provisioning Complete at t=6
    fn provisioned() -> MeshProvisioner {
        let mut p = provisioner();
        p.select_device(DeviceRef::new("AA", DeviceIdentity::random()))
            .unwrap();
        p.apply(Input::Link(LinkEvent::Ready), 1);
        p.apply(data(ProvisioningPdu::Capabilities(ProvisioningCapabilities::no_oob(1))), 2);
        p.start_provisioning(None).unwrap();
        p.apply(data(ProvisioningPdu::PublicKey), 3);
        p.apply(data(ProvisioningPdu::Confirmation), 4);
        p.apply(data(ProvisioningPdu::Random), 5);
        p.apply(data(ProvisioningPdu::Complete), 6);
        assert_eq!(p.session().unwrap().state(), ProvisioningState::ProvisioningComplete);
        p.drain_outputs();
        p
    }

    fn assert_quiet_after_cancel(p: &mut MeshProvisioner) {
        assert!(p.session().is_none());
        assert_eq!(p.next_deadline(), None);
        assert!(!p.supervisor.is_active());
        p.apply(Input::Tick, 100_000);
        assert!(p.drain_outputs().is_empty());
    }

    #[test]
    fn test_cancel_while_scanning_stops_scan() {
        let mut p = provisioned();
        let grace = p.settings().reconnect_grace_ms;
        p.apply(Input::Tick, 6 + grace);
        assert!(p.drain_outputs().iter().any(|o| matches!(o, Output::Scan(ScanCommand::Start { .. }))));
        assert!(p.next_deadline().is_some());

        p.cancel_session();
        let outputs = p.drain_outputs();
        assert!(outputs.contains(&Output::Scan(ScanCommand::Stop)));
        assert!(outputs.contains(&Output::Notify(CoreEvent::SessionClosed)));
        assert_quiet_after_cancel(&mut p);
    }

    #[test]
    fn test_cancel_with_configuration_pending() {
        let mut p = provisioned();
        let node = p.session().and_then(|s| s.node.clone()).unwrap();
        let grace = p.settings().reconnect_grace_ms;
        let delay = p.settings().pre_connect_delay_ms;
        p.apply(Input::Tick, 6 + grace);
        p.apply(
            Input::Advertisement(Advertisement {
                address: "11:22".into(),
                name: None,
                rssi: -50,
                service_uuids: vec![crate::transport::MESH_PROXY_SERVICE_UUID],
                service_data: JsonCodec::node_identity_data(&node),
            }),
            7 + grace,
        );
        p.apply(Input::Tick, 7 + grace + delay);
        p.apply(Input::Link(LinkEvent::Ready), 8 + grace + delay);
        assert_eq!(
            p.session().unwrap().state(),
            ProvisioningState::CompositionDataRequested
        );
        assert!(p.next_deadline().is_some());
        p.drain_outputs();

        p.cancel_session();
        let outputs = p.drain_outputs();
        assert!(outputs.contains(&Output::Link(LinkCommand::Disconnect)));
        assert!(outputs.contains(&Output::Notify(CoreEvent::SessionClosed)));
        assert_eq!(p.link_state(), LinkState::Disconnected);

        // a status that was already in flight changes nothing
        let late = JsonCodec::mesh_pdu(
            node.range.primary(),
            MeshAddress(0x0001),
            MeshMessage::CompositionDataStatus {
                page: 0,
                data: Vec::new(),
            },
        );
        p.apply(Input::Link(LinkEvent::DataReceived(late)), 9 + grace + delay);
        assert!(p.drain_outputs().is_empty());
        assert_quiet_after_cancel(&mut p);
    }

    #[test]
    fn test_invalid_filter_address_reported_as_validation_failure() {
        let mut p = provisioner();
        p.connect_proxy(DeviceRef::new("AA", DeviceIdentity::random()))
            .unwrap();
        p.apply(Input::Link(LinkEvent::Ready), 1);
        p.drain_outputs();

        let result = p.add_filter_addresses(&[MeshAddress(0xFF10)]);
        assert!(matches!(
            result,
            Err(CoreError::Filter(crate::proxy::FilterError::InvalidAddress(_)))
        ));
        let outputs = p.drain_outputs();
        assert!(matches!(
            outputs.as_slice(),
            [Output::Notify(CoreEvent::Failure {
                kind: FailureKind::Validation,
                ..
            })]
        ));
        assert!(!outputs
            .iter()
            .any(|o| matches!(o, Output::Link(LinkCommand::Send(_)))));
        assert_eq!(p.filter().pending_requests(), 0);
    }

    #[test]
    fn test_unsupported_method_reported_as_validation_failure() {
        let mut p = provisioner();
        p.select_device(DeviceRef::new("AA", DeviceIdentity::random()))
            .unwrap();
        p.apply(Input::Link(LinkEvent::Ready), 1);
        p.apply(data(ProvisioningPdu::Capabilities(ProvisioningCapabilities::no_oob(1))), 2);
        p.drain_outputs();

        let err = p.start_provisioning(Some(AuthMethod::StaticOob)).unwrap_err();
        assert!(matches!(err, CoreError::Capability(_)));
        assert_eq!(
            p.drain_outputs(),
            vec![Output::Notify(CoreEvent::Failure {
                kind: FailureKind::Validation,
                message: err.to_string(),
            })]
        );
        assert_eq!(
            p.session().unwrap().state(),
            ProvisioningState::CapabilitiesReceived
        );
    }

    #[test]
    fn test_state_errors_are_not_validation_failures() {
        let mut p = provisioner();
        assert_eq!(p.start_provisioning(None), Err(CoreError::NoSession));
        assert!(p.drain_outputs().is_empty());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = ProvisionerSettings::default();
        settings.transaction_timeout_ms = 0;
        assert!(matches!(
            MeshProvisioner::new(Arc::new(JsonCodec::new()), settings.clone(), network()),
            Err(CoreError::Settings(_))
        ));

        let mut p = provisioner();
        assert!(matches!(
            p.update_settings(settings),
            Err(CoreError::Settings(_))
        ));
        assert!(matches!(
            p.drain_outputs().as_slice(),
            [Output::Notify(CoreEvent::Failure {
                kind: FailureKind::Validation,
                ..
            })]
        ));
        assert_eq!(p.settings().transaction_timeout_ms, 10_000);
    }
}
