//! Provisioning protocol flow
//!
//! Moves a [`Session`] through the provisioning PDU exchange and the
//! post-provisioning configuration sequence. Everything here mutates the
//! session and hands back [`Action`]s; the provisioner owns the link.

use super::session::{ConfigStep, Session, StepError};
use super::state::{Direction, ProvisioningState, StateError};
use crate::config::ProvisionerSettings;
use crate::events::CoreEvent;
use crate::model::{AuthMethod, CapabilityError, MeshNetwork, NodeRecord, ProvisioningCapabilities};
use crate::transport::{CodecError, MeshCodec, MeshMessage, ProvisioningPdu, ProvisioningRequest};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Terminal protocol failures of a provisioning session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unexpected {pdu} in state {state}")]
    UnexpectedPdu {
        pdu: &'static str,
        state: ProvisioningState,
    },
    #[error("Invalid capabilities: {0}")]
    InvalidCapabilities(CapabilityError),
    #[error("Cannot assign addresses for {0} element(s)")]
    CannotAssignAddresses(u8),
    #[error("No network key to provision with")]
    NoNetworkKey,
    #[error("Device reported failure: {0}")]
    DeviceFailed(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Work for the provisioner after the flow consumed an input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(ProvisioningRequest),
    Notify(CoreEvent),
    /// State entered; the provisioner publishes the log
    Transitioned(ProvisioningState),
    /// Provisioning Complete received, node record filled in
    Completed,
}

/// Result of a configuration status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed(ConfigStep),
    Failed { step: ConfigStep, status: u8 },
}

/// Borrowed context the flow needs besides the session
pub struct ProvisioningFlow<'a> {
    pub codec: &'a dyn MeshCodec,
    pub network: &'a MeshNetwork,
    pub settings: &'a ProvisionerSettings,
}

impl<'a> ProvisioningFlow<'a> {
    pub fn new(
        codec: &'a dyn MeshCodec,
        network: &'a MeshNetwork,
        settings: &'a ProvisionerSettings,
    ) -> Self {
        Self {
            codec,
            network,
            settings,
        }
    }

    /// Link to the unprovisioned device is up: send the Invite
    pub fn invite(&self, session: &mut Session, now_ms: u64) -> Result<Vec<Action>, ProtocolError> {
        session.transition(ProvisioningState::Inviting, Direction::Sending, now_ms)?;
        Ok(vec![
            Action::Transitioned(ProvisioningState::Inviting),
            Action::Send(ProvisioningRequest::Invite {
                attention_duration: self.settings.attention_duration_s,
            }),
        ])
    }

    /// Pick the authentication method. No side effects.
    pub fn select_method(
        &self,
        session: &Session,
        choice: Option<AuthMethod>,
    ) -> Result<AuthMethod, CapabilityError> {
        match &session.capabilities {
            Some(capabilities) => capabilities.select(choice),
            None => Err(CapabilityError::NoElements),
        }
    }

    /// Enter the branch for `method`, then send Start and our public key
    pub fn start(
        &self,
        session: &mut Session,
        method: AuthMethod,
        now_ms: u64,
    ) -> Result<Vec<Action>, ProtocolError> {
        if self.network.primary_net_key().is_none() {
            return Err(ProtocolError::NoNetworkKey);
        }
        let branch = ProvisioningState::for_method(method.kind());
        session.transition(branch, Direction::Sending, now_ms)?;
        session.method = Some(method);
        info!("Provisioning {} with {}", session.device(), method);

        Ok(vec![
            Action::Transitioned(branch),
            Action::Send(ProvisioningRequest::Start {
                method,
                public_key_oob: false,
            }),
            Action::Send(ProvisioningRequest::PublicKey),
        ])
    }

    /// Static or Output OOB value typed by the user
    pub fn submit_authentication(
        &self,
        session: &mut Session,
        input: &str,
    ) -> Result<Vec<Action>, CapabilityError> {
        let method = session
            .method
            .ok_or_else(|| CapabilityError::InvalidValue("no method selected".to_string()))?;
        let value = method.parse_user_value(input)?;
        session.confirmation_sent = true;
        Ok(vec![Action::Send(ProvisioningRequest::Confirmation {
            auth_value: Some(value),
        })])
    }

    /// Handle one PDU from the device
    pub fn on_pdu(
        &self,
        session: &mut Session,
        pdu: ProvisioningPdu,
        now_ms: u64,
    ) -> Result<Vec<Action>, ProtocolError> {
        let state = session.state();
        debug!("{} received in {}", pdu.name(), state);

        match (state, pdu) {
            (_, ProvisioningPdu::Failed { code }) => Err(ProtocolError::DeviceFailed(
                self.codec.failure_reason(code),
            )),
            (ProvisioningState::Inviting, ProvisioningPdu::Capabilities(capabilities)) => {
                self.on_capabilities(session, capabilities, now_ms)
            }
            (s, ProvisioningPdu::PublicKey) if s.is_oob_branch() => {
                self.on_public_key(session, now_ms)
            }
            (ProvisioningState::AuthenticationWaiting, ProvisioningPdu::InputComplete)
                if matches!(session.method, Some(AuthMethod::InputOob { .. }))
                    && !session.confirmation_sent =>
            {
                session.confirmation_sent = true;
                Ok(vec![Action::Send(ProvisioningRequest::Confirmation {
                    auth_value: session.input_oob_value.clone(),
                })])
            }
            (
                ProvisioningState::PublicKeyExchanged | ProvisioningState::AuthenticationWaiting,
                ProvisioningPdu::Confirmation,
            ) if session.confirmation_sent => {
                session.transition(
                    ProvisioningState::AuthenticationConfirmed,
                    Direction::Received,
                    now_ms,
                )?;
                Ok(vec![
                    Action::Transitioned(ProvisioningState::AuthenticationConfirmed),
                    Action::Send(ProvisioningRequest::Random),
                ])
            }
            (ProvisioningState::AuthenticationConfirmed, ProvisioningPdu::Random) => {
                self.on_random(session, now_ms)
            }
            (ProvisioningState::DataSent, ProvisioningPdu::Complete) => {
                session.transition(
                    ProvisioningState::ProvisioningComplete,
                    Direction::Received,
                    now_ms,
                )?;
                if let Some(range) = session.unicast_range {
                    let name = session
                        .device()
                        .name
                        .clone()
                        .unwrap_or_else(|| session.identity().to_string());
                    session.node = Some(NodeRecord {
                        identity: session.identity(),
                        name,
                        range,
                    });
                }
                Ok(vec![
                    Action::Transitioned(ProvisioningState::ProvisioningComplete),
                    Action::Completed,
                ])
            }
            (state, pdu) => Err(ProtocolError::UnexpectedPdu {
                pdu: pdu.name(),
                state,
            }),
        }
    }

    fn on_capabilities(
        &self,
        session: &mut Session,
        capabilities: ProvisioningCapabilities,
        now_ms: u64,
    ) -> Result<Vec<Action>, ProtocolError> {
        capabilities
            .validate()
            .map_err(ProtocolError::InvalidCapabilities)?;
        let range = self
            .network
            .allocate_unicast(capabilities.element_count)
            .ok_or(ProtocolError::CannotAssignAddresses(capabilities.element_count))?;

        session.transition(ProvisioningState::CapabilitiesReceived, Direction::Received, now_ms)?;
        info!(
            "{} element(s), unicast range {}..{}",
            capabilities.element_count, range.low, range.high
        );
        let supported = capabilities.supported_methods();
        session.capabilities = Some(capabilities.clone());
        session.unicast_range = Some(range);

        Ok(vec![
            Action::Transitioned(ProvisioningState::CapabilitiesReceived),
            Action::Notify(CoreEvent::CapabilitiesReceived {
                capabilities,
                supported,
            }),
        ])
    }

    fn on_public_key(&self, session: &mut Session, now_ms: u64) -> Result<Vec<Action>, ProtocolError> {
        // Start always records the method before our key goes out
        let method = session.method.ok_or(ProtocolError::UnexpectedPdu {
            pdu: "Provisioning Public Key",
            state: session.state(),
        })?;
        session.transition(ProvisioningState::PublicKeyExchanged, Direction::Received, now_ms)?;
        let mut actions = vec![Action::Transitioned(ProvisioningState::PublicKeyExchanged)];

        match method {
            AuthMethod::NoOob => {
                session.confirmation_sent = true;
                actions.push(Action::Send(ProvisioningRequest::Confirmation {
                    auth_value: None,
                }));
            }
            method => {
                session.transition(
                    ProvisioningState::AuthenticationWaiting,
                    Direction::Local,
                    now_ms,
                )?;
                let input_value = method.generate_input_value(&mut rand::thread_rng());
                session.input_oob_value = input_value.clone();
                actions.push(Action::Transitioned(ProvisioningState::AuthenticationWaiting));
                actions.push(Action::Notify(CoreEvent::AuthenticationRequired {
                    method,
                    input_value,
                }));
            }
        }
        Ok(actions)
    }

    fn on_random(&self, session: &mut Session, now_ms: u64) -> Result<Vec<Action>, ProtocolError> {
        session.transition(ProvisioningState::RandomExchanged, Direction::Received, now_ms)?;

        let net_key = self
            .network
            .primary_net_key()
            .ok_or(ProtocolError::NoNetworkKey)?;
        let range = session.unicast_range.ok_or(ProtocolError::CannotAssignAddresses(0))?;
        let data = ProvisioningRequest::Data {
            unicast: range.primary(),
            net_key_index: net_key.index,
            iv_index: self.network.iv_index,
        };

        session.transition(ProvisioningState::DataSent, Direction::Sending, now_ms)?;
        Ok(vec![
            Action::Transitioned(ProvisioningState::RandomExchanged),
            Action::Transitioned(ProvisioningState::DataSent),
            Action::Send(data),
        ])
    }

    /// Request message for `step`; `None` when App Key Add has no key to send
    pub fn config_request(&self, step: ConfigStep) -> Option<MeshMessage> {
        match step {
            ConfigStep::CompositionData => Some(MeshMessage::CompositionDataGet {
                page: self.settings.composition_data_page,
            }),
            ConfigStep::DefaultTtl => Some(MeshMessage::DefaultTtlGet),
            ConfigStep::NetworkTransmit => Some(MeshMessage::NetworkTransmitSet {
                count: self.settings.network_transmit_count,
                interval_steps: self.settings.network_transmit_interval_steps,
            }),
            ConfigStep::AppKeyAdd => {
                let app_key = self.network.selected_app_key()?;
                Some(MeshMessage::AppKeyAdd {
                    net_key_index: app_key.bound_net_key_index,
                    app_key_index: app_key.index,
                    key: app_key.key.clone(),
                })
            }
        }
    }

    /// Apply the status that answered `step`
    pub fn on_config_status(
        &self,
        session: &mut Session,
        step: ConfigStep,
        message: MeshMessage,
    ) -> Result<StepOutcome, StepError> {
        match message {
            MeshMessage::CompositionDataStatus { data, .. } => {
                session.composition_data = Some(data);
            }
            MeshMessage::DefaultTtlStatus { ttl } => {
                session.default_ttl = Some(ttl);
            }
            MeshMessage::NetworkTransmitStatus {
                count,
                interval_steps,
            } => {
                if count != self.settings.network_transmit_count
                    || interval_steps != self.settings.network_transmit_interval_steps
                {
                    warn!(
                        "Node reports network transmit ({}, {}), requested ({}, {})",
                        count,
                        interval_steps,
                        self.settings.network_transmit_count,
                        self.settings.network_transmit_interval_steps
                    );
                }
            }
            MeshMessage::AppKeyStatus { status, .. } if status != 0 => {
                warn!("{} rejected with status 0x{:02X}", step, status);
                return Ok(StepOutcome::Failed { step, status });
            }
            _ => {}
        }
        session.progress.complete(step)?;
        Ok(StepOutcome::Completed(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ApplicationKey, AuthValue, DeviceIdentity, DeviceRef, InputAction, MeshAddress,
        NetworkKey, OutputAction,
    };
    use crate::transport::JsonCodec;

    fn network() -> MeshNetwork {
        MeshNetwork {
            provisioner_address: Some(MeshAddress(0x0001)),
            net_keys: vec![NetworkKey {
                index: 0,
                name: "primary".into(),
                key: vec![0u8; 16],
            }],
            app_keys: vec![ApplicationKey {
                index: 3,
                bound_net_key_index: 0,
                name: "app".into(),
                key: vec![1u8; 16],
            }],
            ..Default::default()
        }
    }

    fn session_with_caps(
        flow: &ProvisioningFlow<'_>,
        caps: ProvisioningCapabilities,
    ) -> Session {
        let mut session = Session::new(DeviceRef::new("AA:BB", DeviceIdentity::random()), 0);
        flow.invite(&mut session, 1).unwrap();
        flow.on_pdu(&mut session, ProvisioningPdu::Capabilities(caps), 2)
            .unwrap();
        session
    }

    #[test]
    fn test_capabilities_allocate_after_provisioner() {
        let codec = JsonCodec::new();
        let net = network();
        let settings = ProvisionerSettings::default();
        let flow = ProvisioningFlow::new(&codec, &net, &settings);

        let session = session_with_caps(&flow, ProvisioningCapabilities::no_oob(3));
        let range = session.unicast_range.unwrap();
        assert_eq!(range.low, MeshAddress(0x0002));
        assert_eq!(range.high, MeshAddress(0x0004));
        assert_eq!(session.state(), ProvisioningState::CapabilitiesReceived);
    }

    #[test]
    fn test_zero_elements_is_protocol_failure() {
        let codec = JsonCodec::new();
        let net = network();
        let settings = ProvisionerSettings::default();
        let flow = ProvisioningFlow::new(&codec, &net, &settings);

        let mut session = Session::new(DeviceRef::new("AA:BB", DeviceIdentity::random()), 0);
        flow.invite(&mut session, 1).unwrap();
        let err = flow
            .on_pdu(
                &mut session,
                ProvisioningPdu::Capabilities(ProvisioningCapabilities::no_oob(0)),
                2,
            )
            .unwrap_err();
        assert_eq!(err, ProtocolError::InvalidCapabilities(CapabilityError::NoElements));
    }

    #[test]
    fn test_no_oob_never_waits() {
        let codec = JsonCodec::new();
        let net = network();
        let settings = ProvisionerSettings::default();
        let flow = ProvisioningFlow::new(&codec, &net, &settings);
        let mut session = session_with_caps(&flow, ProvisioningCapabilities::no_oob(1));

        let method = flow.select_method(&session, None).unwrap();
        flow.start(&mut session, method, 3).unwrap();
        let actions = flow.on_pdu(&mut session, ProvisioningPdu::PublicKey, 4).unwrap();
        assert!(actions.contains(&Action::Send(ProvisioningRequest::Confirmation {
            auth_value: None
        })));
        assert_eq!(session.state(), ProvisioningState::PublicKeyExchanged);

        flow.on_pdu(&mut session, ProvisioningPdu::Confirmation, 5).unwrap();
        flow.on_pdu(&mut session, ProvisioningPdu::Random, 6).unwrap();
        assert_eq!(session.state(), ProvisioningState::DataSent);
        let actions = flow.on_pdu(&mut session, ProvisioningPdu::Complete, 7).unwrap();
        assert!(actions.contains(&Action::Completed));
        assert!(!session.log().contains(ProvisioningState::AuthenticationWaiting));
        assert_eq!(session.node.as_ref().unwrap().range.primary(), MeshAddress(2));
    }

    #[test]
    fn test_output_oob_waits_for_user_value() {
        let codec = JsonCodec::new();
        let net = network();
        let settings = ProvisionerSettings::default();
        let flow = ProvisioningFlow::new(&codec, &net, &settings);
        let mut caps = ProvisioningCapabilities::no_oob(1);
        caps.output_oob_size = 4;
        caps.output_actions = vec![OutputAction::Blink];
        let mut session = session_with_caps(&flow, caps);

        let method = AuthMethod::OutputOob {
            action: OutputAction::Blink,
            size: 4,
        };
        flow.start(&mut session, method, 3).unwrap();
        flow.on_pdu(&mut session, ProvisioningPdu::PublicKey, 4).unwrap();
        assert_eq!(session.state(), ProvisioningState::AuthenticationWaiting);

        // device confirmation before ours is out of order
        let mut early = session.clone();
        assert!(matches!(
            flow.on_pdu(&mut early, ProvisioningPdu::Confirmation, 5),
            Err(ProtocolError::UnexpectedPdu { .. })
        ));

        assert!(flow.submit_authentication(&mut session, "12a").is_err());
        let actions = flow.submit_authentication(&mut session, "1234").unwrap();
        assert_eq!(
            actions,
            vec![Action::Send(ProvisioningRequest::Confirmation {
                auth_value: Some(AuthValue::Numeric(1234))
            })]
        );
        flow.on_pdu(&mut session, ProvisioningPdu::Confirmation, 6).unwrap();
        assert_eq!(session.state(), ProvisioningState::AuthenticationConfirmed);
    }

    #[test]
    fn test_public_key_without_method_is_unexpected() {
        let codec = JsonCodec::new();
        let net = network();
        let settings = ProvisionerSettings::default();
        let flow = ProvisioningFlow::new(&codec, &net, &settings);
        let mut session = session_with_caps(&flow, ProvisioningCapabilities::no_oob(1));

        flow.start(&mut session, AuthMethod::NoOob, 3).unwrap();
        session.method = None;
        let state = session.state();
        assert_eq!(
            flow.on_pdu(&mut session, ProvisioningPdu::PublicKey, 4),
            Err(ProtocolError::UnexpectedPdu {
                pdu: "Provisioning Public Key",
                state
            })
        );
        assert_eq!(session.state(), state);
        assert!(!session.confirmation_sent);
    }

    #[test]
    fn test_input_oob_confirms_after_input_complete() {
        let codec = JsonCodec::new();
        let net = network();
        let settings = ProvisionerSettings::default();
        let flow = ProvisioningFlow::new(&codec, &net, &settings);
        let mut caps = ProvisioningCapabilities::no_oob(1);
        caps.input_oob_size = 2;
        caps.input_actions = vec![InputAction::Push];
        let mut session = session_with_caps(&flow, caps);

        let method = AuthMethod::InputOob {
            action: InputAction::Push,
            size: 1,
        };
        flow.start(&mut session, method, 3).unwrap();
        let actions = flow.on_pdu(&mut session, ProvisioningPdu::PublicKey, 4).unwrap();
        let shown = session.input_oob_value.clone().unwrap();
        assert!(actions.contains(&Action::Notify(CoreEvent::AuthenticationRequired {
            method,
            input_value: Some(shown.clone()),
        })));

        let actions = flow
            .on_pdu(&mut session, ProvisioningPdu::InputComplete, 5)
            .unwrap();
        assert_eq!(
            actions,
            vec![Action::Send(ProvisioningRequest::Confirmation {
                auth_value: Some(shown)
            })]
        );
    }

    #[test]
    fn test_failed_pdu_decoded() {
        let codec = JsonCodec::new();
        let net = network();
        let settings = ProvisionerSettings::default();
        let flow = ProvisioningFlow::new(&codec, &net, &settings);
        let mut session = session_with_caps(&flow, ProvisioningCapabilities::no_oob(1));

        let err = flow
            .on_pdu(&mut session, ProvisioningPdu::Failed { code: 0x04 }, 3)
            .unwrap_err();
        assert_eq!(err.to_string(), "Device reported failure: Confirmation failed");
    }

    #[test]
    fn test_config_requests_use_network_snapshot() {
        let codec = JsonCodec::new();
        let mut net = network();
        let settings = ProvisionerSettings::default();
        {
            let flow = ProvisioningFlow::new(&codec, &net, &settings);
            assert_eq!(
                flow.config_request(ConfigStep::AppKeyAdd),
                Some(MeshMessage::AppKeyAdd {
                    net_key_index: 0,
                    app_key_index: 3,
                    key: vec![1u8; 16]
                })
            );
            assert_eq!(
                flow.config_request(ConfigStep::NetworkTransmit),
                Some(MeshMessage::NetworkTransmitSet {
                    count: 2,
                    interval_steps: 1
                })
            );
        }
        net.app_keys.clear();
        let flow = ProvisioningFlow::new(&codec, &net, &settings);
        assert_eq!(flow.config_request(ConfigStep::AppKeyAdd), None);
    }

    #[test]
    fn test_app_key_status_failure() {
        let codec = JsonCodec::new();
        let net = network();
        let settings = ProvisionerSettings::default();
        let flow = ProvisioningFlow::new(&codec, &net, &settings);
        let mut session = Session::new(DeviceRef::new("AA:BB", DeviceIdentity::random()), 0);
        for step in [
            ConfigStep::CompositionData,
            ConfigStep::DefaultTtl,
            ConfigStep::NetworkTransmit,
        ] {
            session.progress.complete(step).unwrap();
        }

        let outcome = flow
            .on_config_status(
                &mut session,
                ConfigStep::AppKeyAdd,
                MeshMessage::AppKeyStatus {
                    status: 0x05,
                    net_key_index: 0,
                    app_key_index: 3,
                },
            )
            .unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Failed {
                step: ConfigStep::AppKeyAdd,
                status: 0x05
            }
        );
        assert!(!session.progress.is_app_key_added());
    }
}
