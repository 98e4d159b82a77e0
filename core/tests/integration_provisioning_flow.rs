//! End-to-end provisioning and configuration against a simulated device
//!
//! The device side is played by hand: every PDU the provisioner sends is
//! decoded with the JSON codec and answered in the test body.

use meshprov_core::bookkeeping::TransactionFailure;
use meshprov_core::model::{ApplicationKey, CapabilityError, NetworkKey, NodeRecord};
use meshprov_core::transport::{
    Advertisement, LinkCommand, MeshMessage, ProvisioningPdu, ProvisioningRequest, ScanCommand,
    MESH_PROXY_SERVICE_UUID,
};
use meshprov_core::{
    AuthMethod, ConfigStep, CoreError, CoreEvent, DeviceIdentity, DeviceRef, FailureKind, Input,
    JsonCodec, LinkEvent, MeshAddress, MeshNetwork, MeshProvisioner, Output,
    ProvisionerSettings, ProvisioningCapabilities, ProvisioningState, ReconnectOutcome,
};
use std::sync::Arc;

const PROVISIONER: MeshAddress = MeshAddress(0x0001);

fn network(with_app_key: bool) -> MeshNetwork {
    let app_keys = if with_app_key {
        vec![ApplicationKey {
            index: 0,
            bound_net_key_index: 0,
            name: "app".into(),
            key: vec![0x11; 16],
        }]
    } else {
        Vec::new()
    };
    MeshNetwork {
        provisioner_address: Some(PROVISIONER),
        net_keys: vec![NetworkKey {
            index: 0,
            name: "primary".into(),
            key: vec![0x22; 16],
        }],
        app_keys,
        ..Default::default()
    }
}

struct Harness {
    provisioner: MeshProvisioner,
    now: u64,
}

impl Harness {
    fn new(network: MeshNetwork) -> Self {
        Self::with_settings(network, ProvisionerSettings::default())
    }

    fn with_settings(network: MeshNetwork, settings: ProvisionerSettings) -> Self {
        Self {
            provisioner: MeshProvisioner::new(Arc::new(JsonCodec::new()), settings, network).unwrap(),
            now: 0,
        }
    }

    fn apply(&mut self, input: Input) -> Vec<Output> {
        self.now += 1;
        self.provisioner.apply(input, self.now);
        self.provisioner.drain_outputs()
    }

    fn advance(&mut self, ms: u64) -> Vec<Output> {
        self.now += ms;
        self.provisioner.apply(Input::Tick, self.now);
        self.provisioner.drain_outputs()
    }

    fn link(&mut self, event: LinkEvent) -> Vec<Output> {
        self.apply(Input::Link(event))
    }

    fn device(&mut self, pdu: ProvisioningPdu) -> Vec<Output> {
        self.link(LinkEvent::DataReceived(JsonCodec::provisioning_pdu(&pdu)))
    }

    fn node(&mut self, src: MeshAddress, message: MeshMessage) -> Vec<Output> {
        self.link(LinkEvent::DataReceived(JsonCodec::mesh_pdu(src, PROVISIONER, message)))
    }

    fn state(&self) -> ProvisioningState {
        self.provisioner.session().map(|s| s.state()).unwrap()
    }

    fn node_record(&self) -> NodeRecord {
        self.provisioner.session().and_then(|s| s.node.clone()).unwrap()
    }

    /// Select, invite and receive capabilities
    fn open(&mut self, capabilities: ProvisioningCapabilities) -> DeviceRef {
        let device = DeviceRef::new("AA:BB:CC:00:00:01", DeviceIdentity::random());
        self.provisioner.select_device(device.clone()).unwrap();
        self.provisioner.drain_outputs();
        self.link(LinkEvent::Ready);
        self.device(ProvisioningPdu::Capabilities(capabilities));
        device
    }

    /// Run No OOB provisioning to Provisioning Complete
    fn provision_no_oob(&mut self) -> Vec<Output> {
        self.open(ProvisioningCapabilities::no_oob(1));
        let mut outputs = Vec::new();
        self.provisioner.start_provisioning(None).unwrap();
        outputs.extend(self.provisioner.drain_outputs());
        outputs.extend(self.device(ProvisioningPdu::PublicKey));
        outputs.extend(self.device(ProvisioningPdu::Confirmation));
        outputs.extend(self.device(ProvisioningPdu::Random));
        outputs.extend(self.device(ProvisioningPdu::Complete));
        outputs
    }

    /// Grace period, scan, match and connect as a proxy
    fn reconnect(&mut self) -> Vec<Output> {
        let node = self.node_record();
        let mut outputs = self.advance(self.provisioner.settings().reconnect_grace_ms);
        outputs.extend(self.apply(Input::Advertisement(identity_advertisement("11:22:33:44:55:66", &node))));
        outputs.extend(self.advance(self.provisioner.settings().pre_connect_delay_ms));
        outputs.extend(self.link(LinkEvent::Ready));
        outputs
    }
}

fn identity_advertisement(address: &str, node: &NodeRecord) -> Advertisement {
    Advertisement {
        address: address.into(),
        name: None,
        rssi: -60,
        service_uuids: vec![MESH_PROXY_SERVICE_UUID],
        service_data: JsonCodec::node_identity_data(node),
    }
}

fn requests(outputs: &[Output]) -> Vec<ProvisioningRequest> {
    outputs
        .iter()
        .filter_map(|o| match o {
            Output::Link(LinkCommand::Send(bytes)) => JsonCodec::parse_request(bytes).ok(),
            _ => None,
        })
        .collect()
}

fn messages(outputs: &[Output]) -> Vec<(MeshAddress, MeshMessage)> {
    outputs
        .iter()
        .filter_map(|o| match o {
            Output::Link(LinkCommand::Send(bytes)) => JsonCodec::parse_outbound(bytes).ok(),
            _ => None,
        })
        .collect()
}

fn states(outputs: &[Output]) -> Vec<ProvisioningState> {
    outputs
        .iter()
        .filter_map(|o| match o.as_event() {
            Some(CoreEvent::ProvisioningStateChanged { state, .. }) => Some(*state),
            _ => None,
        })
        .collect()
}

fn events(outputs: &[Output]) -> Vec<CoreEvent> {
    outputs.iter().filter_map(|o| o.as_event().cloned()).collect()
}

#[test]
fn test_no_oob_runs_without_user_interaction() {
    let mut h = Harness::new(network(false));
    let outputs = h.provision_no_oob();

    assert_eq!(
        states(&outputs),
        vec![
            ProvisioningState::NoOob,
            ProvisioningState::PublicKeyExchanged,
            ProvisioningState::AuthenticationConfirmed,
            ProvisioningState::RandomExchanged,
            ProvisioningState::DataSent,
            ProvisioningState::ProvisioningComplete,
        ]
    );
    assert!(!events(&outputs)
        .iter()
        .any(|e| matches!(e, CoreEvent::AuthenticationRequired { .. })));

    let node = h.node_record();
    assert_eq!(
        requests(&outputs),
        vec![
            ProvisioningRequest::Start {
                method: AuthMethod::NoOob,
                public_key_oob: false,
            },
            ProvisioningRequest::PublicKey,
            ProvisioningRequest::Confirmation { auth_value: None },
            ProvisioningRequest::Random,
            ProvisioningRequest::Data {
                unicast: node.range.primary(),
                net_key_index: 0,
                iv_index: 0,
            },
        ]
    );
    assert_ne!(node.range.primary(), PROVISIONER);
    assert!(outputs.contains(&Output::Link(LinkCommand::Disconnect)));
    assert!(h.provisioner.network().node(&node.identity).is_some());
}

#[test]
fn test_configuration_follows_reconnect_in_order() {
    let mut h = Harness::new(network(true));
    h.provision_no_oob();
    let node = h.node_record();
    let dst = node.range.primary();

    // nothing happens during the grace period
    assert!(h.advance(h.provisioner.settings().reconnect_grace_ms - 1).is_empty());
    let outputs = h.advance(1);
    assert_eq!(
        outputs,
        vec![Output::Scan(ScanCommand::Start {
            service: MESH_PROXY_SERVICE_UUID
        })]
    );

    let outputs = h.apply(Input::Advertisement(identity_advertisement("11:22:33:44:55:66", &node)));
    assert_eq!(outputs.first(), Some(&Output::Scan(ScanCommand::Stop)));
    assert_eq!(states(&outputs), vec![ProvisioningState::Reconnecting]);

    let outputs = h.advance(h.provisioner.settings().pre_connect_delay_ms);
    let connected: Vec<_> = outputs
        .iter()
        .filter_map(|o| match o.as_link() {
            Some(LinkCommand::Connect(device)) => Some(device.address.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(connected, vec!["11:22:33:44:55:66".to_string()]);

    let outputs = h.link(LinkEvent::Ready);
    assert!(events(&outputs).contains(&CoreEvent::ReconnectOutcome(ReconnectOutcome::Found {
        address: "11:22:33:44:55:66".into()
    })));
    assert_eq!(messages(&outputs), vec![(dst, MeshMessage::CompositionDataGet { page: 0 })]);
    assert_eq!(h.state(), ProvisioningState::CompositionDataRequested);

    let outputs = h.node(
        dst,
        MeshMessage::CompositionDataStatus {
            page: 0,
            data: vec![1, 2, 3],
        },
    );
    assert!(events(&outputs).contains(&CoreEvent::ConfigurationStepCompleted {
        step: ConfigStep::CompositionData
    }));
    assert_eq!(messages(&outputs), vec![(dst, MeshMessage::DefaultTtlGet)]);

    let outputs = h.node(dst, MeshMessage::DefaultTtlStatus { ttl: 5 });
    assert_eq!(
        messages(&outputs),
        vec![(
            dst,
            MeshMessage::NetworkTransmitSet {
                count: 2,
                interval_steps: 1
            }
        )]
    );

    let outputs = h.node(
        dst,
        MeshMessage::NetworkTransmitStatus {
            count: 2,
            interval_steps: 1,
        },
    );
    assert_eq!(
        messages(&outputs),
        vec![(
            dst,
            MeshMessage::AppKeyAdd {
                net_key_index: 0,
                app_key_index: 0,
                key: vec![0x11; 16],
            }
        )]
    );
    assert_eq!(h.state(), ProvisioningState::AppKeyAddRequested);

    let outputs = h.node(
        dst,
        MeshMessage::AppKeyStatus {
            status: 0,
            net_key_index: 0,
            app_key_index: 0,
        },
    );
    assert_eq!(states(&outputs), vec![ProvisioningState::ConfigurationComplete]);

    let session = h.provisioner.session().unwrap();
    assert_eq!(session.composition_data, Some(vec![1, 2, 3]));
    assert_eq!(session.default_ttl, Some(5));
    assert!(session.progress.is_finished());
    assert!(h.provisioner.next_deadline().is_none());
}

#[test]
fn test_configuration_complete_without_app_key() {
    let mut h = Harness::new(network(false));
    h.provision_no_oob();
    let dst = h.node_record().range.primary();
    h.reconnect();

    h.node(
        dst,
        MeshMessage::CompositionDataStatus {
            page: 0,
            data: Vec::new(),
        },
    );
    h.node(dst, MeshMessage::DefaultTtlStatus { ttl: 7 });
    let outputs = h.node(
        dst,
        MeshMessage::NetworkTransmitStatus {
            count: 2,
            interval_steps: 1,
        },
    );

    assert!(messages(&outputs).is_empty());
    assert_eq!(states(&outputs), vec![ProvisioningState::ConfigurationComplete]);
    let log_states = h.provisioner.session().unwrap().log().states();
    assert!(!log_states.contains(&ProvisioningState::AppKeyAddRequested));
}

#[test]
fn test_incomplete_segments_reported_on_deadline() {
    let mut h = Harness::new(network(false));
    h.provision_no_oob();
    let dst = h.node_record().range.primary();
    h.reconnect();

    h.link(LinkEvent::DataReceived(JsonCodec::segment(dst, PROVISIONER)));
    let outputs = h.advance(h.provisioner.settings().transaction_timeout_ms);

    assert!(events(&outputs).contains(&CoreEvent::TransactionFailed {
        dst,
        step: Some(ConfigStep::CompositionData),
        reason: TransactionFailure::IncompleteSegments,
    }));
    assert!(events(&outputs).iter().any(|e| matches!(
        e,
        CoreEvent::Failure {
            kind: FailureKind::Timeout,
            ..
        }
    )));
    // the late response no longer counts
    let outputs = h.node(
        dst,
        MeshMessage::CompositionDataStatus {
            page: 0,
            data: Vec::new(),
        },
    );
    assert!(!events(&outputs)
        .iter()
        .any(|e| matches!(e, CoreEvent::ConfigurationStepCompleted { .. })));
}

#[test]
fn test_silent_node_times_out() {
    let mut h = Harness::new(network(false));
    h.provision_no_oob();
    let dst = h.node_record().range.primary();
    h.reconnect();

    assert!(h.advance(h.provisioner.settings().transaction_timeout_ms - 1).is_empty());
    let outputs = h.advance(1);
    assert!(events(&outputs).contains(&CoreEvent::TransactionFailed {
        dst,
        step: Some(ConfigStep::CompositionData),
        reason: TransactionFailure::Timeout,
    }));
    assert_eq!(
        h.provisioner.session().unwrap().abandoned_step,
        Some(ConfigStep::CompositionData)
    );
}

#[test]
fn test_lower_transport_failure_ends_transaction_early() {
    let mut h = Harness::new(network(false));
    h.provision_no_oob();
    let dst = h.node_record().range.primary();
    h.reconnect();

    let outputs = h.apply(Input::LowerTransportFailed {
        src: dst,
        incomplete_timer_expired: true,
    });
    assert!(events(&outputs).contains(&CoreEvent::TransactionFailed {
        dst,
        step: Some(ConfigStep::CompositionData),
        reason: TransactionFailure::IncompleteSegments,
    }));
    assert!(h.provisioner.next_deadline().is_none());
}

#[test]
fn test_only_first_matching_advertisement_connects() {
    let mut h = Harness::new(network(false));
    h.provision_no_oob();
    let node = h.node_record();
    h.advance(h.provisioner.settings().reconnect_grace_ms);

    let stranger = NodeRecord {
        identity: DeviceIdentity::random(),
        name: "other".into(),
        range: node.range,
    };
    let mut outputs = Vec::new();
    outputs.extend(h.apply(Input::Advertisement(identity_advertisement("01", &stranger))));
    outputs.extend(h.apply(Input::Advertisement(Advertisement {
        service_uuids: Vec::new(),
        ..identity_advertisement("02", &node)
    })));
    outputs.extend(h.apply(Input::Advertisement(identity_advertisement("03", &node))));
    outputs.extend(h.apply(Input::Advertisement(identity_advertisement("04", &node))));
    outputs.extend(h.apply(Input::Advertisement(identity_advertisement("05", &stranger))));
    outputs.extend(h.advance(h.provisioner.settings().pre_connect_delay_ms));

    let connects: Vec<_> = outputs
        .iter()
        .filter_map(|o| match o.as_link() {
            Some(LinkCommand::Connect(device)) => Some(device.address.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(connects, vec!["03".to_string()]);
    assert_eq!(h.provisioner.session().unwrap().device().address, "03");
}

#[test]
fn test_scan_timeout_reports_node_not_found() {
    let mut h = Harness::new(network(false));
    h.provision_no_oob();
    h.advance(h.provisioner.settings().reconnect_grace_ms);

    let outputs = h.advance(h.provisioner.settings().reconnect_scan_timeout_ms);
    assert!(outputs.contains(&Output::Scan(ScanCommand::Stop)));
    assert!(events(&outputs).contains(&CoreEvent::Failure {
        kind: FailureKind::Timeout,
        message: "Reconnecting failed: node not found, configuration not finished".into(),
    }));
    assert!(events(&outputs).contains(&CoreEvent::ReconnectOutcome(ReconnectOutcome::Timeout)));
    assert_eq!(h.state(), ProvisioningState::ProvisioningComplete);
}

#[test]
fn test_link_loss_during_configuration_can_resume() {
    let mut h = Harness::new(network(false));
    h.provision_no_oob();
    let dst = h.node_record().range.primary();
    h.reconnect();
    h.node(
        dst,
        MeshMessage::CompositionDataStatus {
            page: 0,
            data: Vec::new(),
        },
    );

    let outputs = h.link(LinkEvent::LinkLoss);
    assert!(events(&outputs).contains(&CoreEvent::ConfigurationInterrupted {
        step: ConfigStep::DefaultTtl
    }));
    assert_eq!(h.state(), ProvisioningState::DefaultTtlRequested);
    assert!(h.provisioner.next_deadline().is_none());
    assert_eq!(
        h.provisioner.resume_configuration(),
        Err(CoreError::NotConnected)
    );

    h.provisioner.connect_node().unwrap();
    let outputs = h.reconnect();
    // the abandoned step waits for an explicit resume
    assert!(messages(&outputs).is_empty());

    assert_eq!(h.provisioner.resume_configuration(), Ok(ConfigStep::DefaultTtl));
    let outputs = h.provisioner.drain_outputs();
    assert_eq!(messages(&outputs), vec![(dst, MeshMessage::DefaultTtlGet)]);
}

#[test]
fn test_response_from_other_node_is_ignored() {
    let mut h = Harness::new(network(false));
    h.provision_no_oob();
    h.reconnect();

    let outputs = h.node(
        MeshAddress(0x0100),
        MeshMessage::CompositionDataStatus {
            page: 0,
            data: Vec::new(),
        },
    );
    assert!(matches!(
        events(&outputs).as_slice(),
        [CoreEvent::MeshMessageReceived { .. }]
    ));
    assert_eq!(h.state(), ProvisioningState::CompositionDataRequested);
}

#[test]
fn test_proxy_configuration_from_node_is_not_a_config_response() {
    let mut h = Harness::new(network(false));
    h.provision_no_oob();
    let dst = h.node_record().range.primary();
    h.reconnect();
    let deadline = h.provisioner.next_deadline();

    let outputs = h.node(
        dst,
        MeshMessage::ProxySetFilterType {
            filter_type: meshprov_core::FilterType::ExclusionList,
        },
    );
    assert!(matches!(
        events(&outputs).as_slice(),
        [CoreEvent::MeshMessageReceived { .. }]
    ));
    assert!(messages(&outputs).is_empty());
    assert_eq!(h.state(), ProvisioningState::CompositionDataRequested);
    assert_eq!(h.provisioner.next_deadline(), deadline);
}

#[test]
fn test_device_failure_pdu_is_terminal() {
    let mut h = Harness::new(network(false));
    h.open(ProvisioningCapabilities::no_oob(1));
    h.provisioner.start_provisioning(None).unwrap();
    h.provisioner.drain_outputs();

    let outputs = h.device(ProvisioningPdu::Failed { code: 0x04 });
    assert_eq!(states(&outputs), vec![ProvisioningState::ProvisioningFailed]);
    assert!(outputs.contains(&Output::Link(LinkCommand::Disconnect)));
    let session = h.provisioner.session().unwrap();
    assert_eq!(
        session.failure_reason.as_deref(),
        Some("Device reported failure: Confirmation failed")
    );

    // nothing moves a failed session
    assert!(h.device(ProvisioningPdu::Complete).is_empty());
}

#[test]
fn test_method_choice_required_when_device_offers_several() {
    let mut h = Harness::new(network(false));
    let mut capabilities = ProvisioningCapabilities::no_oob(2);
    capabilities.static_oob = true;
    h.open(capabilities);

    assert_eq!(
        h.provisioner.start_provisioning(None),
        Err(CoreError::Capability(CapabilityError::ChoiceRequired(2)))
    );
    assert_eq!(h.state(), ProvisioningState::CapabilitiesReceived);
    assert_eq!(
        events(&h.provisioner.drain_outputs()),
        vec![CoreEvent::Failure {
            kind: FailureKind::Validation,
            message: CapabilityError::ChoiceRequired(2).to_string(),
        }]
    );

    assert_eq!(
        h.provisioner.start_provisioning(Some(AuthMethod::StaticOob)),
        Ok(AuthMethod::StaticOob)
    );
    let outputs = h.device(ProvisioningPdu::PublicKey);
    assert_eq!(
        states(&outputs),
        vec![
            ProvisioningState::PublicKeyExchanged,
            ProvisioningState::AuthenticationWaiting
        ]
    );
    assert!(requests(&outputs).is_empty());
}

#[test]
fn test_zero_pre_connect_delay_connects_on_match() {
    let settings = ProvisionerSettings {
        pre_connect_delay_ms: 0,
        ..Default::default()
    };
    let mut h = Harness::with_settings(network(false), settings);
    h.provision_no_oob();
    let node = h.node_record();
    h.advance(h.provisioner.settings().reconnect_grace_ms);

    let outputs = h.apply(Input::Advertisement(identity_advertisement("77", &node)));
    assert!(outputs
        .iter()
        .any(|o| matches!(o.as_link(), Some(LinkCommand::Connect(device)) if device.address == "77")));
}
