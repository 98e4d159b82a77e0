/// Provisioning capabilities and authentication method selection
///
/// The capabilities PDU is the device's one-shot self description. It fixes the
/// element count (and therefore the size of the unicast range) and the set of
/// OOB authentication methods the provisioner may choose from.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Largest OOB size the mesh profile allows
pub const MAX_OOB_SIZE: u8 = 8;

/// Static OOB values are 16 octets
pub const STATIC_OOB_LENGTH: usize = 16;

/// Errors for capability validation and method selection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Device reports zero elements")]
    NoElements,
    #[error("Authentication method must be chosen, device offers {0} methods")]
    ChoiceRequired(usize),
    #[error("Authentication method {0} is not supported by the device")]
    Unsupported(AuthMethodKind),
    #[error("OOB action {0} is not advertised by the device")]
    UnsupportedAction(String),
    #[error("OOB size {requested} outside 1..={advertised}")]
    InvalidSize { requested: u8, advertised: u8 },
    #[error("Invalid authentication value: {0}")]
    InvalidValue(String),
}

/// Output OOB actions (device -> user)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputAction {
    Blink,
    Beep,
    Vibrate,
    OutputNumeric,
    OutputAlphanumeric,
}

/// Input OOB actions (user -> device)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputAction {
    Push,
    Twist,
    InputNumeric,
    InputAlphanumeric,
}

/// Authentication method family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMethodKind {
    NoOob,
    StaticOob,
    OutputOob,
    InputOob,
}

impl fmt::Display for AuthMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethodKind::NoOob => write!(f, "No OOB"),
            AuthMethodKind::StaticOob => write!(f, "Static OOB"),
            AuthMethodKind::OutputOob => write!(f, "Output OOB"),
            AuthMethodKind::InputOob => write!(f, "Input OOB"),
        }
    }
}

/// Fully specified authentication method sent in the Start PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    NoOob,
    StaticOob,
    OutputOob { action: OutputAction, size: u8 },
    InputOob { action: InputAction, size: u8 },
}

impl AuthMethod {
    pub fn kind(&self) -> AuthMethodKind {
        match self {
            AuthMethod::NoOob => AuthMethodKind::NoOob,
            AuthMethod::StaticOob => AuthMethodKind::StaticOob,
            AuthMethod::OutputOob { .. } => AuthMethodKind::OutputOob,
            AuthMethod::InputOob { .. } => AuthMethodKind::InputOob,
        }
    }

    /// Whether the user must type something on the provisioner
    pub fn needs_user_value(&self) -> bool {
        matches!(self, AuthMethod::StaticOob | AuthMethod::OutputOob { .. })
    }

    /// Parse what the user typed for Static or Output OOB
    pub fn parse_user_value(&self, input: &str) -> Result<AuthValue, CapabilityError> {
        let input = input.trim();
        match *self {
            AuthMethod::StaticOob => {
                let bytes = hex::decode(input)
                    .map_err(|e| CapabilityError::InvalidValue(e.to_string()))?;
                if bytes.len() != STATIC_OOB_LENGTH {
                    return Err(CapabilityError::InvalidValue(format!(
                        "static OOB must be {} bytes, got {}",
                        STATIC_OOB_LENGTH,
                        bytes.len()
                    )));
                }
                Ok(AuthValue::Static(bytes))
            }
            AuthMethod::OutputOob { action, size } => {
                if action == OutputAction::OutputAlphanumeric {
                    parse_alphanumeric(input, size)
                } else {
                    parse_numeric(input, size)
                }
            }
            AuthMethod::NoOob | AuthMethod::InputOob { .. } => Err(CapabilityError::InvalidValue(
                format!("{} does not take a user value", self.kind()),
            )),
        }
    }

    /// Generate the value the user has to enter on the device (Input OOB)
    pub fn generate_input_value<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<AuthValue> {
        let AuthMethod::InputOob { action, size } = *self else {
            return None;
        };
        let size = size.clamp(1, MAX_OOB_SIZE);
        if action == InputAction::InputAlphanumeric {
            const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
            let value: String = (0..size)
                .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
                .collect();
            Some(AuthValue::Alphanumeric(value))
        } else {
            let upper = 10u64.pow(size as u32).min(u32::MAX as u64) as u32;
            Some(AuthValue::Numeric(rng.gen_range(1..upper)))
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::OutputOob { action, size } => write!(f, "Output OOB ({:?}, {})", action, size),
            AuthMethod::InputOob { action, size } => write!(f, "Input OOB ({:?}, {})", action, size),
            other => write!(f, "{}", other.kind()),
        }
    }
}

fn parse_numeric(input: &str, size: u8) -> Result<AuthValue, CapabilityError> {
    if input.is_empty() || input.len() > size as usize || !input.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CapabilityError::InvalidValue(format!(
            "expected up to {} digits",
            size
        )));
    }
    input
        .parse::<u32>()
        .map(AuthValue::Numeric)
        .map_err(|e| CapabilityError::InvalidValue(e.to_string()))
}

fn parse_alphanumeric(input: &str, size: u8) -> Result<AuthValue, CapabilityError> {
    if input.is_empty()
        || input.len() > size as usize
        || !input.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(CapabilityError::InvalidValue(format!(
            "expected up to {} alphanumeric characters",
            size
        )));
    }
    Ok(AuthValue::Alphanumeric(input.to_ascii_uppercase()))
}

/// Authentication value handed to the crypto engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthValue {
    Static(Vec<u8>),
    Numeric(u32),
    Alphanumeric(String),
}

impl fmt::Display for AuthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthValue::Static(bytes) => write!(f, "{}", hex::encode_upper(bytes)),
            AuthValue::Numeric(n) => write!(f, "{}", n),
            AuthValue::Alphanumeric(s) => write!(f, "{}", s),
        }
    }
}

/// Capability snapshot reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningCapabilities {
    pub element_count: u8,
    /// Device public key is available out-of-band
    pub public_key_oob: bool,
    pub static_oob: bool,
    pub output_oob_size: u8,
    pub output_actions: Vec<OutputAction>,
    pub input_oob_size: u8,
    pub input_actions: Vec<InputAction>,
}

impl ProvisioningCapabilities {
    /// Capabilities of a device that only supports No OOB
    pub fn no_oob(element_count: u8) -> Self {
        Self {
            element_count,
            public_key_oob: false,
            static_oob: false,
            output_oob_size: 0,
            output_actions: Vec::new(),
            input_oob_size: 0,
            input_actions: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), CapabilityError> {
        if self.element_count == 0 {
            return Err(CapabilityError::NoElements);
        }
        Ok(())
    }

    /// Authentication families the device advertises; No OOB is always available
    pub fn supported_methods(&self) -> Vec<AuthMethodKind> {
        let mut methods = vec![AuthMethodKind::NoOob];
        if self.static_oob {
            methods.push(AuthMethodKind::StaticOob);
        }
        if self.output_oob_size > 0 && !self.output_actions.is_empty() {
            methods.push(AuthMethodKind::OutputOob);
        }
        if self.input_oob_size > 0 && !self.input_actions.is_empty() {
            methods.push(AuthMethodKind::InputOob);
        }
        methods
    }

    /// Resolve the method to use: validate an explicit choice, or auto-select
    /// when the device offers exactly one family.
    pub fn select(&self, choice: Option<AuthMethod>) -> Result<AuthMethod, CapabilityError> {
        self.validate()?;
        let supported = self.supported_methods();

        let Some(choice) = choice else {
            return match supported.as_slice() {
                [only] => Ok(self.default_method(*only)),
                many => Err(CapabilityError::ChoiceRequired(many.len())),
            };
        };

        if !supported.contains(&choice.kind()) {
            return Err(CapabilityError::Unsupported(choice.kind()));
        }

        match choice {
            AuthMethod::OutputOob { action, size } => {
                if !self.output_actions.contains(&action) {
                    return Err(CapabilityError::UnsupportedAction(format!("{:?}", action)));
                }
                check_size(size, self.output_oob_size)?;
            }
            AuthMethod::InputOob { action, size } => {
                if !self.input_actions.contains(&action) {
                    return Err(CapabilityError::UnsupportedAction(format!("{:?}", action)));
                }
                check_size(size, self.input_oob_size)?;
            }
            AuthMethod::NoOob | AuthMethod::StaticOob => {}
        }
        Ok(choice)
    }

    fn default_method(&self, kind: AuthMethodKind) -> AuthMethod {
        match kind {
            AuthMethodKind::NoOob => AuthMethod::NoOob,
            AuthMethodKind::StaticOob => AuthMethod::StaticOob,
            AuthMethodKind::OutputOob => AuthMethod::OutputOob {
                action: self.output_actions[0],
                size: self.output_oob_size.min(MAX_OOB_SIZE),
            },
            AuthMethodKind::InputOob => AuthMethod::InputOob {
                action: self.input_actions[0],
                size: self.input_oob_size.min(MAX_OOB_SIZE),
            },
        }
    }
}

fn check_size(requested: u8, advertised: u8) -> Result<(), CapabilityError> {
    let advertised = advertised.min(MAX_OOB_SIZE);
    if requested == 0 || requested > advertised {
        return Err(CapabilityError::InvalidSize {
            requested,
            advertised,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rich_caps() -> ProvisioningCapabilities {
        ProvisioningCapabilities {
            element_count: 2,
            public_key_oob: false,
            static_oob: true,
            output_oob_size: 4,
            output_actions: vec![OutputAction::Blink, OutputAction::OutputAlphanumeric],
            input_oob_size: 2,
            input_actions: vec![InputAction::Push],
        }
    }

    #[test]
    fn test_no_oob_only_is_auto_selected() {
        let caps = ProvisioningCapabilities::no_oob(1);
        assert_eq!(caps.supported_methods(), vec![AuthMethodKind::NoOob]);
        assert_eq!(caps.select(None).unwrap(), AuthMethod::NoOob);
    }

    #[test]
    fn test_multiple_methods_require_choice() {
        let caps = rich_caps();
        assert_eq!(caps.select(None), Err(CapabilityError::ChoiceRequired(4)));
        assert_eq!(caps.select(Some(AuthMethod::StaticOob)).unwrap(), AuthMethod::StaticOob);
    }

    #[test]
    fn test_choice_must_be_advertised() {
        let caps = ProvisioningCapabilities::no_oob(1);
        assert_eq!(
            caps.select(Some(AuthMethod::StaticOob)),
            Err(CapabilityError::Unsupported(AuthMethodKind::StaticOob))
        );

        let caps = rich_caps();
        assert!(matches!(
            caps.select(Some(AuthMethod::OutputOob {
                action: OutputAction::Beep,
                size: 2
            })),
            Err(CapabilityError::UnsupportedAction(_))
        ));
        assert_eq!(
            caps.select(Some(AuthMethod::OutputOob {
                action: OutputAction::Blink,
                size: 5
            })),
            Err(CapabilityError::InvalidSize {
                requested: 5,
                advertised: 4
            })
        );
    }

    #[test]
    fn test_zero_elements_rejected() {
        let caps = ProvisioningCapabilities::no_oob(0);
        assert_eq!(caps.select(None), Err(CapabilityError::NoElements));
    }

    #[test]
    fn test_parse_user_values() {
        let static_oob = AuthMethod::StaticOob;
        assert!(static_oob.parse_user_value(&"00".repeat(16)).is_ok());
        assert!(static_oob.parse_user_value("0011").is_err());

        let numeric = AuthMethod::OutputOob {
            action: OutputAction::Blink,
            size: 2,
        };
        assert_eq!(numeric.parse_user_value("42").unwrap(), AuthValue::Numeric(42));
        assert!(numeric.parse_user_value("123").is_err());
        assert!(numeric.parse_user_value("4a").is_err());

        let alpha = AuthMethod::OutputOob {
            action: OutputAction::OutputAlphanumeric,
            size: 4,
        };
        assert_eq!(
            alpha.parse_user_value("ab1").unwrap(),
            AuthValue::Alphanumeric("AB1".to_string())
        );
        assert!(AuthMethod::NoOob.parse_user_value("1").is_err());
    }

    #[test]
    fn test_generate_input_value_respects_size() {
        let mut rng = rand::thread_rng();
        let method = AuthMethod::InputOob {
            action: InputAction::Push,
            size: 1,
        };
        for _ in 0..50 {
            match method.generate_input_value(&mut rng) {
                Some(AuthValue::Numeric(n)) => assert!((1..10).contains(&n)),
                other => panic!("unexpected value {:?}", other),
            }
        }

        let alpha = AuthMethod::InputOob {
            action: InputAction::InputAlphanumeric,
            size: 6,
        };
        match alpha.generate_input_value(&mut rng) {
            Some(AuthValue::Alphanumeric(s)) => assert_eq!(s.len(), 6),
            other => panic!("unexpected value {:?}", other),
        }

        assert!(AuthMethod::NoOob.generate_input_value(&mut rng).is_none());
    }
}
