/// Proxy filter manager
///
/// Tracks the address filter installed on the proxy node the client is attached
/// to. Every request is pipelined as an "intent" derived from the previous
/// intent; the device answers each request with a Filter Status carrying the
/// filter type and list size, and only a matching status promotes an intent to
/// confirmed state. Nothing is reported as filtered before that.

use crate::model::{AddressError, MeshAddress};
use crate::transport::MeshMessage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("No proxy connection")]
    NotConnected,
    #[error("Address list is empty")]
    EmptyAddressList,
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterType {
    /// Relay only traffic to listed addresses
    InclusionList,
    /// Relay everything except traffic to listed addresses
    ExclusionList,
}

impl Default for FilterType {
    fn default() -> Self {
        FilterType::InclusionList
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterType::InclusionList => write!(f, "Inclusion List"),
            FilterType::ExclusionList => write!(f, "Exclusion List"),
        }
    }
}

/// Filter type plus the address list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterState {
    pub filter_type: FilterType,
    pub addresses: BTreeSet<MeshAddress>,
}

impl FilterState {
    pub fn empty(filter_type: FilterType) -> Self {
        Self {
            filter_type,
            addresses: BTreeSet::new(),
        }
    }

    /// Whether a Filter Status confirms this state
    pub fn matches_status(&self, filter_type: FilterType, list_size: u16) -> bool {
        self.filter_type == filter_type && self.addresses.len() == list_size as usize
    }
}

/// What a Filter Status did to the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    /// The oldest pending intent is now confirmed
    Confirmed(FilterState),
    /// The status contradicts the oldest pending intent; all intents dropped
    Rejected {
        expected: FilterState,
        filter_type: FilterType,
        list_size: u16,
    },
    /// Nothing was pending
    Unsolicited,
}

#[derive(Debug, Default)]
pub struct ProxyFilterManager {
    connected: bool,
    proxy_address: Option<MeshAddress>,
    confirmed: Option<FilterState>,
    /// Type from the last status whose list could not be reconstructed
    reported_type: Option<FilterType>,
    in_flight: VecDeque<FilterState>,
}

impl ProxyFilterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A proxy link became ready; nothing carries over from earlier links
    pub fn on_connected(&mut self) {
        self.reset();
        self.connected = true;
    }

    /// The proxy link is gone. Returns true if any filter state was dropped.
    pub fn on_disconnected(&mut self) -> bool {
        let had_state = self.confirmed.is_some() || !self.in_flight.is_empty();
        self.reset();
        self.connected = false;
        had_state
    }

    fn reset(&mut self) {
        self.proxy_address = None;
        self.confirmed = None;
        self.reported_type = None;
        self.in_flight.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn proxy_address(&self) -> Option<MeshAddress> {
        self.proxy_address
    }

    /// Device-confirmed state, `None` while unknown
    pub fn confirmed(&self) -> Option<&FilterState> {
        self.confirmed.as_ref()
    }

    pub fn pending_requests(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether the device has confirmed `address` is in its list
    pub fn is_filtered(&self, address: MeshAddress) -> bool {
        self.confirmed
            .as_ref()
            .map_or(false, |state| state.addresses.contains(&address))
    }

    /// The state the device will have once every pending request is applied.
    /// A fresh proxy connection starts with an empty inclusion list.
    pub fn latest_intent(&self) -> FilterState {
        match self.in_flight.back().or(self.confirmed.as_ref()) {
            Some(state) => state.clone(),
            None => FilterState::empty(self.reported_type.unwrap_or_default()),
        }
    }

    pub fn set_filter_type(&mut self, filter_type: FilterType) -> Result<MeshMessage, FilterError> {
        self.ensure_connected()?;
        // Set Filter Type also clears the list on the device
        self.in_flight.push_back(FilterState::empty(filter_type));
        debug!("Proxy filter: set type {}", filter_type);
        Ok(MeshMessage::ProxySetFilterType { filter_type })
    }

    pub fn add_addresses(&mut self, addresses: &[MeshAddress]) -> Result<MeshMessage, FilterError> {
        self.ensure_connected()?;
        let addresses = validate(addresses)?;

        let mut intent = self.latest_intent();
        intent.addresses.extend(addresses.iter().copied());
        self.in_flight.push_back(intent);

        debug!("Proxy filter: add {} address(es)", addresses.len());
        Ok(MeshMessage::ProxyAddAddresses { addresses })
    }

    pub fn remove_addresses(&mut self, addresses: &[MeshAddress]) -> Result<MeshMessage, FilterError> {
        self.ensure_connected()?;
        let addresses = validate(addresses)?;

        let mut intent = self.latest_intent();
        for address in &addresses {
            intent.addresses.remove(address);
        }
        self.in_flight.push_back(intent);

        debug!("Proxy filter: remove {} address(es)", addresses.len());
        Ok(MeshMessage::ProxyRemoveAddresses { addresses })
    }

    /// Forget the most recent request (it never left the device)
    pub fn discard_latest(&mut self) -> Option<FilterState> {
        self.in_flight.pop_back()
    }

    /// Remove every address. No message when the confirmed list is empty or unknown.
    pub fn clear_all(&mut self) -> Result<Option<MeshMessage>, FilterError> {
        self.ensure_connected()?;
        let confirmed = match &self.confirmed {
            Some(state) if !state.addresses.is_empty() => state.addresses.clone(),
            _ => {
                debug!("Proxy filter: clear skipped, confirmed list is empty");
                return Ok(None);
            }
        };

        let mut all: BTreeSet<MeshAddress> = confirmed;
        all.extend(self.latest_intent().addresses);
        let addresses: Vec<MeshAddress> = all.into_iter().collect();
        self.remove_addresses(&addresses).map(Some)
    }

    /// Turn filtering off: an empty inclusion list instead of a stale exclusion list
    pub fn disable(&mut self) -> Result<MeshMessage, FilterError> {
        self.set_filter_type(FilterType::InclusionList)
    }

    /// Reconcile with a Filter Status from `src`
    pub fn on_status(&mut self, src: MeshAddress, filter_type: FilterType, list_size: u16) -> StatusOutcome {
        self.proxy_address = Some(src);

        match self.in_flight.pop_front() {
            Some(expected) if expected.matches_status(filter_type, list_size) => {
                info!(
                    "Proxy filter confirmed by {}: {} with {} address(es)",
                    src, filter_type, list_size
                );
                self.confirmed = Some(expected.clone());
                self.reported_type = None;
                StatusOutcome::Confirmed(expected)
            }
            Some(expected) => {
                warn!(
                    "Proxy filter status from {} ({} / {}) does not match request ({} / {}), dropping {} pending request(s)",
                    src,
                    filter_type,
                    list_size,
                    expected.filter_type,
                    expected.addresses.len(),
                    self.in_flight.len()
                );
                self.in_flight.clear();
                // the type is known, the addresses only when the list is empty
                self.reported_type = Some(filter_type);
                self.confirmed = if list_size == 0 {
                    Some(FilterState::empty(filter_type))
                } else {
                    None
                };
                StatusOutcome::Rejected {
                    expected,
                    filter_type,
                    list_size,
                }
            }
            None => {
                if list_size == 0 {
                    self.confirmed = Some(FilterState::empty(filter_type));
                }
                debug!("Unsolicited proxy filter status from {}", src);
                StatusOutcome::Unsolicited
            }
        }
    }

    /// Confirmed filter as reported to the UI
    pub fn snapshot(&self) -> (Option<FilterType>, Vec<MeshAddress>) {
        match &self.confirmed {
            Some(state) => (
                Some(state.filter_type),
                state.addresses.iter().copied().collect(),
            ),
            None => (self.reported_type, Vec::new()),
        }
    }

    fn ensure_connected(&self) -> Result<(), FilterError> {
        if self.connected {
            Ok(())
        } else {
            Err(FilterError::NotConnected)
        }
    }
}

/// Reject empty lists and non-filterable addresses; drop duplicates keeping order
fn validate(addresses: &[MeshAddress]) -> Result<Vec<MeshAddress>, FilterError> {
    if addresses.is_empty() {
        return Err(FilterError::EmptyAddressList);
    }
    let mut seen = BTreeSet::new();
    let mut unique = Vec::with_capacity(addresses.len());
    for address in addresses {
        address.ensure_filterable()?;
        if seen.insert(*address) {
            unique.push(*address);
        }
    }
    Ok(unique)
}
