// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-node resource provision.
//!
//! A resource-holding kernel declares the resources it needs through
//! [`crate::node::Kernel::rspec`]; the context worker provisions exactly
//! that subset from its [`ResourceMap`] when the node starts.

use crate::bus::NotifyBus;
use crate::error::Error;
use flowmesh_config::Endpoints;
use flowmesh_data::SegmentManager;

bitflags::bitflags! {
    /// The set of resources a kernel can request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceSpec: u8 {
        /// The in-process notification bus (messaging context).
        const BUS = 1;
        /// The per-publisher notification address prefix.
        const MC_URL = 1 << 1;
        /// The orchestrator's control lane address.
        const ORCH_TX_URL = 1 << 2;
        /// The orchestrator's readiness lane address.
        const ORCH_RX_URL = 1 << 3;
        /// The orchestration API. Declared for completeness; never
        /// provisioned by a context worker.
        const ORCH_API = 1 << 4;
        /// The shared-memory segment manager.
        const SMM = 1 << 5;
    }
}

/// The full resource set held by a context worker.
#[derive(Clone)]
pub struct ResourceMap {
    bus: NotifyBus,
    endpoints: Endpoints,
    smm: SegmentManager,
}

impl ResourceMap {
    /// Builds the worker-side resource map.
    #[must_use]
    pub fn new(bus: NotifyBus, endpoints: Endpoints, smm: SegmentManager) -> Self {
        Self {
            bus,
            endpoints,
            smm,
        }
    }

    /// Provisions exactly the requested subset.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceUnavailable`] when the request names a resource a
    /// context worker cannot provide.
    pub fn subset(&self, spec: ResourceSpec) -> Result<Resources, Error> {
        if spec.contains(ResourceSpec::ORCH_API) {
            return Err(Error::ResourceUnavailable {
                resource: ResourceSpec::ORCH_API,
            });
        }
        Ok(Resources {
            spec,
            bus: spec.contains(ResourceSpec::BUS).then(|| self.bus.clone()),
            mc_url: spec
                .contains(ResourceSpec::MC_URL)
                .then(|| self.endpoints.mc_url_base.clone()),
            orch_tx_url: spec
                .contains(ResourceSpec::ORCH_TX_URL)
                .then(|| self.endpoints.tx_url.clone()),
            orch_rx_url: spec
                .contains(ResourceSpec::ORCH_RX_URL)
                .then(|| self.endpoints.rx_url.clone()),
            smm: spec.contains(ResourceSpec::SMM).then(|| self.smm.clone()),
        })
    }
}

/// The resources handed to a kernel at start time.
///
/// Accessors return [`Error::MissingResource`] when the kernel reaches for
/// something outside its declared spec, a programmer error caught at the
/// cheapest boundary.
pub struct Resources {
    spec: ResourceSpec,
    bus: Option<NotifyBus>,
    mc_url: Option<String>,
    orch_tx_url: Option<String>,
    orch_rx_url: Option<String>,
    smm: Option<SegmentManager>,
}

impl Resources {
    /// An empty provision, for kernels with no resource needs.
    #[must_use]
    pub fn none() -> Self {
        Self {
            spec: ResourceSpec::empty(),
            bus: None,
            mc_url: None,
            orch_tx_url: None,
            orch_rx_url: None,
            smm: None,
        }
    }

    /// The provisioned set.
    #[must_use]
    pub fn provided(&self) -> ResourceSpec {
        self.spec
    }

    /// The notification bus.
    ///
    /// # Errors
    ///
    /// [`Error::MissingResource`] when `BUS` was not requested.
    pub fn bus(&self) -> Result<&NotifyBus, Error> {
        self.bus.as_ref().ok_or(Error::MissingResource {
            resource: ResourceSpec::BUS,
        })
    }

    /// The notification address prefix.
    ///
    /// # Errors
    ///
    /// [`Error::MissingResource`] when `MC_URL` was not requested.
    pub fn mc_url(&self) -> Result<&str, Error> {
        self.mc_url.as_deref().ok_or(Error::MissingResource {
            resource: ResourceSpec::MC_URL,
        })
    }

    /// The orchestrator control lane address.
    ///
    /// # Errors
    ///
    /// [`Error::MissingResource`] when `ORCH_TX_URL` was not requested.
    pub fn orch_tx_url(&self) -> Result<&str, Error> {
        self.orch_tx_url.as_deref().ok_or(Error::MissingResource {
            resource: ResourceSpec::ORCH_TX_URL,
        })
    }

    /// The orchestrator readiness lane address.
    ///
    /// # Errors
    ///
    /// [`Error::MissingResource`] when `ORCH_RX_URL` was not requested.
    pub fn orch_rx_url(&self) -> Result<&str, Error> {
        self.orch_rx_url.as_deref().ok_or(Error::MissingResource {
            resource: ResourceSpec::ORCH_RX_URL,
        })
    }

    /// The segment manager.
    ///
    /// # Errors
    ///
    /// [`Error::MissingResource`] when `SMM` was not requested.
    pub fn smm(&self) -> Result<&SegmentManager, Error> {
        self.smm.as_ref().ok_or(Error::MissingResource {
            resource: ResourceSpec::SMM,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> ResourceMap {
        ResourceMap::new(NotifyBus::new(), Endpoints::default(), SegmentManager::new())
    }

    #[test]
    fn subset_provisions_exactly_the_request() {
        let res = map()
            .subset(ResourceSpec::SMM | ResourceSpec::MC_URL)
            .expect("subset");
        assert_eq!(res.provided(), ResourceSpec::SMM | ResourceSpec::MC_URL);
        assert!(res.smm().is_ok());
        assert!(res.mc_url().is_ok());
        assert!(matches!(res.bus(), Err(Error::MissingResource { .. })));
    }

    #[test]
    fn orch_api_is_never_provisioned() {
        assert!(matches!(
            map().subset(ResourceSpec::ORCH_API),
            Err(Error::ResourceUnavailable { .. })
        ));
    }

    #[test]
    fn empty_provision_denies_everything() {
        let res = Resources::none();
        assert!(res.provided().is_empty());
        assert!(res.smm().is_err());
    }
}
