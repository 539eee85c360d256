//! BLE Connection Module
//!
//! Link bookkeeping for the binding and the platform readiness strategy.
//!
//! On one platform the SDK's command protocol is usable as soon as the link
//! is up. On the other an asynchronous "service deployed" handshake must
//! complete first. The difference is captured once in [`Platform`] and
//! surfaced to callers as a single `service_ready` flag.

use crate::domain::models::{DeviceError, DeviceModel, ErrorCode};
use crate::domain::settings::PlatformKind;
use crate::infrastructure::bluetooth::protocol::ProgressUnit;
use tracing::{debug, info};

/// Readiness strategy, selected when the binding is constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Service ready immediately on link establishment
    ReadyOnLink,
    /// Service ready only after the SDK reports its service deployed
    Handshake,
}

impl Platform {
    pub fn ready_on_link(self) -> bool {
        matches!(self, Self::ReadyOnLink)
    }

    /// A generic BLE central sees every advertiser; the ring SDK pre-filters
    pub fn filters_scan_names(self) -> bool {
        matches!(self, Self::Handshake)
    }

    /// Whether a device never seen in a scan may still be connected by id
    pub fn can_retrieve_unscanned(self) -> bool {
        matches!(self, Self::Handshake)
    }

    pub fn progress_unit(self) -> ProgressUnit {
        match self {
            Self::ReadyOnLink => ProgressUnit::Percent,
            Self::Handshake => ProgressUnit::Fraction,
        }
    }
}

impl From<PlatformKind> for Platform {
    fn from(kind: PlatformKind) -> Self {
        match kind {
            PlatformKind::Android => Self::ReadyOnLink,
            PlatformKind::Ios => Self::Handshake,
        }
    }
}

/// The currently linked device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLink {
    pub mac: String,
    pub model: DeviceModel,
    pub service_ready: bool,
}

/// Pending and active link of the binding
#[derive(Debug, Default)]
pub struct LinkState {
    pending: Option<(String, DeviceModel)>,
    active: Option<ActiveLink>,
}

impl LinkState {
    pub fn begin_connect(&mut self, mac: &str, model: DeviceModel) {
        info!(mac, model, "Connecting to device");
        self.pending = Some((mac.to_string(), model));
        self.active = None;
    }

    /// Link established. The model comes from the pending connect when it
    /// targets the same device.
    pub fn on_link_up(&mut self, mac: &str, fallback_model: DeviceModel, platform: Platform) -> ActiveLink {
        let model = match self.pending.take() {
            Some((pending_mac, model)) if pending_mac == mac => model,
            _ => fallback_model,
        };
        let link = ActiveLink {
            mac: mac.to_string(),
            model,
            service_ready: platform.ready_on_link(),
        };
        self.active = Some(link.clone());
        link
    }

    /// Returns the link if `mac` was the active device
    pub fn on_link_down(&mut self, mac: &str) -> Option<ActiveLink> {
        if matches!(&self.pending, Some((pending_mac, _)) if pending_mac == mac) {
            self.pending = None;
        }
        match &self.active {
            Some(link) if link.mac == mac => self.active.take(),
            _ => None,
        }
    }

    pub fn on_connect_failed(&mut self) {
        self.pending = None;
    }

    /// Returns the link when this call made it ready
    pub fn mark_service_ready(&mut self) -> Option<&ActiveLink> {
        match self.active.as_mut() {
            Some(link) if !link.service_ready => {
                link.service_ready = true;
                Some(link)
            }
            Some(_) => {
                debug!("Service already ready");
                None
            }
            None => None,
        }
    }

    /// Forget the pending or active device, returning what to tear down
    pub fn take(&mut self) -> Option<(String, DeviceModel)> {
        let pending = self.pending.take();
        match self.active.take() {
            Some(link) => Some((link.mac, link.model)),
            None => pending,
        }
    }

    pub fn is_service_ready(&self) -> bool {
        self.active.as_ref().is_some_and(|l| l.service_ready)
    }

    /// Data operations need a link whose service is ready
    pub fn require_ready(&self) -> Result<&ActiveLink, DeviceError> {
        let link = self.active.as_ref().ok_or_else(|| {
            DeviceError::new(ErrorCode::NoDeviceConnected, "No active O2Ring connection")
        })?;
        if !link.service_ready {
            return Err(DeviceError::new(
                ErrorCode::ServiceNotReady,
                "Service not ready yet",
            ));
        }
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_on_link_platform() {
        let mut link = LinkState::default();
        assert_eq!(
            link.require_ready().unwrap_err().code,
            ErrorCode::NoDeviceConnected
        );

        link.begin_connect("AA", 3);
        let active = link.on_link_up("AA", 0, Platform::ReadyOnLink);
        assert_eq!(active.model, 3);
        assert!(link.is_service_ready());
        assert!(link.require_ready().is_ok());
    }

    #[test]
    fn test_handshake_platform_gates_until_deployed() {
        let mut link = LinkState::default();
        link.begin_connect("AA", 3);
        link.on_link_up("AA", 0, Platform::Handshake);
        assert_eq!(
            link.require_ready().unwrap_err().code,
            ErrorCode::ServiceNotReady
        );

        assert!(link.mark_service_ready().is_some());
        assert!(link.mark_service_ready().is_none());
        assert!(link.require_ready().is_ok());
    }

    #[test]
    fn test_progress_unit_follows_platform() {
        assert_eq!(Platform::ReadyOnLink.progress_unit(), ProgressUnit::Percent);
        assert_eq!(Platform::Handshake.progress_unit(), ProgressUnit::Fraction);
        assert_eq!(Platform::from(PlatformKind::Ios).progress_unit(), ProgressUnit::Fraction);
    }

    #[test]
    fn test_link_down_only_for_active_device() {
        let mut link = LinkState::default();
        link.begin_connect("AA", 1);
        link.on_link_up("AA", 0, Platform::ReadyOnLink);

        assert!(link.on_link_down("BB").is_none());
        assert!(link.is_service_ready());
        assert_eq!(link.on_link_down("AA").map(|l| l.mac), Some("AA".to_string()));
        assert!(link.take().is_none());
    }
}
