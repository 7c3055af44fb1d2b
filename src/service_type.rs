use crate::error::{ReconfigError, ReconfigResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle to a service-type host obtained from the hosting subsystem. While
/// a unit holds one, the host process is pinned for its replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTypeRegistration {
    pub service_type: String,
    pub host_id: String,
    pub runtime_id: String,
}

/// The hosting subsystem as seen by the engine: registration lookup plus
/// replica count bookkeeping. Implemented by the hosting agent; tests use a
/// scripted stub.
pub trait HostingAdapter {
    fn find_service_type_registration(
        &mut self,
        service_type: &str,
    ) -> ReconfigResult<ServiceTypeRegistration>;

    /// The unit no longer pins the host (replica down or closed).
    fn on_registration_released(&mut self, registration: &ServiceTypeRegistration);
}

/// Owns the unit's service-type registration and releases it exactly once
/// per acquire when the replica goes down or closes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceTypeRegistrationWrapper {
    registration: Option<ServiceTypeRegistration>,
}

impl ServiceTypeRegistrationWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live host-side runtime exists for the replica.
    pub fn is_runtime_active(&self) -> bool {
        self.registration.is_some()
    }

    pub fn registration(&self) -> Option<&ServiceTypeRegistration> {
        self.registration.as_ref()
    }

    pub fn try_get_and_add(
        &mut self,
        hosting: &mut dyn HostingAdapter,
        service_type: &str,
    ) -> ReconfigResult<&ServiceTypeRegistration> {
        if self.registration.is_none() {
            let registration = hosting.find_service_type_registration(service_type)?;
            self.registration = Some(registration);
        }
        self.registration
            .as_ref()
            .ok_or_else(|| ReconfigError::internal("registration vanished after acquire"))
    }

    pub fn on_replica_down(&mut self, hosting: &mut dyn HostingAdapter) {
        self.release(hosting);
    }

    pub fn on_replica_closed(&mut self, hosting: &mut dyn HostingAdapter) {
        self.release(hosting);
    }

    fn release(&mut self, hosting: &mut dyn HostingAdapter) {
        if let Some(registration) = self.registration.take() {
            hosting.on_registration_released(&registration);
        }
    }
}

impl fmt::Display for ServiceTypeRegistrationWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.registration {
            Some(r) => write!(f, "{}@{}", r.service_type, r.host_id),
            None => write!(f, "-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct StubHosting {
        releases: usize,
        fail_lookup: bool,
    }

    impl HostingAdapter for StubHosting {
        fn find_service_type_registration(
            &mut self,
            service_type: &str,
        ) -> ReconfigResult<ServiceTypeRegistration> {
            if self.fail_lookup {
                return Err(ReconfigError::RegistrationNotFound {
                    service_type: service_type.to_string(),
                });
            }
            Ok(ServiceTypeRegistration {
                service_type: service_type.to_string(),
                host_id: "host-1".into(),
                runtime_id: "rt-1".into(),
            })
        }

        fn on_registration_released(&mut self, _registration: &ServiceTypeRegistration) {
            self.releases += 1;
        }
    }

    #[test]
    fn test_acquire_and_release_once() {
        let mut hosting = StubHosting::default();
        let mut wrapper = ServiceTypeRegistrationWrapper::new();

        assert!(!wrapper.is_runtime_active());
        wrapper.try_get_and_add(&mut hosting, "Echo").unwrap();
        assert!(wrapper.is_runtime_active());

        // Idempotent acquire.
        wrapper.try_get_and_add(&mut hosting, "Echo").unwrap();

        wrapper.on_replica_down(&mut hosting);
        assert!(!wrapper.is_runtime_active());
        wrapper.on_replica_closed(&mut hosting);
        assert_eq!(hosting.releases, 1);
    }

    #[test]
    fn test_failed_lookup_leaves_runtime_inactive() {
        let mut hosting = StubHosting {
            fail_lookup: true,
            ..Default::default()
        };
        let mut wrapper = ServiceTypeRegistrationWrapper::new();
        assert!(wrapper.try_get_and_add(&mut hosting, "Echo").is_err());
        assert!(!wrapper.is_runtime_active());
    }
}
