//! Per-node service registry.

use super::{BucketServiceMapping, Service, ServiceType};
use crate::message::CoreRequest;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

type ServiceKey = (ServiceType, Option<String>);

/// Maps (service type, bucket) to the service instance a node hosts for it.
///
/// Shared services are keyed without a bucket, so every bucket resolves to the same
/// instance.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<ServiceKey, Arc<dyn Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(service_type: ServiceType, bucket: Option<&str>) -> ServiceKey {
        match service_type.mapping() {
            BucketServiceMapping::OnePerBucket => (service_type, bucket.map(str::to_string)),
            BucketServiceMapping::Shared => (service_type, None),
        }
    }

    /// Register a service unless one already occupies its slot.
    ///
    /// Returns the service that ends up registered: `service` itself, or the instance that
    /// was already there.
    pub fn add_service(&self, service: Arc<dyn Service>) -> Arc<dyn Service> {
        let key = Self::key(service.service_type(), service.bucket());
        let mut services = self.services.write();
        services.entry(key).or_insert(service).clone()
    }

    /// Remove and return the service registered for `(service_type, bucket)`.
    pub fn remove_service(
        &self,
        service_type: ServiceType,
        bucket: Option<&str>,
    ) -> Option<Arc<dyn Service>> {
        self.services
            .write()
            .remove(&Self::key(service_type, bucket))
    }

    pub fn service_by(
        &self,
        service_type: ServiceType,
        bucket: Option<&str>,
    ) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .get(&Self::key(service_type, bucket))
            .cloned()
    }

    /// Find the service responsible for a data-plane request.
    pub fn locate(&self, request: &CoreRequest) -> Option<Arc<dyn Service>> {
        self.service_by(request.service_type(), Some(request.bucket()))
    }

    pub fn contains(&self, service_type: ServiceType, bucket: Option<&str>) -> bool {
        self.services
            .read()
            .contains_key(&Self::key(service_type, bucket))
    }

    /// Snapshot of all registered services.
    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        self.services.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CoreRequest;
    use crate::testing::MockService;

    fn service(service_type: ServiceType, bucket: Option<&str>) -> Arc<dyn Service> {
        Arc::new(MockService::new("10.0.0.1", service_type, bucket))
    }

    #[test]
    fn test_register_global_service() {
        let registry = ServiceRegistry::new();
        registry.add_service(service(ServiceType::Config, None));

        assert!(registry.contains(ServiceType::Config, None));
        // Shared services answer for every bucket.
        assert!(registry.contains(ServiceType::Config, Some("default")));
    }

    #[test]
    fn test_register_local_service() {
        let registry = ServiceRegistry::new();
        registry.add_service(service(ServiceType::Binary, Some("default")));

        assert!(registry.contains(ServiceType::Binary, Some("default")));
        assert!(!registry.contains(ServiceType::Binary, Some("travel")));
        assert!(!registry.contains(ServiceType::Binary, None));
    }

    #[test]
    fn test_add_is_at_most_once() {
        let registry = ServiceRegistry::new();
        let first = service(ServiceType::Binary, Some("default"));
        let second = service(ServiceType::Binary, Some("default"));

        let kept = registry.add_service(first.clone());
        assert!(Arc::ptr_eq(&kept, &first));

        let kept = registry.add_service(second);
        assert!(Arc::ptr_eq(&kept, &first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_service() {
        let registry = ServiceRegistry::new();
        registry.add_service(service(ServiceType::Binary, Some("default")));
        registry.add_service(service(ServiceType::View, Some("default")));

        assert!(registry
            .remove_service(ServiceType::Binary, Some("default"))
            .is_some());
        assert!(registry
            .remove_service(ServiceType::Binary, Some("default"))
            .is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_locate_by_request() {
        let registry = ServiceRegistry::new();
        registry.add_service(service(ServiceType::Binary, Some("default")));
        registry.add_service(service(ServiceType::Query, None));

        let get = CoreRequest::get("default", "key");
        let located = registry.locate(&get).unwrap();
        assert_eq!(located.service_type(), ServiceType::Binary);

        let query = CoreRequest::query("default", "SELECT 1");
        assert!(registry.locate(&query).is_some());

        let other = CoreRequest::get("travel", "key");
        assert!(registry.locate(&other).is_none());
    }
}
