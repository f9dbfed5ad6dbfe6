//! Inform reconciliation against the device model store

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::protocols::cwmp::Inform;
use crate::store::{DeviceField, DeviceStore};
use crate::Result;

/// Identifiers produced by a successfully reconciled Inform
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub device_id: String,
    pub session_id: String,
}

/// Apply an Inform payload to the store: upsert the device row, refresh
/// liveness, merge the reported parameters and open a session.
///
/// Parameters are applied in document order; the store upsert makes the last
/// occurrence of a duplicated name win. Nothing is ever deleted here --
/// parameter removal is not expressible in an Inform.
pub async fn reconcile_inform(
    store: &DeviceStore,
    inform: &Inform,
    remote_ip: IpAddr,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome> {
    inform.device_id.validate()?;
    let device_id = inform.device_id.device_id();

    store.upsert_device(&inform.device_id, now).await?;
    store
        .touch_liveness(&device_id, &remote_ip.to_string(), now)
        .await?;

    for parameter in &inform.parameters {
        if let Some(field) = DeviceField::from_name_suffix(&parameter.name) {
            store
                .set_device_field(&device_id, field, &parameter.value)
                .await?;
        }
        store
            .upsert_parameter(&device_id, &parameter.name, &parameter.value, now)
            .await?;
    }

    let session_id = Uuid::new_v4().to_string();
    store
        .open_session(&session_id, &device_id, &inform.events, now)
        .await?;

    debug!(
        "Reconciled Inform from {} ({} events, {} parameters)",
        device_id,
        inform.events.len(),
        inform.parameters.len()
    );

    Ok(ReconcileOutcome {
        device_id,
        session_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::cwmp::{DeviceIdStruct, ParameterValueStruct};
    use crate::Error;

    fn remote_ip() -> IpAddr {
        "203.0.113.1".parse().unwrap()
    }

    fn sample_inform() -> Inform {
        Inform {
            device_id: DeviceIdStruct {
                manufacturer: "TestVendor".to_string(),
                oui: "ABCDEF".to_string(),
                product_class: "TestRouter".to_string(),
                serial_number: "TEST123456".to_string(),
            },
            events: vec!["0 BOOTSTRAP".to_string(), "2 PERIODIC".to_string()],
            parameters: vec![
                ParameterValueStruct {
                    name: "InternetGatewayDevice.DeviceInfo.SoftwareVersion".to_string(),
                    value: "1.0.0".to_string(),
                },
                ParameterValueStruct {
                    name: "InternetGatewayDevice.DeviceInfo.HardwareVersion".to_string(),
                    value: "1.0".to_string(),
                },
                ParameterValueStruct {
                    name: "InternetGatewayDevice.ManagementServer.ConnectionRequestURL".to_string(),
                    value: "http://192.168.1.1:7547/".to_string(),
                },
                ParameterValueStruct {
                    name: "InternetGatewayDevice.WANDevice.1.WANConnectionDevice.1.WANIPConnection.1.ExternalIPAddress".to_string(),
                    value: "203.0.113.1".to_string(),
                },
            ],
        }
    }

    async fn test_store() -> DeviceStore {
        DeviceStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_first_contact_creates_device() {
        let store = test_store().await;
        let now = Utc::now();

        let outcome = reconcile_inform(&store, &sample_inform(), remote_ip(), now)
            .await
            .unwrap();
        assert_eq!(outcome.device_id, "ABCDEF-TestRouter-TEST123456");

        let device = store.get_device(&outcome.device_id).await.unwrap().unwrap();
        assert_eq!(device.manufacturer, "TestVendor");
        assert!(device.online);
        assert_eq!(device.first_seen, now);
        assert_eq!(device.last_inform, Some(now));
        assert_eq!(device.software_version.as_deref(), Some("1.0.0"));
        assert_eq!(device.hardware_version.as_deref(), Some("1.0"));
        assert_eq!(
            device.connection_request_url.as_deref(),
            Some("http://192.168.1.1:7547/")
        );
        assert_eq!(device.ip_address.as_deref(), Some("203.0.113.1"));

        let parameters = store.list_parameters(&outcome.device_id).await.unwrap();
        assert_eq!(parameters.len(), 4);

        let session = store.get_session(&outcome.session_id).await.unwrap().unwrap();
        assert_eq!(session.inform_events, sample_inform().events);
    }

    #[tokio::test]
    async fn test_reapplying_same_inform_is_idempotent() {
        let store = test_store().await;
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(300);

        let first = reconcile_inform(&store, &sample_inform(), remote_ip(), t0)
            .await
            .unwrap();
        reconcile_inform(&store, &sample_inform(), remote_ip(), t1)
            .await
            .unwrap();

        let device = store.get_device(&first.device_id).await.unwrap().unwrap();
        assert_eq!(device.first_seen, t0);
        assert_eq!(device.last_inform, Some(t1));

        // Same parameter set, updated in place
        let parameters = store.list_parameters(&first.device_id).await.unwrap();
        assert_eq!(parameters.len(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_parameter_last_occurrence_wins() {
        let store = test_store().await;
        let mut inform = sample_inform();
        inform.parameters = vec![
            ParameterValueStruct {
                name: "A.B".to_string(),
                value: "first".to_string(),
            },
            ParameterValueStruct {
                name: "A.B".to_string(),
                value: "second".to_string(),
            },
        ];

        let outcome = reconcile_inform(&store, &inform, remote_ip(), Utc::now())
            .await
            .unwrap();

        let parameters = store.list_parameters(&outcome.device_id).await.unwrap();
        assert_eq!(parameters.len(), 1);
        assert_eq!(parameters[0].value, "second");
    }

    #[tokio::test]
    async fn test_empty_identity_component_rejected_without_mutation() {
        let store = test_store().await;
        let mut inform = sample_inform();
        inform.device_id.serial_number = String::new();

        let result = reconcile_inform(&store, &inform, remote_ip(), Utc::now()).await;
        assert!(matches!(result, Err(Error::MalformedInform(_))));
        assert!(store.list_devices().await.unwrap().is_empty());
    }
}
