//! Per-request CWMP session state machine
//!
//! Each inbound HTTP POST to the CWMP endpoint is one step through this
//! engine. The engine itself is stateless between requests: the CPE's
//! identity and the session's progress are recovered from the store, and all
//! cross-request coordination happens through the store's conditional
//! updates. The CPE echoes the session cookie handed out on the Inform
//! response, which is how non-Inform messages are tied back to a device.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::protocols::cwmp::{CwmpCodec, CwmpRequest, Inform, ParameterValueStruct, SoapFault};
use crate::services::inform::reconcile_inform;
use crate::store::{CwmpSession, DeviceStore, TaskCommand, TaskKind, TaskStatus};
use crate::{Error, Result};

/// Cookie carrying the session id between the requests of one CWMP burst
pub const SESSION_COOKIE: &str = "acs_session";

/// Outcome of one engine step, ready to be written as the HTTP response
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResponse {
    pub status: u16,
    pub body: String,
    /// When set, hand this session id back to the CPE as a cookie
    pub session_id: Option<String>,
}

impl EngineResponse {
    fn ok(body: String) -> Self {
        Self {
            status: 200,
            body,
            session_id: None,
        }
    }
}

/// The CWMP session engine, glued together from its collaborators
pub struct SessionEngine {
    codec: CwmpCodec,
    store: Arc<DeviceStore>,
}

impl SessionEngine {
    pub fn new(codec: CwmpCodec, store: Arc<DeviceStore>) -> Self {
        Self { codec, store }
    }

    /// Empty envelope for responses produced outside an engine step
    pub fn empty_envelope(&self) -> String {
        self.codec.empty()
    }

    /// Handle one CWMP POST end-to-end. Protocol errors surface as HTTP
    /// statuses with an empty SOAP body; they never mutate the store.
    pub async fn handle_request(
        &self,
        body: &str,
        remote_ip: IpAddr,
        session_cookie: Option<&str>,
    ) -> EngineResponse {
        match self.step(body, remote_ip, session_cookie).await {
            Ok(response) => response,
            Err(Error::MalformedEnvelope(msg)) => {
                warn!("Rejected CWMP request: {}", msg);
                EngineResponse {
                    status: 400,
                    body: self.codec.empty(),
                    session_id: None,
                }
            }
            Err(Error::MalformedInform(msg)) => {
                warn!("Rejected Inform: {}", msg);
                EngineResponse {
                    status: 400,
                    body: self.codec.empty(),
                    session_id: None,
                }
            }
            Err(Error::Store(e)) => {
                warn!("Store unavailable while handling CWMP request: {}", e);
                EngineResponse {
                    status: 503,
                    body: self.codec.empty(),
                    session_id: None,
                }
            }
            Err(e) => {
                warn!("CWMP request failed: {}", e);
                EngineResponse {
                    status: 500,
                    body: self.codec.empty(),
                    session_id: None,
                }
            }
        }
    }

    async fn step(
        &self,
        body: &str,
        remote_ip: IpAddr,
        session_cookie: Option<&str>,
    ) -> Result<EngineResponse> {
        let now = Utc::now();

        // A bare POST is the CPE polling for the next command
        if body.trim().is_empty() {
            return self.continue_session(session_cookie, now).await;
        }

        match self.codec.parse(body)? {
            CwmpRequest::Inform(inform) => self.handle_inform(&inform, remote_ip, now).await,
            CwmpRequest::Empty => self.continue_session(session_cookie, now).await,
            CwmpRequest::GetParameterValuesResponse { parameters } => {
                self.handle_get_response(session_cookie, &parameters, now)
                    .await
            }
            CwmpRequest::SetParameterValuesResponse { status } => {
                self.handle_set_response(session_cookie, &status, now).await
            }
            CwmpRequest::Fault(fault) => self.handle_fault(session_cookie, &fault, now).await,
            CwmpRequest::TransferCompleteResponse => {
                self.finish_session(session_cookie, "TransferCompleteResponse", now)
                    .await
            }
            CwmpRequest::GetRpcMethodsResponse { methods } => {
                debug!("CPE advertises {} RPC methods", methods.len());
                self.finish_session(session_cookie, "GetRPCMethodsResponse", now)
                    .await
            }
            CwmpRequest::Unknown { method } => {
                info!("Ignoring unsupported CWMP method {}", method);
                self.finish_session(session_cookie, &method, now).await
            }
        }
    }

    async fn handle_inform(
        &self,
        inform: &Inform,
        remote_ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<EngineResponse> {
        let outcome = reconcile_inform(&self.store, inform, remote_ip, now).await?;
        info!(
            "Inform from {} ({:?})",
            outcome.device_id, inform.events
        );

        let body = match self.dispatch(&outcome.device_id, now).await? {
            Some(rpc) => rpc,
            None => self.codec.inform_response(),
        };

        Ok(EngineResponse {
            status: 200,
            body,
            session_id: Some(outcome.session_id),
        })
    }

    /// Promote the oldest pending task to sent and emit its RPC. Returns
    /// `None` when nothing can be dispatched, either because the queue is
    /// empty or because a previously dispatched task is still in flight.
    async fn dispatch(&self, device_id: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        for attempt in 0..2 {
            // One outstanding RPC per device: a still-sent task blocks dispatch
            if self
                .store
                .latest_sent_task(device_id, None)
                .await?
                .is_some()
            {
                debug!("Device {} has an in-flight task, holding dispatch", device_id);
                return Ok(None);
            }

            let Some(task) = self.store.peek_pending_task(device_id).await? else {
                return Ok(None);
            };

            match self
                .store
                .advance_task_status(task.id, TaskStatus::Pending, TaskStatus::Sent, None, now)
                .await
            {
                Ok(()) => {
                    info!(
                        "Dispatching task {} ({}) to {}",
                        task.id,
                        task.command.kind().as_str(),
                        device_id
                    );
                    return Ok(Some(self.emit_command(&task.command, now)));
                }
                Err(Error::StoreConflict(_)) => {
                    debug!(
                        "Task {} was claimed by another session (attempt {})",
                        task.id, attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn emit_command(&self, command: &TaskCommand, now: DateTime<Utc>) -> String {
        match command {
            TaskCommand::GetParams { names } => self.codec.get_parameter_values(names),
            TaskCommand::SetParams { values } => self.codec.set_parameter_values(values),
            TaskCommand::Reboot => self.codec.reboot(now),
            TaskCommand::FactoryReset => self.codec.factory_reset(),
        }
    }

    /// Empty request body: dispatch the next pending task into the open
    /// session, or close it with the empty envelope.
    async fn continue_session(
        &self,
        session_cookie: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<EngineResponse> {
        let Some(session) = self.resolve_session(session_cookie).await? else {
            warn!("CWMP continuation without a resolvable session");
            return Ok(EngineResponse::ok(self.codec.empty()));
        };
        self.store.bump_session(&session.id).await?;

        if let Some(rpc) = self.dispatch(&session.device_id, now).await? {
            return Ok(EngineResponse {
                status: 200,
                body: rpc,
                session_id: Some(session.id),
            });
        }

        self.store.close_session(&session.id, now).await?;
        Ok(EngineResponse::ok(self.codec.empty()))
    }

    async fn handle_get_response(
        &self,
        session_cookie: Option<&str>,
        parameters: &[ParameterValueStruct],
        now: DateTime<Utc>,
    ) -> Result<EngineResponse> {
        let Some(session) = self.resolve_session(session_cookie).await? else {
            warn!("GetParameterValuesResponse without a resolvable session");
            return Ok(EngineResponse::ok(self.codec.empty()));
        };
        self.store.bump_session(&session.id).await?;

        match self
            .store
            .latest_sent_task(&session.device_id, Some(TaskKind::GetParams))
            .await?
        {
            Some(task) => {
                // Merge the returned snapshot into the parameter store
                let mut values = serde_json::Map::new();
                for parameter in parameters {
                    self.store
                        .upsert_parameter(&session.device_id, &parameter.name, &parameter.value, now)
                        .await?;
                    values.insert(parameter.name.clone(), json!(parameter.value));
                }
                let result = json!({ "parameters": values });
                match self
                    .store
                    .advance_task_status(
                        task.id,
                        TaskStatus::Sent,
                        TaskStatus::Completed,
                        Some(&result),
                        now,
                    )
                    .await
                {
                    Ok(()) => info!(
                        "Task {} completed with {} parameters from {}",
                        task.id,
                        parameters.len(),
                        session.device_id
                    ),
                    Err(Error::StoreConflict(_)) => {
                        warn!("Task {} response raced its status update", task.id)
                    }
                    Err(e) => return Err(e),
                }
            }
            None => warn!(
                "GetParameterValuesResponse from {} with no matching sent task",
                session.device_id
            ),
        }

        self.store.close_session(&session.id, now).await?;
        Ok(EngineResponse::ok(self.codec.empty()))
    }

    async fn handle_set_response(
        &self,
        session_cookie: Option<&str>,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<EngineResponse> {
        let Some(session) = self.resolve_session(session_cookie).await? else {
            warn!("SetParameterValuesResponse without a resolvable session");
            return Ok(EngineResponse::ok(self.codec.empty()));
        };
        self.store.bump_session(&session.id).await?;

        match self
            .store
            .latest_sent_task(&session.device_id, Some(TaskKind::SetParams))
            .await?
        {
            Some(task) => {
                let result = json!({ "status": status });
                match self
                    .store
                    .advance_task_status(
                        task.id,
                        TaskStatus::Sent,
                        TaskStatus::Completed,
                        Some(&result),
                        now,
                    )
                    .await
                {
                    Ok(()) => info!("Task {} completed on {}", task.id, session.device_id),
                    Err(Error::StoreConflict(_)) => {
                        warn!("Task {} response raced its status update", task.id)
                    }
                    Err(e) => return Err(e),
                }
            }
            None => warn!(
                "SetParameterValuesResponse from {} with no matching sent task",
                session.device_id
            ),
        }

        self.store.close_session(&session.id, now).await?;
        Ok(EngineResponse::ok(self.codec.empty()))
    }

    /// A CWMP fault fails the in-flight task, whatever its kind
    async fn handle_fault(
        &self,
        session_cookie: Option<&str>,
        fault: &SoapFault,
        now: DateTime<Utc>,
    ) -> Result<EngineResponse> {
        let Some(session) = self.resolve_session(session_cookie).await? else {
            warn!("CWMP fault without a resolvable session: {}", fault.string);
            return Ok(EngineResponse::ok(self.codec.empty()));
        };
        self.store.bump_session(&session.id).await?;

        match self.store.latest_sent_task(&session.device_id, None).await? {
            Some(task) => {
                match self
                    .store
                    .advance_task_status(
                        task.id,
                        TaskStatus::Sent,
                        TaskStatus::Failed,
                        Some(&fault.to_payload()),
                        now,
                    )
                    .await
                {
                    Ok(()) => warn!(
                        "Task {} failed on {}: {} ({})",
                        task.id, session.device_id, fault.string, fault.code
                    ),
                    Err(Error::StoreConflict(_)) => {
                        warn!("Task {} fault raced its status update", task.id)
                    }
                    Err(e) => return Err(e),
                }
            }
            None => warn!(
                "CWMP fault from {} with no in-flight task: {}",
                session.device_id, fault.string
            ),
        }

        self.store.close_session(&session.id, now).await?;
        Ok(EngineResponse::ok(self.codec.empty()))
    }

    /// Close out the session (when it resolves) with the empty envelope
    async fn finish_session(
        &self,
        session_cookie: Option<&str>,
        method: &str,
        now: DateTime<Utc>,
    ) -> Result<EngineResponse> {
        if let Some(session) = self.resolve_session(session_cookie).await? {
            self.store.bump_session(&session.id).await?;
            self.store.close_session(&session.id, now).await?;
            debug!("Session {} closed after {}", session.id, method);
        }
        Ok(EngineResponse::ok(self.codec.empty()))
    }

    async fn resolve_session(&self, session_cookie: Option<&str>) -> Result<Option<CwmpSession>> {
        let Some(session_id) = session_cookie else {
            return Ok(None);
        };
        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(None);
        };
        if session.ended_at.is_some() {
            return Ok(None);
        }
        Ok(Some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::cwmp::{CWMP_NS, SOAP_NS};

    const REMOTE: &str = "203.0.113.1";

    fn inform_xml(serial: &str) -> String {
        format!(
            "<soap:Envelope xmlns:soap=\"{soap}\" xmlns:cwmp=\"{cwmp}\"><soap:Body>\
             <cwmp:Inform>\
             <DeviceId>\
             <Manufacturer>TestVendor</Manufacturer><OUI>ABCDEF</OUI>\
             <ProductClass>TestRouter</ProductClass><SerialNumber>{serial}</SerialNumber>\
             </DeviceId>\
             <Event><EventStruct><EventCode>2 PERIODIC</EventCode></EventStruct></Event>\
             <ParameterList>\
             <ParameterValueStruct>\
             <Name>InternetGatewayDevice.DeviceInfo.SoftwareVersion</Name>\
             <Value>1.0.0</Value>\
             </ParameterValueStruct>\
             </ParameterList>\
             </cwmp:Inform></soap:Body></soap:Envelope>",
            soap = SOAP_NS,
            cwmp = CWMP_NS,
            serial = serial,
        )
    }

    fn get_response_xml() -> String {
        format!(
            "<soap:Envelope xmlns:soap=\"{soap}\" xmlns:cwmp=\"{cwmp}\"><soap:Body>\
             <cwmp:GetParameterValuesResponse><ParameterList>\
             <ParameterValueStruct>\
             <Name>InternetGatewayDevice.DeviceInfo.SoftwareVersion</Name>\
             <Value>1.0.1</Value>\
             </ParameterValueStruct>\
             </ParameterList></cwmp:GetParameterValuesResponse>\
             </soap:Body></soap:Envelope>",
            soap = SOAP_NS,
            cwmp = CWMP_NS,
        )
    }

    fn fault_xml() -> String {
        format!(
            "<soap:Envelope xmlns:soap=\"{soap}\" xmlns:cwmp=\"{cwmp}\"><soap:Body>\
             <soap:Fault>\
             <faultcode>Client</faultcode><faultstring>CWMP fault</faultstring>\
             <detail><cwmp:Fault><FaultCode>9002</FaultCode>\
             <FaultString>Internal error</FaultString></cwmp:Fault></detail>\
             </soap:Fault></soap:Body></soap:Envelope>",
            soap = SOAP_NS,
            cwmp = CWMP_NS,
        )
    }

    async fn test_engine() -> (SessionEngine, Arc<DeviceStore>) {
        let store = Arc::new(DeviceStore::connect("sqlite::memory:").await.unwrap());
        (SessionEngine::new(CwmpCodec::new(), Arc::clone(&store)), store)
    }

    fn remote() -> IpAddr {
        REMOTE.parse().unwrap()
    }

    #[tokio::test]
    async fn test_inform_with_empty_queue_yields_inform_response() {
        let (engine, store) = test_engine().await;

        let response = engine
            .handle_request(&inform_xml("TEST123456"), remote(), None)
            .await;
        assert_eq!(response.status, 200);
        assert!(response.body.contains("<cwmp:InformResponse>"));
        assert!(response.body.contains("<MaxEnvelopes>1</MaxEnvelopes>"));
        assert!(response.session_id.is_some());

        let device = store
            .get_device("ABCDEF-TestRouter-TEST123456")
            .await
            .unwrap()
            .unwrap();
        assert!(device.online);
    }

    #[tokio::test]
    async fn test_queued_reboot_is_dispatched_once() {
        let (engine, store) = test_engine().await;
        let device_id = "ABCDEF-TestRouter-TEST123456";

        engine
            .handle_request(&inform_xml("TEST123456"), remote(), None)
            .await;
        store
            .create_task(device_id, &TaskCommand::Reboot, Utc::now())
            .await
            .unwrap();

        let response = engine
            .handle_request(&inform_xml("TEST123456"), remote(), None)
            .await;
        assert!(response.body.contains("<cwmp:Reboot>"));
        assert!(response.body.contains("<CommandKey>reboot_"));

        let task = store
            .latest_sent_task(device_id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Sent);

        // The task is still in flight: a new Inform must not re-dispatch it
        let second = engine
            .handle_request(&inform_xml("TEST123456"), remote(), None)
            .await;
        assert!(second.body.contains("<cwmp:InformResponse>"));
    }

    #[tokio::test]
    async fn test_get_params_lifecycle() {
        let (engine, store) = test_engine().await;
        let device_id = "ABCDEF-TestRouter-TEST123456";

        engine
            .handle_request(&inform_xml("TEST123456"), remote(), None)
            .await;
        store
            .create_task(
                device_id,
                &TaskCommand::GetParams {
                    names: vec!["InternetGatewayDevice.DeviceInfo.SoftwareVersion".to_string()],
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let dispatch = engine
            .handle_request(&inform_xml("TEST123456"), remote(), None)
            .await;
        assert!(dispatch.body.contains("<cwmp:GetParameterValues>"));
        assert!(dispatch.body.contains("xsd:string[1]"));
        let cookie = dispatch.session_id.unwrap();

        let done = engine
            .handle_request(&get_response_xml(), remote(), Some(&cookie))
            .await;
        assert_eq!(done.status, 200);
        assert!(done.body.contains("<soap:Body></soap:Body>"));

        let history = store.list_tasks(device_id).await.unwrap();
        assert_eq!(history[0].status, TaskStatus::Completed);
        let result = history[0].result.as_ref().unwrap();
        assert_eq!(
            result["parameters"]["InternetGatewayDevice.DeviceInfo.SoftwareVersion"],
            "1.0.1"
        );

        // The returned snapshot was merged into the parameter store
        let parameters = store.list_parameters(device_id).await.unwrap();
        assert!(parameters
            .iter()
            .any(|p| p.name.ends_with("SoftwareVersion") && p.value == "1.0.1"));

        // Session closed by the empty envelope
        let session = store.get_session(&cookie).await.unwrap().unwrap();
        assert!(session.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_tasks_dispatch_in_fifo_order() {
        let (engine, store) = test_engine().await;
        let device_id = "ABCDEF-TestRouter-TEST123456";

        engine
            .handle_request(&inform_xml("TEST123456"), remote(), None)
            .await;
        let now = Utc::now();
        store
            .create_task(
                device_id,
                &TaskCommand::GetParams {
                    names: vec!["A.First".to_string()],
                },
                now,
            )
            .await
            .unwrap();
        store
            .create_task(
                device_id,
                &TaskCommand::GetParams {
                    names: vec!["A.Second".to_string()],
                },
                now,
            )
            .await
            .unwrap();

        let first = engine
            .handle_request(&inform_xml("TEST123456"), remote(), None)
            .await;
        assert!(first.body.contains("<string>A.First</string>"));

        // Complete the first task so the second becomes dispatchable
        let cookie = first.session_id.unwrap();
        engine
            .handle_request(&get_response_xml(), remote(), Some(&cookie))
            .await;

        let second = engine
            .handle_request(&inform_xml("TEST123456"), remote(), None)
            .await;
        assert!(second.body.contains("<string>A.Second</string>"));
    }

    #[tokio::test]
    async fn test_empty_body_continuation_dispatches_then_closes() {
        let (engine, store) = test_engine().await;
        let device_id = "ABCDEF-TestRouter-TEST123456";

        let opened = engine
            .handle_request(&inform_xml("TEST123456"), remote(), None)
            .await;
        let cookie = opened.session_id.unwrap();

        store
            .create_task(device_id, &TaskCommand::FactoryReset, Utc::now())
            .await
            .unwrap();

        // First poll: the queued task goes out
        let polled = engine.handle_request("", remote(), Some(&cookie)).await;
        assert!(polled.body.contains("<cwmp:FactoryReset>"));
        assert_eq!(polled.session_id.as_deref(), Some(cookie.as_str()));

        // In-flight task holds further dispatch; the session closes
        let closed = engine.handle_request("", remote(), Some(&cookie)).await;
        assert!(closed.body.contains("<soap:Body></soap:Body>"));
        let session = store.get_session(&cookie).await.unwrap().unwrap();
        assert!(session.ended_at.is_some());
        assert!(session.messages_exchanged >= 3);
    }

    #[tokio::test]
    async fn test_fault_fails_in_flight_task() {
        let (engine, store) = test_engine().await;
        let device_id = "ABCDEF-TestRouter-TEST123456";

        engine
            .handle_request(&inform_xml("TEST123456"), remote(), None)
            .await;
        store
            .create_task(device_id, &TaskCommand::Reboot, Utc::now())
            .await
            .unwrap();

        let dispatch = engine
            .handle_request(&inform_xml("TEST123456"), remote(), None)
            .await;
        let cookie = dispatch.session_id.unwrap();

        engine
            .handle_request(&fault_xml(), remote(), Some(&cookie))
            .await;

        let history = store.list_tasks(device_id).await.unwrap();
        assert_eq!(history[0].status, TaskStatus::Failed);
        let result = history[0].result.as_ref().unwrap();
        assert_eq!(result["cwmp_fault_code"], "9002");
    }

    #[tokio::test]
    async fn test_malformed_envelope_rejected_without_mutation() {
        let (engine, store) = test_engine().await;

        let response = engine.handle_request("not xml", remote(), None).await;
        assert_eq!(response.status, 400);
        assert!(response.body.contains("<soap:Body></soap:Body>"));
        assert!(store.list_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inform_without_device_id_is_rejected() {
        let (engine, store) = test_engine().await;
        let xml = format!(
            "<soap:Envelope xmlns:soap=\"{}\" xmlns:cwmp=\"{}\"><soap:Body>\
             <cwmp:Inform><MaxEnvelopes>1</MaxEnvelopes></cwmp:Inform>\
             </soap:Body></soap:Envelope>",
            SOAP_NS, CWMP_NS
        );

        let response = engine.handle_request(&xml, remote(), None).await;
        assert_eq!(response.status, 400);
        assert!(store.list_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_is_acknowledged_empty() {
        let (engine, _store) = test_engine().await;
        let xml = format!(
            "<soap:Envelope xmlns:soap=\"{}\" xmlns:cwmp=\"{}\">\
             <soap:Body><cwmp:Kicked></cwmp:Kicked></soap:Body></soap:Envelope>",
            SOAP_NS, CWMP_NS
        );

        let response = engine.handle_request(&xml, remote(), None).await;
        assert_eq!(response.status, 200);
        assert!(response.body.contains("<soap:Body></soap:Body>"));
    }
}
