//! CWMP (TR-069) SOAP envelope codec
//!
//! Parses the inbound RPC set a CPE can POST to the ACS and emits the
//! outbound envelopes the session engine dispatches. Values are carried as
//! `xsd:string` throughout; CPEs tolerate string-typed writes for the
//! parameter set this ACS manages.

use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

pub const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const CWMP_NS: &str = "urn:dslforum-org:cwmp-1-0";
pub const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema";
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Stable CPE identity reported in an Inform DeviceId block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdStruct {
    pub manufacturer: String,
    pub oui: String,
    pub product_class: String,
    pub serial_number: String,
}

impl DeviceIdStruct {
    /// Composite device key: `OUI-ProductClass-SerialNumber`
    pub fn device_id(&self) -> String {
        format!("{}-{}-{}", self.oui, self.product_class, self.serial_number)
    }

    /// The identity triple must be fully populated to key a device row
    pub fn validate(&self) -> Result<()> {
        if self.oui.is_empty() || self.product_class.is_empty() || self.serial_number.is_empty() {
            return Err(Error::malformed_inform(
                "DeviceId triple has empty components",
            ));
        }
        Ok(())
    }
}

/// Name/value pair as carried in ParameterList arrays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValueStruct {
    pub name: String,
    pub value: String,
}

/// Parsed CPE Inform payload
#[derive(Debug, Clone, PartialEq)]
pub struct Inform {
    pub device_id: DeviceIdStruct,
    pub events: Vec<String>,
    pub parameters: Vec<ParameterValueStruct>,
}

/// SOAP Fault reported by the CPE within a response body
#[derive(Debug, Clone, PartialEq)]
pub struct SoapFault {
    pub code: String,
    pub string: String,
    pub cwmp_code: Option<String>,
    pub cwmp_string: Option<String>,
}

impl SoapFault {
    /// Opaque fault record stored as a failed task's result
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "faultcode": self.code,
            "faultstring": self.string,
            "cwmp_fault_code": self.cwmp_code,
            "cwmp_fault_string": self.cwmp_string,
        })
    }
}

/// Classified inbound CWMP message
#[derive(Debug, Clone, PartialEq)]
pub enum CwmpRequest {
    Inform(Inform),
    GetParameterValuesResponse { parameters: Vec<ParameterValueStruct> },
    SetParameterValuesResponse { status: String },
    TransferCompleteResponse,
    GetRpcMethodsResponse { methods: Vec<String> },
    Fault(SoapFault),
    /// A well-formed envelope with an empty Body (session continuation)
    Empty,
    /// Any other method, preserved by name and treated as a no-op
    Unknown { method: String },
}

/// CWMP SOAP codec, passed into the session engine as a collaborator
#[derive(Debug, Clone, Default)]
pub struct CwmpCodec;

impl CwmpCodec {
    pub fn new() -> Self {
        Self
    }

    /// Parse one inbound SOAP 1.1 envelope
    pub fn parse(&self, xml: &str) -> Result<CwmpRequest> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<String> = Vec::new();
        let mut saw_body = false;
        let mut in_body = false;
        let mut method: Option<String> = None;

        let mut identity = DeviceIdStruct::default();
        let mut saw_device_id = false;
        let mut events: Vec<String> = Vec::new();
        let mut parameters: Vec<ParameterValueStruct> = Vec::new();
        let mut current_name: Option<String> = None;
        let mut current_value: Option<String> = None;
        let mut methods: Vec<String> = Vec::new();
        let mut spv_status = String::new();
        let mut fault_code = String::new();
        let mut fault_string = String::new();
        let mut cwmp_fault_code: Option<String> = None;
        let mut cwmp_fault_string: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                    if name == "Body" && !in_body {
                        saw_body = true;
                        in_body = true;
                    } else if in_body {
                        if method.is_none() {
                            method = Some(name.clone());
                        }
                        match name.as_str() {
                            "DeviceId" => saw_device_id = true,
                            "ParameterValueStruct" => {
                                current_name = None;
                                current_value = None;
                            }
                            // An empty <Name/> or <Value/> still counts as observed
                            "Name" => current_name = Some(String::new()),
                            "Value" => current_value = Some(String::new()),
                            _ => {}
                        }
                    }
                    stack.push(name);
                }
                Ok(Event::Empty(e)) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                    if name == "Body" && !in_body {
                        saw_body = true;
                    } else if in_body {
                        if method.is_none() {
                            method = Some(name.clone());
                        }
                        match name.as_str() {
                            "DeviceId" => saw_device_id = true,
                            "Name" => current_name = Some(String::new()),
                            "Value" => current_value = Some(String::new()),
                            _ => {}
                        }
                    }
                }
                Ok(Event::End(e)) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                    if name == "Body" {
                        in_body = false;
                    }
                    if in_body && name == "ParameterValueStruct" {
                        parameters.push(ParameterValueStruct {
                            name: current_name.take().unwrap_or_default(),
                            value: current_value.take().unwrap_or_default(),
                        });
                    }
                    stack.pop();
                }
                Ok(Event::Text(e)) => {
                    if !in_body {
                        continue;
                    }
                    let text = e.xml_content().unwrap_or_default().to_string();
                    let element = stack.last().map(String::as_str).unwrap_or_default();
                    let parent = stack
                        .len()
                        .checked_sub(2)
                        .and_then(|i| stack.get(i))
                        .map(String::as_str)
                        .unwrap_or_default();

                    match (parent, element) {
                        ("DeviceId", "Manufacturer") => identity.manufacturer = text,
                        ("DeviceId", "OUI") => identity.oui = text,
                        ("DeviceId", "ProductClass") => identity.product_class = text,
                        ("DeviceId", "SerialNumber") => identity.serial_number = text,
                        ("EventStruct", "EventCode") => events.push(text),
                        ("ParameterValueStruct", "Name") => current_name = Some(text),
                        ("ParameterValueStruct", "Value") => current_value = Some(text),
                        ("MethodList", "string") => methods.push(text),
                        (_, "Status") => spv_status = text,
                        (_, "faultcode") => fault_code = text,
                        (_, "faultstring") => fault_string = text,
                        (_, "FaultCode") => cwmp_fault_code = Some(text),
                        (_, "FaultString") => cwmp_fault_string = Some(text),
                        _ => {}
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(Error::malformed_envelope(format!(
                        "XML parse error at position {}: {}",
                        reader.error_position(),
                        e
                    )));
                }
                _ => {}
            }
        }

        if !saw_body {
            return Err(Error::malformed_envelope("missing SOAP Body"));
        }

        let method = match method {
            Some(method) => method,
            None => return Ok(CwmpRequest::Empty),
        };

        match method.as_str() {
            "Inform" => {
                if !saw_device_id {
                    return Err(Error::malformed_inform("Inform is missing DeviceId"));
                }
                Ok(CwmpRequest::Inform(Inform {
                    device_id: identity,
                    events,
                    parameters,
                }))
            }
            "GetParameterValuesResponse" => {
                Ok(CwmpRequest::GetParameterValuesResponse { parameters })
            }
            "SetParameterValuesResponse" => {
                Ok(CwmpRequest::SetParameterValuesResponse { status: spv_status })
            }
            "TransferCompleteResponse" => Ok(CwmpRequest::TransferCompleteResponse),
            "GetRPCMethodsResponse" => Ok(CwmpRequest::GetRpcMethodsResponse { methods }),
            "Fault" => Ok(CwmpRequest::Fault(SoapFault {
                code: fault_code,
                string: fault_string,
                cwmp_code: cwmp_fault_code,
                cwmp_string: cwmp_fault_string,
            })),
            other => Ok(CwmpRequest::Unknown {
                method: other.to_string(),
            }),
        }
    }

    /// InformResponse acknowledging a reconciled Inform; no CWMP ID header
    pub fn inform_response(&self) -> String {
        format!(
            "<soap:Envelope xmlns:soap=\"{}\" xmlns:cwmp=\"{}\">\
             <soap:Body>\
             <cwmp:InformResponse><MaxEnvelopes>1</MaxEnvelopes></cwmp:InformResponse>\
             </soap:Body></soap:Envelope>",
            SOAP_NS, CWMP_NS
        )
    }

    /// Empty envelope closing the session; no CWMP ID header
    pub fn empty(&self) -> String {
        format!(
            "<soap:Envelope xmlns:soap=\"{}\"><soap:Body></soap:Body></soap:Envelope>",
            SOAP_NS
        )
    }

    pub fn get_parameter_values(&self, names: &[String]) -> String {
        let mut body = format!(
            "<cwmp:GetParameterValues>\
             <ParameterNames soap:arrayType=\"xsd:string[{}]\">",
            names.len()
        );
        for name in names {
            body.push_str("<string>");
            body.push_str(&escape(name.as_str()));
            body.push_str("</string>");
        }
        body.push_str("</ParameterNames></cwmp:GetParameterValues>");
        self.rpc_envelope(&body)
    }

    pub fn set_parameter_values(&self, values: &[(String, String)]) -> String {
        let mut body = format!(
            "<cwmp:SetParameterValues>\
             <ParameterList soap:arrayType=\"cwmp:ParameterValueStruct[{}]\">",
            values.len()
        );
        for (name, value) in values {
            body.push_str("<ParameterValueStruct><Name>");
            body.push_str(&escape(name.as_str()));
            body.push_str("</Name><Value xsi:type=\"xsd:string\">");
            body.push_str(&escape(value.as_str()));
            body.push_str("</Value></ParameterValueStruct>");
        }
        body.push_str("</ParameterList><ParameterKey></ParameterKey></cwmp:SetParameterValues>");
        self.rpc_envelope(&body)
    }

    /// Reboot request; the CommandKey carries the dispatch epoch
    pub fn reboot(&self, now: DateTime<Utc>) -> String {
        let body = format!(
            "<cwmp:Reboot><CommandKey>reboot_{}</CommandKey></cwmp:Reboot>",
            now.timestamp()
        );
        self.rpc_envelope(&body)
    }

    pub fn factory_reset(&self) -> String {
        self.rpc_envelope("<cwmp:FactoryReset></cwmp:FactoryReset>")
    }

    /// Envelope for an ACS-issued RPC: fresh CWMP ID header, all namespaces bound
    fn rpc_envelope(&self, body: &str) -> String {
        format!(
            "<soap:Envelope xmlns:soap=\"{}\" xmlns:cwmp=\"{}\" xmlns:xsi=\"{}\" xmlns:xsd=\"{}\">\
             <soap:Header>\
             <cwmp:ID soap:mustUnderstand=\"1\">{}</cwmp:ID>\
             </soap:Header>\
             <soap:Body>{}</soap:Body></soap:Envelope>",
            SOAP_NS,
            CWMP_NS,
            XSI_NS,
            XSD_NS,
            Uuid::new_v4(),
            body
        )
    }
}
