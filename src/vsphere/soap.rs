//! SOAP request bodies and response decoding for the vSphere web services
//! API.

use quick_xml::escape::escape;

use super::error::VsphereError;
use crate::hypervisor::{LeaseState, LeaseStatus, VmHandle};
use crate::xml::Element;

const ENVELOPE_OPEN: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
    r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
    r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
    "<soapenv:Body>"
);
const ENVELOPE_CLOSE: &str = "</soapenv:Body></soapenv:Envelope>";

/// Managed object references returned by `RetrieveServiceContent`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceContent {
    pub session_manager: String,
    pub property_collector: String,
    pub root_folder: String,
    pub view_manager: String,
}

/// One page of `RetrievePropertiesEx` results.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VmPage {
    pub vms: Vec<VmHandle>,
    pub token: Option<String>,
}

/// Wraps a method body in a SOAP envelope.
pub fn envelope(mut body: String) -> String {
    body.insert_str(0, ENVELOPE_OPEN);
    body.push_str(ENVELOPE_CLOSE);
    body
}

fn this(kind: &str, id: &str) -> String {
    format!(r#"<_this type="{kind}">{}</_this>"#, escape(id))
}

pub fn retrieve_service_content() -> String {
    format!(
        r#"<RetrieveServiceContent xmlns="urn:vim25">{}</RetrieveServiceContent>"#,
        this("ServiceInstance", "ServiceInstance")
    )
}

pub fn login(session_manager: &str, user: &str, password: &str) -> String {
    format!(
        r#"<Login xmlns="urn:vim25">{}<userName>{}</userName><password>{}</password></Login>"#,
        this("SessionManager", session_manager),
        escape(user),
        escape(password)
    )
}

pub fn logout(session_manager: &str) -> String {
    format!(
        r#"<Logout xmlns="urn:vim25">{}</Logout>"#,
        this("SessionManager", session_manager)
    )
}

pub fn create_vm_view(view_manager: &str, root_folder: &str) -> String {
    format!(
        concat!(
            r#"<CreateContainerView xmlns="urn:vim25">{}"#,
            r#"<container type="Folder">{}</container>"#,
            "<type>VirtualMachine</type><recursive>true</recursive>",
            "</CreateContainerView>"
        ),
        this("ViewManager", view_manager),
        escape(root_folder)
    )
}

pub fn destroy_view(view: &str) -> String {
    format!(
        r#"<DestroyView xmlns="urn:vim25">{}</DestroyView>"#,
        this("ContainerView", view)
    )
}

pub fn retrieve_vm_names(property_collector: &str, view: &str) -> String {
    format!(
        concat!(
            r#"<RetrievePropertiesEx xmlns="urn:vim25">{}<specSet>"#,
            "<propSet><type>VirtualMachine</type><pathSet>name</pathSet></propSet>",
            r#"<objectSet><obj type="ContainerView">{}</obj><skip>true</skip>"#,
            r#"<selectSet xsi:type="TraversalSpec"><name>traverseView</name>"#,
            "<type>ContainerView</type><path>view</path><skip>false</skip></selectSet>",
            "</objectSet></specSet><options/></RetrievePropertiesEx>"
        ),
        this("PropertyCollector", property_collector),
        escape(view)
    )
}

pub fn continue_retrieve(property_collector: &str, token: &str) -> String {
    format!(
        r#"<ContinueRetrievePropertiesEx xmlns="urn:vim25">{}<token>{}</token></ContinueRetrievePropertiesEx>"#,
        this("PropertyCollector", property_collector),
        escape(token)
    )
}

pub fn export_vm(vm: &str) -> String {
    format!(
        r#"<ExportVm xmlns="urn:vim25">{}</ExportVm>"#,
        this("VirtualMachine", vm)
    )
}

pub fn retrieve_lease(property_collector: &str, lease: &str) -> String {
    format!(
        concat!(
            r#"<RetrievePropertiesEx xmlns="urn:vim25">{}<specSet>"#,
            "<propSet><type>HttpNfcLease</type><pathSet>state</pathSet>",
            "<pathSet>error</pathSet><pathSet>info</pathSet></propSet>",
            r#"<objectSet><obj type="HttpNfcLease">{}</obj><skip>false</skip></objectSet>"#,
            "</specSet><options/></RetrievePropertiesEx>"
        ),
        this("PropertyCollector", property_collector),
        escape(lease)
    )
}

pub fn lease_progress(lease: &str, percent: u8) -> String {
    format!(
        r#"<HttpNfcLeaseProgress xmlns="urn:vim25">{}<percent>{percent}</percent></HttpNfcLeaseProgress>"#,
        this("HttpNfcLease", lease)
    )
}

pub fn lease_complete(lease: &str) -> String {
    format!(
        r#"<HttpNfcLeaseComplete xmlns="urn:vim25">{}</HttpNfcLeaseComplete>"#,
        this("HttpNfcLease", lease)
    )
}

/// Returns the fault carried by `document`, if any.
pub fn fault(method: &'static str, document: &Element) -> Option<VsphereError> {
    let fault = document.find("Fault")?;
    let message = fault
        .find("faultstring")
        .map(|text| text.text().to_owned())
        .unwrap_or_else(|| String::from("unknown fault"));
    if fault.find("InvalidLogin").is_some() || fault.find("InvalidLoginFault").is_some() {
        return Some(VsphereError::Authentication { message });
    }
    Some(VsphereError::Fault { method, message })
}

fn returnval<'a>(method: &'static str, document: &'a Element) -> Result<&'a Element, VsphereError> {
    document
        .find("returnval")
        .ok_or(VsphereError::MissingElement {
            method,
            element: "returnval",
        })
}

fn required_text(
    method: &'static str,
    parent: &Element,
    element: &'static str,
) -> Result<String, VsphereError> {
    parent
        .child(element)
        .map(|found| found.text().to_owned())
        .filter(|text| !text.is_empty())
        .ok_or(VsphereError::MissingElement { method, element })
}

pub fn parse_service_content(document: &Element) -> Result<ServiceContent, VsphereError> {
    const METHOD: &str = "RetrieveServiceContent";
    let content = returnval(METHOD, document)?;
    Ok(ServiceContent {
        session_manager: required_text(METHOD, content, "sessionManager")?,
        property_collector: required_text(METHOD, content, "propertyCollector")?,
        root_folder: required_text(METHOD, content, "rootFolder")?,
        view_manager: required_text(METHOD, content, "viewManager")?,
    })
}

/// Returns the managed object id in `returnval`.
pub fn parse_reference(method: &'static str, document: &Element) -> Result<String, VsphereError> {
    let value = returnval(method, document)?.text();
    if value.is_empty() {
        return Err(VsphereError::MissingElement {
            method,
            element: "returnval",
        });
    }
    Ok(value.to_owned())
}

fn property<'a>(object: &'a Element, name: &str) -> Option<&'a Element> {
    object
        .children_named("propSet")
        .find(|prop| prop.child("name").is_some_and(|found| found.text() == name))
        .and_then(|prop| prop.child("val"))
}

/// Decodes VM names from a `RetrievePropertiesEx` or
/// `ContinueRetrievePropertiesEx` response. An absent `returnval` means the
/// inventory is empty.
pub fn parse_vm_page(document: &Element) -> VmPage {
    let Some(result) = document.find("returnval") else {
        return VmPage::default();
    };
    let vms = result
        .children_named("objects")
        .filter_map(|object| {
            let id = object.child("obj")?.text().to_owned();
            let name = property(object, "name")?.text().to_owned();
            Some(VmHandle { name, id })
        })
        .collect();
    let token = result
        .child("token")
        .map(|token| token.text().to_owned())
        .filter(|token| !token.is_empty());
    VmPage { vms, token }
}

pub fn parse_lease_status(document: &Element) -> Result<LeaseStatus, VsphereError> {
    const METHOD: &str = "RetrievePropertiesEx";
    let object = returnval(METHOD, document)?
        .child("objects")
        .ok_or(VsphereError::MissingElement {
            method: METHOD,
            element: "objects",
        })?;
    let state = property(object, "state").ok_or(VsphereError::MissingElement {
        method: METHOD,
        element: "state",
    })?;
    let error = property(object, "error").map(|fault| {
        fault
            .find("localizedMessage")
            .map_or_else(|| fault.text().to_owned(), |message| message.text().to_owned())
    });
    let device_urls = property(object, "info")
        .map(|info| {
            info.children_named("deviceUrl")
                .filter_map(|device| device.child("url"))
                .map(|url| url.text().to_owned())
                .collect()
        })
        .unwrap_or_default();

    Ok(LeaseStatus {
        state: LeaseState::from_wire(state.text(), error),
        device_urls,
    })
}
