//! Unit tests for SOAP encoding and response decoding.

use super::*;
use crate::hypervisor::LeaseState;
use reqwest::header::HeaderValue;
use rstest::rstest;

fn parse(xml: &str) -> Element {
    Element::parse(xml).expect("fixture should parse")
}

fn wrap(body: &str) -> String {
    soap::envelope(body.to_owned())
}

fn config(port: u16) -> HypervisorConfig {
    HypervisorConfig {
        host: String::from("esxi.lab"),
        user: String::from("root"),
        password: String::from("secret"),
        port,
        accept_invalid_certs: false,
    }
}

#[test]
fn login_body_escapes_credentials() {
    let body = soap::login("ha-sessionmgr", "root", "p<&>ss");
    assert!(body.contains("<password>p&lt;&amp;&gt;ss</password>"), "body: {body}");
    assert!(body.contains(r#"<_this type="SessionManager">ha-sessionmgr</_this>"#));
}

#[test]
fn service_content_is_decoded() {
    let document = parse(&wrap(
        r#"<RetrieveServiceContentResponse xmlns="urn:vim25"><returnval>
<rootFolder type="Folder">ha-folder-root</rootFolder>
<propertyCollector type="PropertyCollector">ha-property-collector</propertyCollector>
<viewManager type="ViewManager">ViewManager</viewManager>
<sessionManager type="SessionManager">ha-sessionmgr</sessionManager>
</returnval></RetrieveServiceContentResponse>"#,
    ));

    let content = soap::parse_service_content(&document).expect("content should decode");

    assert_eq!(content.root_folder, "ha-folder-root");
    assert_eq!(content.property_collector, "ha-property-collector");
    assert_eq!(content.view_manager, "ViewManager");
    assert_eq!(content.session_manager, "ha-sessionmgr");
}

#[test]
fn invalid_login_fault_maps_to_authentication_error() {
    let document = parse(&wrap(
        r#"<soapenv:Fault><faultcode>ServerFaultCode</faultcode>
<faultstring>Cannot complete login due to an incorrect user name or password.</faultstring>
<detail><InvalidLoginFault xmlns="urn:vim25" xsi:type="InvalidLogin"></InvalidLoginFault></detail>
</soapenv:Fault>"#,
    ));

    let fault = soap::fault("Login", &document).expect("fault should be detected");

    assert!(matches!(fault, VsphereError::Authentication { .. }), "got {fault:?}");
}

#[test]
fn other_faults_name_the_method() {
    let document = parse(&wrap(
        "<soapenv:Fault><faultstring>The object has already been deleted</faultstring></soapenv:Fault>",
    ));

    let fault = soap::fault("ExportVm", &document).expect("fault should be detected");

    assert_eq!(
        fault,
        VsphereError::Fault {
            method: "ExportVm",
            message: String::from("The object has already been deleted"),
        }
    );
}

#[test]
fn vm_page_lists_names_and_token() {
    let document = parse(&wrap(
        r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval>
<token>next-page</token>
<objects><obj type="VirtualMachine">1</obj><propSet><name>name</name><val xsi:type="xsd:string">web01</val></propSet></objects>
<objects><obj type="VirtualMachine">2</obj><propSet><name>name</name><val xsi:type="xsd:string">db01</val></propSet></objects>
</returnval></RetrievePropertiesExResponse>"#,
    ));

    let page = soap::parse_vm_page(&document);

    assert_eq!(
        page.vms,
        vec![
            VmHandle {
                name: String::from("web01"),
                id: String::from("1"),
            },
            VmHandle {
                name: String::from("db01"),
                id: String::from("2"),
            },
        ]
    );
    assert_eq!(page.token.as_deref(), Some("next-page"));
}

#[test]
fn empty_inventory_has_no_vms() {
    let document = parse(&wrap(
        r#"<RetrievePropertiesExResponse xmlns="urn:vim25"></RetrievePropertiesExResponse>"#,
    ));
    assert_eq!(soap::parse_vm_page(&document), soap::VmPage::default());
}

#[test]
fn ready_lease_lists_device_urls_in_order() {
    let document = parse(&wrap(
        r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval><objects>
<obj type="HttpNfcLease">52a1</obj>
<propSet><name>state</name><val xsi:type="HttpNfcLeaseState">ready</val></propSet>
<propSet><name>info</name><val xsi:type="HttpNfcLeaseInfo">
<lease type="HttpNfcLease">52a1</lease>
<deviceUrl><key>/vm-1/VirtualLsiLogicController0:0</key><url>https://*/nfc/52a1/disk-0.vmdk</url></deviceUrl>
<deviceUrl><key>/vm-1/VirtualLsiLogicController0:1</key><url>https://*/nfc/52a1/disk-1.vmdk</url></deviceUrl>
</val></propSet>
</objects></returnval></RetrievePropertiesExResponse>"#,
    ));

    let status = soap::parse_lease_status(&document).expect("status should decode");

    assert_eq!(status.state, LeaseState::Ready);
    assert_eq!(
        status.device_urls,
        vec![
            String::from("https://*/nfc/52a1/disk-0.vmdk"),
            String::from("https://*/nfc/52a1/disk-1.vmdk"),
        ]
    );
}

#[test]
fn error_lease_carries_localized_message() {
    let document = parse(&wrap(
        r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval><objects>
<obj type="HttpNfcLease">52a1</obj>
<propSet><name>state</name><val xsi:type="HttpNfcLeaseState">error</val></propSet>
<propSet><name>error</name><val xsi:type="LocalizedMethodFault">
<fault xsi:type="FileLocked"></fault><localizedMessage>Unable to access file since it is locked</localizedMessage>
</val></propSet>
</objects></returnval></RetrievePropertiesExResponse>"#,
    ));

    let status = soap::parse_lease_status(&document).expect("status should decode");

    assert_eq!(
        status.state,
        LeaseState::Error(Some(String::from("Unable to access file since it is locked")))
    );
    assert!(status.device_urls.is_empty());
}

#[test]
fn session_cookie_is_taken_from_set_cookie() {
    let mut headers = HeaderMap::new();
    headers.append(SET_COOKIE, HeaderValue::from_static("other=1; Path=/"));
    headers.append(
        SET_COOKIE,
        HeaderValue::from_static("vmware_soap_session=\"abc123\"; Path=/; HttpOnly; Secure;"),
    );

    assert_eq!(
        session_cookie(&headers).as_deref(),
        Some("vmware_soap_session=\"abc123\"")
    );
}

#[test]
fn authority_omits_default_port() {
    assert_eq!(authority(&config(443)), "esxi.lab");
    assert_eq!(authority(&config(8443)), "esxi.lab:8443");
}

#[rstest]
#[case::default_port(443, "[fe80::1]")]
#[case::custom_port(8443, "[fe80::1]:8443")]
fn authority_brackets_ipv6_literals(#[case] port: u16, #[case] expected: &str) {
    let mut ipv6 = config(port);
    ipv6.host = String::from("fe80::1");
    assert_eq!(authority(&ipv6), expected);

    ipv6.host = String::from("[fe80::1]");
    assert_eq!(authority(&ipv6), expected);
}

#[tokio::test]
async fn calls_before_connect_fail_without_network() {
    let session = VsphereSession::new(&config(443)).expect("session should build");
    let lease = LeaseHandle {
        id: String::from("52a1"),
    };

    let err = session
        .lease_status(&lease)
        .await
        .expect_err("unconnected session should fail");

    assert_eq!(err, VsphereError::NotConnected);
}
