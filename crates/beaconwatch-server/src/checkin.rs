//! Startup check-in with the fleet controller.
//!
//! A stashed configuration that names the receiver (`name`), one of its
//! network interfaces (`interface`) and a controller URL (`controller`) is
//! announced once at startup: the interface's IPv4 address is looked up and
//! `{name, controller, address, interface}` is posted to the controller as
//! the form field `json`. Any failure is logged and startup continues.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use beaconwatch_core::ConfigDocument;
use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CheckInError {
    #[error("interface {0} doesn't exist")]
    NoSuchInterface(String),

    #[error("interface {0} has no IPv4 address")]
    NoAddress(String),

    #[error("interface lookup failed: {0}")]
    Lookup(#[from] io::Error),

    #[error("check-in request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("check-in payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where and as whom to check in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckInTarget {
    pub name: String,
    pub interface: String,
    pub controller: String,
}

impl CheckInTarget {
    /// `None` unless the document carries all three check-in fields.
    pub fn from_document(doc: &ConfigDocument) -> Option<Self> {
        Some(Self {
            name: doc.name.clone()?,
            interface: doc.interface.clone()?,
            controller: doc.controller.clone()?,
        })
    }
}

/// The announcement posted to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub name: String,
    pub controller: String,
    pub address: String,
    pub interface: String,
}

impl Registration {
    pub fn new(target: &CheckInTarget, address: Ipv4Addr) -> Self {
        Self {
            name: target.name.clone(),
            controller: target.controller.clone(),
            address: address.to_string(),
            interface: target.interface.clone(),
        }
    }
}

/// Post `registration` to its controller and return the response body.
pub async fn send(registration: &Registration) -> Result<String, CheckInError> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    let payload = serde_json::to_string(registration)?;
    let response = client
        .post(&registration.controller)
        .form(&[("json", payload)])
        .send()
        .await?
        .error_for_status()?;
    Ok(response.text().await?)
}

/// Check in if `doc` asks for it. Never fails; problems are logged.
pub async fn check_in(doc: &ConfigDocument) {
    let Some(target) = CheckInTarget::from_document(doc) else {
        info!("configuration has no check-in items");
        return;
    };
    let address = match interface_ipv4(&target.interface) {
        Ok(address) => address,
        Err(e) => {
            warn!("can't check in: {e}");
            return;
        }
    };
    let registration = Registration::new(&target, address);
    match send(&registration).await {
        Ok(body) => info!("check-in with {} answered: {body}", target.controller),
        Err(e) => warn!("check-in with {} failed, continuing: {e}", target.controller),
    }
}

/// First IPv4 address assigned to interface `name`.
#[cfg(unix)]
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr, CheckInError> {
    use std::ffi::CStr;

    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: on success `head` owns a list released by freeifaddrs below.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error().into());
    }

    let mut seen = false;
    let mut found = None;
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: every node reached from `head` stays valid until freeifaddrs.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;
        if entry.ifa_name.is_null() {
            continue;
        }
        let ifname = unsafe { CStr::from_ptr(entry.ifa_name) };
        if ifname.to_bytes() != name.as_bytes() {
            continue;
        }
        seen = true;
        if entry.ifa_addr.is_null() {
            continue;
        }
        let family = unsafe { (*entry.ifa_addr).sa_family };
        if i32::from(family) == libc::AF_INET {
            // SAFETY: AF_INET addresses are sockaddr_in.
            let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
            found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
            break;
        }
    }
    unsafe { libc::freeifaddrs(head) };

    match (found, seen) {
        (Some(address), _) => Ok(address),
        (None, true) => Err(CheckInError::NoAddress(name.to_string())),
        (None, false) => Err(CheckInError::NoSuchInterface(name.to_string())),
    }
}

#[cfg(not(unix))]
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr, CheckInError> {
    Err(CheckInError::NoSuchInterface(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::{Form, Router, extract::State, routing::post};
    use tokio::sync::Mutex;

    fn doc(json: &str) -> ConfigDocument {
        ConfigDocument::from_json_str(json).unwrap()
    }

    #[test]
    fn target_needs_all_three_fields() {
        let full = doc(r#"{"name": "pi-lab", "interface": "eth0", "controller": "http://fleet/in"}"#);
        assert_eq!(
            CheckInTarget::from_document(&full),
            Some(CheckInTarget {
                name: "pi-lab".to_string(),
                interface: "eth0".to_string(),
                controller: "http://fleet/in".to_string(),
            })
        );
        let partial = doc(r#"{"name": "pi-lab", "interface": "eth0"}"#);
        assert_eq!(CheckInTarget::from_document(&partial), None);
    }

    #[test]
    fn unknown_interface_is_reported() {
        let err = interface_ipv4("no-such-if0").unwrap_err();
        assert!(matches!(err, CheckInError::NoSuchInterface(_)), "{err}");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn loopback_has_an_ipv4_address() {
        assert_eq!(interface_ipv4("lo").unwrap(), Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn registration_is_posted_as_json_form_field() {
        type Seen = Arc<Mutex<Option<serde_json::Value>>>;

        async fn record(
            State(seen): State<Seen>,
            Form(form): Form<HashMap<String, String>>,
        ) -> &'static str {
            let body = form
                .get("json")
                .map(|j| serde_json::from_str::<serde_json::Value>(j).unwrap());
            *seen.lock().await = body;
            "welcome"
        }

        let seen: Seen = Arc::new(Mutex::new(None));
        let app = Router::new()
            .route("/checkin", post(record))
            .with_state(Arc::clone(&seen));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let target = CheckInTarget {
            name: "pi-lab".to_string(),
            interface: "eth0".to_string(),
            controller: format!("http://{addr}/checkin"),
        };
        let reply = send(&Registration::new(&target, Ipv4Addr::new(10, 0, 0, 7)))
            .await
            .unwrap();
        assert_eq!(reply, "welcome");

        let body = seen.lock().await.clone().unwrap();
        assert_eq!(body["name"], "pi-lab");
        assert_eq!(body["address"], "10.0.0.7");
        assert_eq!(body["interface"], "eth0");
        assert_eq!(body["controller"], target.controller);
    }

    #[tokio::test]
    async fn unreachable_controller_is_an_error() {
        let target = CheckInTarget {
            name: "pi-lab".to_string(),
            interface: "eth0".to_string(),
            controller: "http://127.0.0.1:1/checkin".to_string(),
        };
        let err = send(&Registration::new(&target, Ipv4Addr::LOCALHOST))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckInError::Http(_)), "{err}");
    }
}
