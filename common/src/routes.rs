//! Path to capability table shared by the device and host HTTP servers.
//!
//! Neither the stream engine nor the OTA controller know how they are
//! reached; each server walks [`ROUTES`] and binds a handler per capability.

use serde::Deserialize;

use crate::{
    config::OtaConfig,
    error::TriggerError,
    ota::{OtaHandle, OtaRequest},
    types::OtaTriggerResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Stream,
    TriggerUpdate,
    UpdateStatus,
    FlashToggle,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub method: HttpMethod,
    pub path: &'static str,
    pub capability: Capability,
}

const fn route(method: HttpMethod, path: &'static str, capability: Capability) -> Route {
    Route {
        method,
        path,
        capability,
    }
}

pub const ROUTES: &[Route] = &[
    route(HttpMethod::Get, "/", Capability::Stream),
    route(HttpMethod::Get, "/photo", Capability::Stream),
    route(HttpMethod::Get, "/update", Capability::TriggerUpdate),
    route(HttpMethod::Post, "/update", Capability::TriggerUpdate),
    route(HttpMethod::Get, "/update/status", Capability::UpdateStatus),
    route(HttpMethod::Get, "/flash", Capability::FlashToggle),
    route(HttpMethod::Get, "/cam", Capability::Viewer),
];

pub fn resolve(method: HttpMethod, path: &str) -> Option<Capability> {
    let path = path.split('?').next().unwrap_or(path);
    ROUTES
        .iter()
        .find(|route| route.method == method && route.path == path)
        .map(|route| route.capability)
}

/// Optional body of `POST /update`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct UpdateTrigger {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl UpdateTrigger {
    pub fn from_body(body: &[u8]) -> Result<Self, TriggerError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|_| TriggerError::InvalidRequest("invalid JSON body"))
    }

    pub fn into_request(self, config: &OtaConfig) -> OtaRequest {
        let url = self
            .url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| config.firmware_url.clone());

        OtaRequest {
            url,
            sha256: self.sha256.filter(|sha| !sha.trim().is_empty()),
            restart: true,
        }
    }
}

/// Claims the update slot for a trigger and builds the acknowledgement sent
/// before the attempt runs.
pub fn accept_trigger(
    handle: &OtaHandle,
    config: &OtaConfig,
    trigger: UpdateTrigger,
    now_ms: u64,
) -> Result<(OtaRequest, OtaTriggerResponse), TriggerError> {
    let request = trigger.into_request(config);
    handle.try_begin(&request, now_ms)?;

    let response = OtaTriggerResponse {
        accepted: true,
        in_progress: true,
        url: request.url.clone(),
    };
    Ok((request, response))
}

/// HTTP status for a refused trigger.
pub fn trigger_error_status(err: &TriggerError) -> u16 {
    match err {
        TriggerError::Busy(_) => 409,
        TriggerError::InvalidRequest(_) => 400,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::OtaStatus;

    fn config() -> OtaConfig {
        OtaConfig {
            firmware_url: "http://fw.local/camstream.bin".to_string(),
            ..OtaConfig::default()
        }
    }

    #[test]
    fn resolves_known_paths() {
        assert_eq!(resolve(HttpMethod::Get, "/"), Some(Capability::Stream));
        assert_eq!(
            resolve(HttpMethod::Post, "/update"),
            Some(Capability::TriggerUpdate)
        );
        assert_eq!(
            resolve(HttpMethod::Get, "/update/status?x=1"),
            Some(Capability::UpdateStatus)
        );
        assert_eq!(resolve(HttpMethod::Post, "/flash"), None);
        assert_eq!(resolve(HttpMethod::Get, "/missing"), None);
    }

    #[test]
    fn every_capability_is_reachable() {
        for capability in [
            Capability::Stream,
            Capability::TriggerUpdate,
            Capability::UpdateStatus,
            Capability::FlashToggle,
            Capability::Viewer,
        ] {
            assert!(ROUTES.iter().any(|route| route.capability == capability));
        }
    }

    #[test]
    fn empty_body_uses_configured_url() {
        let trigger = UpdateTrigger::from_body(b"  ").unwrap();
        let request = trigger.into_request(&config());

        assert_eq!(request.url, "http://fw.local/camstream.bin");
        assert_eq!(request.sha256, None);
        assert!(request.restart);
    }

    #[test]
    fn body_overrides_url_and_digest() {
        let digest = "0f".repeat(32);
        let body = format!(r#"{{"url":" https://cdn.local/b.bin ","sha256":"{digest}"}}"#);
        let request = UpdateTrigger::from_body(body.as_bytes())
            .unwrap()
            .into_request(&config());

        assert_eq!(request.url, "https://cdn.local/b.bin");
        assert_eq!(request.sha256, Some(digest));
    }

    #[test]
    fn malformed_body_is_rejected() {
        assert_eq!(
            UpdateTrigger::from_body(b"{url:"),
            Err(TriggerError::InvalidRequest("invalid JSON body"))
        );
    }

    #[test]
    fn second_trigger_is_busy() {
        let handle = OtaHandle::new();
        let (request, response) =
            accept_trigger(&handle, &config(), UpdateTrigger::default(), 0).unwrap();
        assert!(response.accepted);
        assert_eq!(response.url, request.url);

        let err = accept_trigger(&handle, &config(), UpdateTrigger::default(), 1).unwrap_err();
        assert_eq!(err, TriggerError::Busy(OtaStatus::Downloading));
        assert_eq!(trigger_error_status(&err), 409);
    }

    #[test]
    fn missing_url_is_a_bad_request() {
        let handle = OtaHandle::new();
        let err = accept_trigger(&handle, &OtaConfig::default(), UpdateTrigger::default(), 0)
            .unwrap_err();

        assert_eq!(trigger_error_status(&err), 400);
        assert_eq!(handle.status(), OtaStatus::Idle);
    }
}
