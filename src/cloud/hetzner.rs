//! Thin adapter of [`CloudApi`] onto the Hetzner Cloud v1 REST API.
//!
//! Chosen because the system's own defaults (`server_type = cpx21`,
//! `location = fsn1`) are Hetzner Cloud identifiers. This module is the
//! external cloud-provider API client: it is deliberately literal, and
//! the core is tested against the in-memory fake in `testutil.rs` rather
//! than against this adapter directly.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::model::{
    CancelToken, CredentialRecord, HostDescriptor, HostStatus, ProvisionSpec, VolumeDescriptor,
    VolumeStatus,
};

use super::client::{CloudApi, CloudError};

const API_BASE: &str = "https://api.hetzner.cloud/v1";

pub struct HetznerApi {
    client: reqwest::Client,
    token: String,
}

impl HetznerApi {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
        }
    }

    fn req(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{API_BASE}{path}"))
            .bearer_auth(&self.token)
    }

    async fn run<T: for<'de> Deserialize<'de>>(
        &self,
        builder: reqwest::RequestBuilder,
        ct: &CancelToken,
    ) -> Result<T, CloudError> {
        let response = tokio::select! {
            _ = ct.cancelled() => return Err(CloudError::Cancelled),
            result = builder.send() => result.map_err(|e| CloudError::Http(e.to_string()))?,
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CloudError::Http(e.to_string()))?;

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CloudError::RateLimited { retry_after_secs: 60 });
        }
        if status == reqwest::StatusCode::CONFLICT {
            return Err(CloudError::Conflict(body));
        }
        if !status.is_success() {
            if CloudError::is_not_found_message(&body) {
                return Err(CloudError::NotFound);
            }
            return Err(CloudError::Http(format!("{status}: {body}")));
        }

        serde_json::from_str(&body).map_err(|e| CloudError::Decode(e.to_string()))
    }
}

#[derive(Deserialize)]
struct ServerWire {
    id: u64,
    name: String,
    status: String,
    public_net: PublicNetWire,
    volumes: Vec<u64>,
    created: String,
}

#[derive(Deserialize)]
struct PublicNetWire {
    ipv4: Option<Ipv4Wire>,
}

#[derive(Deserialize)]
struct Ipv4Wire {
    ip: String,
}

#[derive(Deserialize)]
struct ServersListWire {
    servers: Vec<ServerWire>,
}

#[derive(Deserialize)]
struct ServerWrapperWire {
    server: ServerWire,
}

fn parse_status(raw: &str) -> HostStatus {
    match raw {
        "running" => HostStatus::Running,
        "initializing" | "starting" => HostStatus::Initializing,
        "off" | "stopping" => HostStatus::Off,
        "deleting" => HostStatus::Deleting,
        _ => HostStatus::Unknown,
    }
}

fn into_host_descriptor(wire: ServerWire) -> HostDescriptor {
    HostDescriptor {
        id: wire.id.to_string(),
        name: wire.name,
        status: parse_status(&wire.status),
        ipv4: wire.public_net.ipv4.map(|v| v.ip).unwrap_or_default(),
        volume_id: wire.volumes.first().map(|v| v.to_string()),
        created_at: humantime::parse_rfc3339_weak(&wire.created).unwrap_or(
            std::time::SystemTime::now(),
        ),
    }
}

#[derive(Deserialize)]
struct VolumeWire {
    id: u64,
    name: String,
    size: u32,
    location: LocationWire,
    status: String,
}

#[derive(Deserialize)]
struct LocationWire {
    name: String,
}

#[derive(Deserialize)]
struct VolumesListWire {
    volumes: Vec<VolumeWire>,
}

#[derive(Deserialize)]
struct VolumeWrapperWire {
    volume: VolumeWire,
}

fn parse_volume_status(raw: &str) -> VolumeStatus {
    match raw {
        "available" => VolumeStatus::Available,
        "creating" => VolumeStatus::Creating,
        _ => VolumeStatus::Attached,
    }
}

fn into_volume_descriptor(wire: VolumeWire) -> VolumeDescriptor {
    VolumeDescriptor {
        id: wire.id.to_string(),
        name: wire.name,
        size_gib: wire.size,
        location: wire.location.name,
        status: parse_volume_status(&wire.status),
    }
}

#[derive(Deserialize)]
struct SshKeyWire {
    id: u64,
    fingerprint: String,
    public_key: String,
}

#[derive(Deserialize)]
struct SshKeysListWire {
    ssh_keys: Vec<SshKeyWire>,
}

#[derive(Deserialize)]
struct SshKeyWrapperWire {
    ssh_key: SshKeyWire,
}

/// Normalise `type + payload`, stripping the trailing comment.
fn normalise_public_key(key: &str) -> String {
    let mut parts = key.split_whitespace();
    let typ = parts.next().unwrap_or_default();
    let payload = parts.next().unwrap_or_default();
    format!("{typ} {payload}")
}

#[async_trait]
impl CloudApi for HetznerApi {
    async fn list_hosts(&self, ct: CancelToken) -> Result<Vec<HostDescriptor>, CloudError> {
        let wire: ServersListWire = self
            .run(self.req(reqwest::Method::GET, "/servers"), &ct)
            .await?;
        Ok(wire.servers.into_iter().map(into_host_descriptor).collect())
    }

    async fn get_host(&self, id: &str, ct: CancelToken) -> Result<HostDescriptor, CloudError> {
        let wire: ServerWrapperWire = self
            .run(self.req(reqwest::Method::GET, &format!("/servers/{id}")), &ct)
            .await?;
        Ok(into_host_descriptor(wire.server))
    }

    async fn provision_host(
        &self,
        spec: ProvisionSpec,
        ct: CancelToken,
    ) -> Result<HostDescriptor, CloudError> {
        let mut volumes = Vec::new();
        if let Some(volume_id) = &spec.volume_id {
            if let Ok(id) = volume_id.parse::<u64>() {
                volumes.push(id);
            }
        }
        let credential_id: u64 = spec
            .credential_id
            .parse()
            .map_err(|_| CloudError::Decode("invalid credential id".into()))?;

        let body = json!({
            "name": spec.name,
            "server_type": spec.server_type,
            "location": spec.location,
            "image": spec.image,
            "user_data": spec.user_data,
            "ssh_keys": [credential_id],
            "volumes": volumes,
        });

        let wire: ServerWrapperWire = self
            .run(
                self.req(reqwest::Method::POST, "/servers").json(&body),
                &ct,
            )
            .await?;
        Ok(into_host_descriptor(wire.server))
    }

    async fn destroy_host(&self, id: &str, ct: CancelToken) -> Result<(), CloudError> {
        match self
            .run::<serde_json::Value>(
                self.req(reqwest::Method::DELETE, &format!("/servers/{id}")),
                &ct,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(CloudError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn find_or_create_data_volume(
        &self,
        location: &str,
        size_gib: u32,
        ct: CancelToken,
    ) -> Result<VolumeDescriptor, CloudError> {
        let wire: VolumesListWire = self
            .run(self.req(reqwest::Method::GET, "/volumes"), &ct)
            .await?;

        let mut candidates: Vec<VolumeDescriptor> = wire
            .volumes
            .into_iter()
            .map(into_volume_descriptor)
            .filter(|v| {
                v.location == location
                    && v.name.contains(crate::constants::DATA_VOLUME_SUBSTR)
                    && v.status == VolumeStatus::Available
            })
            .collect();

        // At most one canonical volume per location; extras are ignored
        // and logged.
        if candidates.len() > 1 {
            tracing::warn!(
                count = candidates.len(),
                location,
                "multiple available dockbridge data volumes found, ignoring extras"
            );
        }

        if let Some(volume) = candidates.pop() {
            return Ok(volume);
        }

        let body = json!({
            "name": format!("{}-{}", crate::constants::DATA_VOLUME_SUBSTR, location),
            "size": size_gib,
            "location": location,
            "format": "ext4",
        });
        let wire: VolumeWrapperWire = self
            .run(
                self.req(reqwest::Method::POST, "/volumes").json(&body),
                &ct,
            )
            .await?;
        Ok(into_volume_descriptor(wire.volume))
    }

    async fn register_or_find_credential(
        &self,
        public_key: &str,
        ct: CancelToken,
    ) -> Result<CredentialRecord, CloudError> {
        let wanted = normalise_public_key(public_key);

        let wire: SshKeysListWire = self
            .run(self.req(reqwest::Method::GET, "/ssh_keys"), &ct)
            .await?;

        if let Some(existing) = wire
            .ssh_keys
            .into_iter()
            .find(|k| normalise_public_key(&k.public_key) == wanted)
        {
            return Ok(CredentialRecord {
                id: existing.id.to_string(),
                fingerprint: existing.fingerprint,
                normalised_key: wanted,
            });
        }

        let body = json!({
            "name": format!("dockbridge-{}", &wanted[wanted.len().saturating_sub(8)..]),
            "public_key": public_key,
        });
        let wire: SshKeyWrapperWire = self
            .run(
                self.req(reqwest::Method::POST, "/ssh_keys").json(&body),
                &ct,
            )
            .await?;
        Ok(CredentialRecord {
            id: wire.ssh_key.id.to_string(),
            fingerprint: wire.ssh_key.fingerprint,
            normalised_key: wanted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_key_ignoring_comment() {
        let a = "ssh-ed25519 AAAABBBB user@host";
        let b = "ssh-ed25519 AAAABBBB other-comment";
        assert_eq!(normalise_public_key(a), normalise_public_key(b));
    }

    #[test]
    fn status_strings_map_to_variants() {
        assert_eq!(parse_status("running"), HostStatus::Running);
        assert_eq!(parse_status("off"), HostStatus::Off);
        assert_eq!(parse_status("bogus"), HostStatus::Unknown);
    }

    #[test]
    fn not_found_message_matches_expected_substrings() {
        assert!(CloudError::is_not_found_message("server not found"));
        assert!(CloudError::is_not_found_message("error: not_found"));
        assert!(!CloudError::is_not_found_message("internal error"));
    }
}
