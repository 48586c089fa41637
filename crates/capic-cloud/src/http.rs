//! REST implementation of [`CloudClient`] over reqwest
//!
//! Mutations are answered with `202 Accepted` and a `Location` header that
//! points at `/requests/{id}/status`; the request id is taken from there and
//! the resource id from the response body.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capic_common::credentials::{CloudAuth, CloudCredentials};
use reqwest::header::LOCATION;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::client::{CloudClient, CloudClientFactory};
use crate::error::{CloudError, CloudResult};
use crate::types::{
    IpBlockInfo, IpBlockSpec, MutationOutcome, NicInfo, NicSpec, RequestStatus, ResourceState,
    ServerInfo, ServerSpec,
};

/// Public API endpoint
pub const DEFAULT_API_URL: &str = "https://api.ionos.com/cloudapi/v6";

const CONTRACT_HEADER: &str = "X-Contract-Number";

/// Transport settings
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// API base URL, unless the credentials override it
    pub api_url: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: concat!("capic/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// HTTP client for the cloud API
pub struct IonosCloudHttpClient {
    http: reqwest::Client,
    base_url: String,
    auth: CloudAuth,
    contract_number: Option<String>,
}

impl IonosCloudHttpClient {
    /// Create a client for the given credentials
    pub fn new(credentials: &CloudCredentials, config: &HttpConfig) -> CloudResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| CloudError::permanent(format!("failed to build HTTP client: {}", e)))?;
        let base_url = credentials
            .api_url
            .as_deref()
            .unwrap_or(&config.api_url)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            http,
            base_url,
            auth: credentials.auth.clone(),
            contract_number: credentials.contract_number.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let rb = self.http.request(method, url);
        let rb = match &self.auth {
            CloudAuth::Token(token) => rb.bearer_auth(token),
            CloudAuth::Basic { username, password } => rb.basic_auth(username, Some(password)),
        };
        match &self.contract_number {
            Some(contract) => rb.header(CONTRACT_HEADER, contract),
            None => rb,
        }
    }

    async fn send(&self, rb: RequestBuilder) -> CloudResult<Response> {
        let resp = rb.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CloudError::from_status(
            status.as_u16(),
            error_message(status.as_u16(), &body),
        ))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> CloudResult<T> {
        trace!(path, "GET");
        let resp = self.send(self.request(Method::GET, path).query(query)).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn mutate(&self, rb: RequestBuilder, known_id: Option<&str>) -> CloudResult<MutationOutcome> {
        let resp = self.send(rb).await?;
        let request_id = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(request_id_from_location);
        let body = resp.bytes().await?;
        let resource_id = serde_json::from_slice::<IdOnly>(&body)
            .ok()
            .and_then(|b| b.id)
            .or_else(|| known_id.map(str::to_string));

        debug!(request_id = ?request_id, resource_id = ?resource_id, "Mutation accepted");
        Ok(match request_id {
            Some(request_id) => MutationOutcome::Accepted {
                request_id,
                resource_id,
            },
            None => MutationOutcome::Completed { resource_id },
        })
    }
}

#[async_trait]
impl CloudClient for IonosCloudHttpClient {
    async fn create_server(&self, spec: &ServerSpec) -> CloudResult<MutationOutcome> {
        let path = format!("/datacenters/{}/servers", spec.datacenter_id);
        let body = server_body(spec);
        self.mutate(self.request(Method::POST, &path).json(&body), None)
            .await
    }

    async fn find_server_by_name(
        &self,
        datacenter_id: &str,
        name: &str,
    ) -> CloudResult<Option<ServerInfo>> {
        let path = format!("/datacenters/{}/servers", datacenter_id);
        let list: Collection<ServerDto> = self
            .get_json(&path, &[("depth", "3"), ("filter.name", name)])
            .await?;
        Ok(list
            .items
            .into_iter()
            .map(ServerInfo::from)
            .find(|s| s.name == name))
    }

    async fn describe_server(&self, datacenter_id: &str, server_id: &str) -> CloudResult<ServerInfo> {
        let path = format!("/datacenters/{}/servers/{}", datacenter_id, server_id);
        let dto: ServerDto = self.get_json(&path, &[("depth", "3")]).await?;
        Ok(dto.into())
    }

    async fn delete_server(&self, datacenter_id: &str, server_id: &str) -> CloudResult<MutationOutcome> {
        let path = format!("/datacenters/{}/servers/{}", datacenter_id, server_id);
        let rb = self
            .request(Method::DELETE, &path)
            .query(&[("deleteVolumes", "true")]);
        self.mutate(rb, Some(server_id)).await
    }

    async fn attach_nic(
        &self,
        datacenter_id: &str,
        server_id: &str,
        nic: &NicSpec,
    ) -> CloudResult<MutationOutcome> {
        let path = format!("/datacenters/{}/servers/{}/nics", datacenter_id, server_id);
        let body = serde_json::json!({
            "properties": {
                "name": nic.name,
                "lan": nic.lan_id,
                "dhcp": nic.dhcp,
            }
        });
        self.mutate(self.request(Method::POST, &path).json(&body), None)
            .await
    }

    async fn allocate_ip(&self, block: &IpBlockSpec) -> CloudResult<MutationOutcome> {
        let body = serde_json::json!({
            "properties": {
                "name": block.name,
                "location": block.location,
                "size": block.size,
            }
        });
        self.mutate(self.request(Method::POST, "/ipblocks").json(&body), None)
            .await
    }

    async fn describe_ip_block(&self, ip_block_id: &str) -> CloudResult<IpBlockInfo> {
        let dto: IpBlockDto = self
            .get_json(&format!("/ipblocks/{}", ip_block_id), &[("depth", "1")])
            .await?;
        Ok(dto.into())
    }

    async fn find_ip_block_by_name(
        &self,
        location: &str,
        name: &str,
    ) -> CloudResult<Option<IpBlockInfo>> {
        let list: Collection<IpBlockDto> = self
            .get_json(
                "/ipblocks",
                &[("depth", "1"), ("filter.location", location), ("filter.name", name)],
            )
            .await?;
        Ok(list
            .items
            .into_iter()
            .map(IpBlockInfo::from)
            .find(|b| b.name == name && b.location == location))
    }

    async fn release_ip(&self, ip_block_id: &str) -> CloudResult<MutationOutcome> {
        let path = format!("/ipblocks/{}", ip_block_id);
        self.mutate(self.request(Method::DELETE, &path), Some(ip_block_id))
            .await
    }

    async fn request_status(&self, request_id: &str) -> CloudResult<RequestStatus> {
        let dto: RequestStatusDto = self
            .get_json(&format!("/requests/{}/status", request_id), &[])
            .await?;
        Ok(RequestStatus::parse(
            &dto.metadata.status,
            dto.metadata.message.as_deref(),
        ))
    }

    async fn verify_location(&self, location: &str) -> CloudResult<()> {
        let _: serde_json::Value = self
            .get_json(&format!("/locations/{}", location), &[("depth", "0")])
            .await?;
        Ok(())
    }

    async fn verify_datacenter(&self, datacenter_id: &str) -> CloudResult<()> {
        let _: serde_json::Value = self
            .get_json(&format!("/datacenters/{}", datacenter_id), &[("depth", "0")])
            .await?;
        Ok(())
    }
}

/// Builds [`IonosCloudHttpClient`]s
pub struct HttpClientFactory {
    config: HttpConfig,
}

impl HttpClientFactory {
    /// Create a factory with the given transport settings
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }
}

impl CloudClientFactory for HttpClientFactory {
    fn build(&self, credentials: &CloudCredentials) -> CloudResult<Arc<dyn CloudClient>> {
        Ok(Arc::new(IonosCloudHttpClient::new(credentials, &self.config)?))
    }
}

/// Extract `{id}` from `.../requests/{id}/status`
fn request_id_from_location(location: &str) -> Option<String> {
    let mut segments = location.split('/');
    segments.find(|s| *s == "requests")?;
    segments
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Human-readable message from an error response
fn error_message(status: u16, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let messages: Vec<String> = parsed
            .messages
            .into_iter()
            .filter_map(|m| m.message)
            .collect();
        if !messages.is_empty() {
            return messages.join("; ");
        }
    }
    if body.trim().is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, body.trim())
    }
}

fn server_body(spec: &ServerSpec) -> serde_json::Value {
    let mut volume = serde_json::json!({
        "name": format!("{}-boot", spec.name),
        "size": spec.disk_size_gb,
        "type": "HDD",
    });
    // UUIDs are image ids, anything else is an alias like "ubuntu:latest"
    let image_field = if looks_like_uuid(&spec.image) {
        "image"
    } else {
        "imageAlias"
    };
    volume[image_field] = serde_json::Value::String(spec.image.clone());
    if let Some(user_data) = &spec.user_data {
        volume["userData"] = serde_json::Value::String(user_data.clone());
    }

    serde_json::json!({
        "properties": {
            "name": spec.name,
            "cores": spec.cores,
            "ram": spec.ram_mb,
            "availabilityZone": spec.availability_zone.as_deref().unwrap_or("AUTO"),
        },
        "entities": {
            "volumes": { "items": [ { "properties": volume } ] }
        }
    })
}

fn looks_like_uuid(s: &str) -> bool {
    s.len() == 36
        && s.chars().enumerate().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

// Wire formats

#[derive(Deserialize)]
struct IdOnly {
    id: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    messages: Vec<ErrorMessage>,
}

#[derive(Deserialize)]
struct ErrorMessage {
    message: Option<String>,
}

#[derive(Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize, Default)]
struct Metadata {
    #[serde(default)]
    state: Option<String>,
}

impl Metadata {
    fn resource_state(&self) -> ResourceState {
        self.state
            .as_deref()
            .map(ResourceState::parse)
            .unwrap_or(ResourceState::Unknown)
    }
}

#[derive(Deserialize)]
struct ServerDto {
    id: String,
    #[serde(default)]
    properties: ServerProps,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    entities: Option<ServerEntities>,
}

#[derive(Deserialize, Default)]
struct ServerProps {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "vmState")]
    vm_state: Option<String>,
}

#[derive(Deserialize)]
struct ServerEntities {
    #[serde(default)]
    nics: Option<Collection<NicDto>>,
}

#[derive(Deserialize)]
struct NicDto {
    id: String,
    #[serde(default)]
    properties: NicProps,
}

#[derive(Deserialize, Default)]
struct NicProps {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    lan: u32,
    #[serde(default)]
    ips: Vec<String>,
}

impl From<ServerDto> for ServerInfo {
    fn from(dto: ServerDto) -> Self {
        let state = dto.metadata.resource_state();
        let nics = dto
            .entities
            .and_then(|e| e.nics)
            .map(|c| c.items)
            .unwrap_or_default()
            .into_iter()
            .map(|n| NicInfo {
                id: n.id,
                name: n.properties.name.unwrap_or_default(),
                lan_id: n.properties.lan,
                ips: n.properties.ips,
            })
            .collect();
        ServerInfo {
            id: dto.id,
            name: dto.properties.name,
            state,
            vm_state: dto.properties.vm_state,
            nics,
        }
    }
}

#[derive(Deserialize)]
struct IpBlockDto {
    id: String,
    #[serde(default)]
    properties: IpBlockProps,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Deserialize, Default)]
struct IpBlockProps {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    location: String,
    #[serde(default)]
    ips: Vec<String>,
}

impl From<IpBlockDto> for IpBlockInfo {
    fn from(dto: IpBlockDto) -> Self {
        let state = dto.metadata.resource_state();
        IpBlockInfo {
            id: dto.id,
            name: dto.properties.name.unwrap_or_default(),
            location: dto.properties.location,
            ips: dto.properties.ips,
            state,
        }
    }
}

#[derive(Deserialize)]
struct RequestStatusDto {
    metadata: RequestStatusMeta,
}

#[derive(Deserialize)]
struct RequestStatusMeta {
    status: String,
    #[serde(default)]
    message: Option<String>,
}
