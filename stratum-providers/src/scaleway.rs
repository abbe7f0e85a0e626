use crate::{
    inventory, CloudProvider, InstanceRequest, ProviderError, ProviderResult, ResourceFilter, ResourceKind,
    ResourceSpec,
};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use stratum_common::{OsKind, MANAGED_TAG};

pub const DEFAULT_API_URL: &str = "https://api.scaleway.com";

const PAGE_SIZE: usize = 100;
const MAX_PAGES: u32 = 1000;

#[derive(Debug, Clone)]
pub struct ScalewayConfig {
    pub api_url: String,
    pub project_id: String,
    pub secret_key: String,
    pub zone: String,
    pub region: String,
}

pub struct ScalewayProvider {
    client: Client,
    config: ScalewayConfig,
}

fn gb_to_bytes(gb: u64) -> u64 {
    // Scaleway APIs use bytes; use decimal GB.
    gb.saturating_mul(1_000_000_000)
}

fn tags_to_wire(tags: &BTreeMap<String, String>) -> Vec<String> {
    tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

fn tags_from_wire(v: &Value) -> BTreeMap<String, String> {
    v.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.as_str())
                .map(|t| match t.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (t.to_string(), String::new()),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn strip_cidr(ip: &str) -> String {
    ip.split('/').next().unwrap_or(ip).to_string()
}

/// Map a non-success HTTP answer to a provider error.
///
/// Scaleway reports errors as `{"type": "...", "message": "..."}`. Quota errors come back
/// as 403 and must not be retried; other auth failures are treated as transient.
fn classify(status: StatusCode, body: &str) -> ProviderError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let api_type = parsed["type"].as_str().unwrap_or("").to_string();
    let message = parsed["message"]
        .as_str()
        .map(|s| s.to_string())
        .unwrap_or_else(|| body.chars().take(500).collect());
    let code = if api_type.is_empty() {
        format!("http_{}", status.as_u16())
    } else {
        api_type.clone()
    };

    if api_type == "quotas_exceeded" {
        return ProviderError::permanent(code, message);
    }
    if status == StatusCode::NOT_FOUND {
        return ProviderError::not_found(message);
    }
    match status.as_u16() {
        401 | 403 | 408 | 429 | 500..=599 => ProviderError::transient(code, message),
        _ => ProviderError::permanent(code, message),
    }
}

fn network_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ProviderError::transient("network", e.to_string())
    } else {
        ProviderError::permanent("http_client", e.to_string())
    }
}

impl ScalewayProvider {
    pub fn new(config: ScalewayConfig) -> anyhow::Result<Self> {
        // reqwest has no overall timeout by default.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()?;
        let config = ScalewayConfig {
            api_url: config.api_url.trim().trim_end_matches('/').to_string(),
            project_id: config.project_id.trim().to_string(),
            secret_key: config.secret_key.trim().to_string(),
            zone: config.zone.trim().to_string(),
            region: config.region.trim().to_string(),
        };
        Ok(Self { client, config })
    }

    fn instance_url(&self, path: &str) -> String {
        format!(
            "{}/instance/v1/zones/{}/{}",
            self.config.api_url, self.config.zone, path
        )
    }

    fn vpc_url(&self, path: &str) -> String {
        format!(
            "{}/vpc/v2/regions/{}/{}",
            self.config.api_url, self.config.region, path
        )
    }

    fn iam_url(&self, path: &str) -> String {
        format!("{}/iam/v1alpha1/{}", self.config.api_url, path)
    }

    fn block_url(&self, path: &str) -> String {
        format!(
            "{}/block/v1/zones/{}/{}",
            self.config.api_url, self.config.zone, path
        )
    }

    /// Collection URL restricted to the configured project. The Instance API names the
    /// parameter `project`, VPC and IAM name it `project_id`.
    fn scoped(&self, url: String, param: &str) -> String {
        if self.config.project_id.is_empty() {
            return url;
        }
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{}{}{}={}", url, sep, param, self.config.project_id)
    }

    async fn call(&self, method: Method, url: &str, body: Option<Value>) -> ProviderResult<Value> {
        tracing::debug!("🔵 [Scaleway API] {} {}", method, url);
        let mut req = self
            .client
            .request(method.clone(), url)
            .header("X-Auth-Token", &self.config.secret_key);
        if let Some(b) = &body {
            req = req.json(b);
        }
        let resp = req.send().await.map_err(network_error)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let err = classify(status, &text);
            if !err.is_not_found() {
                tracing::warn!(
                    "❌ [Scaleway API] {} {} failed: status={}, response={}",
                    method,
                    url,
                    status.as_u16(),
                    text
                );
            }
            return Err(err);
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let text = resp.text().await.map_err(network_error)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::permanent("bad_response", format!("{}: {}", url, e)))
    }

    async fn get(&self, url: &str) -> ProviderResult<Value> {
        self.call(Method::GET, url, None).await
    }

    async fn post(&self, url: &str, body: Value) -> ProviderResult<Value> {
        self.call(Method::POST, url, Some(body)).await
    }

    async fn patch(&self, url: &str, body: Value) -> ProviderResult<Value> {
        self.call(Method::PATCH, url, Some(body)).await
    }

    /// DELETE that tolerates an already-absent resource.
    async fn delete_url(&self, url: &str) -> ProviderResult<bool> {
        match self.call(Method::DELETE, url, None).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every item of a paginated collection. Pages are requested until one comes back
    /// short or `total_count` is reached.
    async fn list_all(&self, url: &str, field: &str) -> ProviderResult<Vec<Value>> {
        let sep = if url.contains('?') { '&' } else { '?' };
        let mut items: Vec<Value> = Vec::new();
        for page in 1..=MAX_PAGES {
            let resp = self
                .get(&format!("{}{}page={}&per_page={}", url, sep, page, PAGE_SIZE))
                .await?;
            let batch = resp[field].as_array().cloned().unwrap_or_default();
            let received = batch.len();
            items.extend(batch);
            let total_reached = resp["total_count"]
                .as_u64()
                .is_some_and(|total| items.len() as u64 >= total);
            if received < PAGE_SIZE || total_reached {
                return Ok(items);
            }
        }
        tracing::warn!(
            "⚠️ [Scaleway API] {} still paging after {} pages, list truncated",
            url,
            MAX_PAGES
        );
        Ok(items)
    }

    /// List a collection and keep the ids of items matching `keep`.
    async fn list_ids(
        &self,
        url: &str,
        field: &str,
        keep: impl Fn(&Value) -> bool,
    ) -> ProviderResult<Vec<String>> {
        Ok(self
            .list_all(url, field)
            .await?
            .iter()
            .filter(|item| keep(item))
            .filter_map(|item| item["id"].as_str().map(|s| s.to_string()))
            .collect())
    }

    async fn first_by_name(&self, kind: ResourceKind, name: &str) -> ProviderResult<Option<String>> {
        Ok(self
            .query(kind, &ResourceFilter::by_name(name))
            .await?
            .into_iter()
            .next())
    }

    async fn ensure_security_group_rules(&self, sg_id: &str, ports: &[u16]) -> ProviderResult<()> {
        let url = self.instance_url(&format!("security_groups/{}/rules", sg_id));
        let resp = self.get(&url).await?;
        let existing: Vec<u64> = resp["rules"]
            .as_array()
            .map(|rules| {
                rules
                    .iter()
                    .filter(|r| {
                        r["direction"].as_str() == Some("inbound")
                            && r["action"].as_str() == Some("accept")
                            && r["protocol"].as_str() == Some("TCP")
                    })
                    .filter_map(|r| r["dest_port_from"].as_u64())
                    .collect()
            })
            .unwrap_or_default();
        for port in ports {
            if existing.contains(&u64::from(*port)) {
                continue;
            }
            tracing::info!(
                "🔵 [Scaleway API] Opening inbound TCP {} on security group {}",
                port,
                sg_id
            );
            self.post(
                &url,
                json!({
                    "action": "accept",
                    "direction": "inbound",
                    "protocol": "TCP",
                    "ip_range": "0.0.0.0/0",
                    "dest_port_from": port,
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn create_instance(&self, req: &InstanceRequest) -> ProviderResult<String> {
        let body = json!({
            "name": req.name,
            "commercial_type": req.flavor,
            "image": req.image,
            "project": self.config.project_id,
            "tags": tags_to_wire(&req.tags),
            "dynamic_ip_required": false,
            "security_group": req.security_group_id,
            "volumes": {
                "0": {
                    "size": gb_to_bytes(req.storage_size_gb),
                    "volume_type": req.storage_policy,
                }
            }
        });
        tracing::info!(
            "🔵 [Scaleway API] Creating server: name={}, type={}, image={}, zone={}",
            req.name,
            req.flavor,
            req.image,
            self.config.zone
        );
        let resp = self.post(&self.instance_url("servers"), body).await?;
        let server_id = resp["server"]["id"]
            .as_str()
            .ok_or_else(|| ProviderError::permanent("bad_response", "No server id in create response"))?
            .to_string();
        let root_volume = resp["server"]["volumes"]["0"]["id"].as_str().map(|s| s.to_string());

        let finished: ProviderResult<()> = async {
            self.post(
                &self.instance_url(&format!("servers/{}/private_nics", server_id)),
                json!({ "private_network_id": req.subnet_id }),
            )
            .await?;

            if let Some(user_data) = req.user_data.as_deref().filter(|s| !s.trim().is_empty()) {
                self.put_user_data(&server_id, user_data).await?;
            }

            self.post(
                &self.instance_url(&format!("servers/{}/action", server_id)),
                json!({ "action": "poweron" }),
            )
            .await?;
            Ok(())
        }
        .await;

        // A half-built server would be adopted by name on the next run; remove it.
        if let Err(e) = finished {
            tracing::error!(
                "❌ [Scaleway API] Server {} ({}) setup failed, discarding it: {}",
                server_id,
                req.name,
                e
            );
            self.discard_server(&server_id, root_volume.as_deref()).await;
            return Err(e);
        }

        tracing::info!("✅ [Scaleway API] Server created: id={}, name={}", server_id, req.name);
        Ok(server_id)
    }

    /// Best-effort removal of a server that never powered on, with its root volume.
    async fn discard_server(&self, server_id: &str, root_volume: Option<&str>) {
        if let Err(e) = self
            .delete_url(&self.instance_url(&format!("servers/{}", server_id)))
            .await
        {
            tracing::warn!("⚠️ [Scaleway API] Could not delete server {}: {}", server_id, e);
            return;
        }
        let Some(volume_id) = root_volume else {
            return;
        };
        // Local volumes live in the Instance API, SBS volumes in the Block API.
        let path = format!("volumes/{}", volume_id);
        match self.delete_url(&self.instance_url(&path)).await {
            Ok(true) => {}
            _ => {
                if let Err(e) = self.delete_url(&self.block_url(&path)).await {
                    tracing::warn!("⚠️ [Scaleway API] Could not delete volume {}: {}", volume_id, e);
                }
            }
        }
    }

    async fn put_user_data(&self, server_id: &str, user_data: &str) -> ProviderResult<()> {
        let url = self.instance_url(&format!("servers/{}/user_data/cloud-init", server_id));
        let resp = self
            .client
            .patch(&url)
            .header("X-Auth-Token", &self.config.secret_key)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(user_data.to_string())
            .send()
            .await
            .map_err(network_error)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify(status, &text));
        }
        Ok(())
    }

    fn parse_server(server: &Value) -> Option<inventory::DiscoveredInstance> {
        let id = server["id"].as_str()?.to_string();
        let tags = tags_from_wire(&server["tags"]);
        let os = tags.get("os").and_then(|s| OsKind::parse(s));

        let private_ip = server["private_ip"]
            .as_str()
            .map(strip_cidr)
            .or_else(|| {
                server["private_nics"].as_array().and_then(|nics| {
                    nics.iter()
                        .flat_map(|nic| nic["private_ips"].as_array().cloned().unwrap_or_default())
                        .find_map(|ip| ip["address"].as_str().map(strip_cidr))
                })
            });

        // Flexible IPs show up either as the legacy public_ip or in public_ips.
        let public = if server["public_ip"].is_object() {
            Some(server["public_ip"].clone())
        } else {
            server["public_ips"]
                .as_array()
                .and_then(|ips| ips.first().cloned())
        };
        let public_ip = public
            .as_ref()
            .and_then(|ip| ip["address"].as_str())
            .map(strip_cidr);
        let floating_ip_id = public
            .as_ref()
            .filter(|ip| !ip["dynamic"].as_bool().unwrap_or(false))
            .and_then(|ip| ip["id"].as_str())
            .map(|s| s.to_string());

        let root = &server["volumes"]["0"];
        Some(inventory::DiscoveredInstance {
            provider_id: id,
            name: server["name"].as_str().unwrap_or_default().to_string(),
            status: server["state"].as_str().unwrap_or("unknown").to_string(),
            image: server["image"]["id"]
                .as_str()
                .or_else(|| server["image"].as_str())
                .unwrap_or_default()
                .to_string(),
            flavor: server["commercial_type"].as_str().unwrap_or_default().to_string(),
            os,
            storage_size_gb: root["size"].as_u64().map(|b| b / 1_000_000_000),
            storage_policy: root["volume_type"].as_str().map(|s| s.to_string()),
            private_ip,
            public_ip,
            floating_ip_id,
            tags,
        })
    }
}

#[async_trait]
impl CloudProvider for ScalewayProvider {
    fn name(&self) -> &str {
        "scaleway"
    }

    async fn ensure(&self, spec: &ResourceSpec) -> ProviderResult<String> {
        match spec {
            ResourceSpec::Vpc { name } => {
                if let Some(id) = self.first_by_name(ResourceKind::Vpc, name).await? {
                    return Ok(id);
                }
                let resp = self
                    .post(
                        &self.vpc_url("vpcs"),
                        json!({ "name": name, "project_id": self.config.project_id }),
                    )
                    .await?;
                resp["id"]
                    .as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| ProviderError::permanent("bad_response", "No vpc id in response"))
            }
            ResourceSpec::Subnet { name, vpc_id } => {
                let filter = ResourceFilter {
                    name: Some(name.clone()),
                    parent_id: Some(vpc_id.clone()),
                    ..Default::default()
                };
                if let Some(id) = self.query(ResourceKind::Subnet, &filter).await?.into_iter().next() {
                    return Ok(id);
                }
                let resp = self
                    .post(
                        &self.vpc_url("private-networks"),
                        json!({
                            "name": name,
                            "project_id": self.config.project_id,
                            "vpc_id": vpc_id,
                        }),
                    )
                    .await?;
                resp["id"]
                    .as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| ProviderError::permanent("bad_response", "No private network id in response"))
            }
            ResourceSpec::SecurityGroup {
                name,
                inbound_tcp_ports,
            } => {
                let id = match self.first_by_name(ResourceKind::SecurityGroup, name).await? {
                    Some(id) => id,
                    None => {
                        let resp = self
                            .post(
                                &self.instance_url("security_groups"),
                                json!({
                                    "name": name,
                                    "project": self.config.project_id,
                                    "stateful": true,
                                    "inbound_default_policy": "drop",
                                    "outbound_default_policy": "accept",
                                }),
                            )
                            .await?;
                        resp["security_group"]["id"]
                            .as_str()
                            .map(|s| s.to_string())
                            .ok_or_else(|| {
                                ProviderError::permanent("bad_response", "No security group id in response")
                            })?
                    }
                };
                self.ensure_security_group_rules(&id, inbound_tcp_ports).await?;
                Ok(id)
            }
            ResourceSpec::SshKey { name, public_key } => {
                if let Some(id) = self.first_by_name(ResourceKind::SshKey, name).await? {
                    return Ok(id);
                }
                let resp = self
                    .post(
                        &self.iam_url("ssh-keys"),
                        json!({
                            "name": name,
                            "public_key": public_key.trim(),
                            "project_id": self.config.project_id,
                        }),
                    )
                    .await?;
                resp["id"]
                    .as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| ProviderError::permanent("bad_response", "No ssh key id in response"))
            }
            ResourceSpec::Instance(req) => {
                let url = self.scoped(self.instance_url("servers"), "project");
                let existing = self
                    .list_all(&url, "servers")
                    .await?
                    .into_iter()
                    .find(|s| s["name"].as_str() == Some(req.name.as_str()));
                match existing {
                    Some(server) => {
                        let id = server["id"].as_str().unwrap_or_default().to_string();
                        if !tags_from_wire(&server["tags"]).contains_key(MANAGED_TAG) {
                            return Err(ProviderError::permanent(
                                "name_conflict",
                                format!("server '{}' ({}) is not managed by stratum", req.name, id),
                            ));
                        }
                        Ok(id)
                    }
                    None => self.create_instance(req).await,
                }
            }
            ResourceSpec::FloatingIp { name } => {
                if let Some(id) = self.first_by_name(ResourceKind::FloatingIp, name).await? {
                    return Ok(id);
                }
                let resp = self
                    .post(
                        &self.instance_url("ips"),
                        json!({
                            "project": self.config.project_id,
                            "type": "routed_ipv4",
                            "tags": [name, MANAGED_TAG],
                        }),
                    )
                    .await?;
                resp["ip"]["id"]
                    .as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| ProviderError::permanent("bad_response", "No ip id in response"))
            }
            ResourceSpec::FloatingIpAssociation {
                floating_ip_id,
                instance_id,
            } => {
                let url = self.instance_url(&format!("ips/{}", floating_ip_id));
                let current = self.get(&url).await?;
                if current["ip"]["server"]["id"].as_str() == Some(instance_id.as_str()) {
                    return Ok(floating_ip_id.clone());
                }
                tracing::info!(
                    "🔵 [Scaleway API] Attaching flexible IP {} to server {}",
                    floating_ip_id,
                    instance_id
                );
                self.patch(&url, json!({ "server": instance_id })).await?;
                Ok(floating_ip_id.clone())
            }
        }
    }

    async fn query(&self, kind: ResourceKind, filter: &ResourceFilter) -> ProviderResult<Vec<String>> {
        let name_ok = |item: &Value| {
            filter
                .name
                .as_deref()
                .map_or(true, |n| item["name"].as_str() == Some(n))
        };
        match kind {
            ResourceKind::Vpc => {
                self.list_ids(&self.scoped(self.vpc_url("vpcs"), "project_id"), "vpcs", name_ok)
                    .await
            }
            ResourceKind::Subnet => {
                self.list_ids(
                    &self.scoped(self.vpc_url("private-networks"), "project_id"),
                    "private_networks",
                    |item| {
                        name_ok(item)
                            && filter
                                .parent_id
                                .as_deref()
                                .map_or(true, |p| item["vpc_id"].as_str() == Some(p))
                    },
                )
                .await
            }
            ResourceKind::SecurityGroup => {
                self.list_ids(
                    &self.scoped(self.instance_url("security_groups"), "project"),
                    "security_groups",
                    name_ok,
                )
                .await
            }
            ResourceKind::SshKey => {
                self.list_ids(&self.scoped(self.iam_url("ssh-keys"), "project_id"), "ssh_keys", name_ok)
                    .await
            }
            ResourceKind::Instance => {
                self.list_ids(&self.scoped(self.instance_url("servers"), "project"), "servers", name_ok)
                    .await
            }
            ResourceKind::FloatingIp => {
                self.list_ids(&self.scoped(self.instance_url("ips"), "project"), "ips", |item| {
                    filter.name.as_deref().map_or(true, |n| {
                        item["tags"]
                            .as_array()
                            .map_or(false, |tags| tags.iter().any(|t| t.as_str() == Some(n)))
                    })
                })
                .await
            }
            ResourceKind::FloatingIpAssociation => {
                self.list_ids(&self.scoped(self.instance_url("ips"), "project"), "ips", |item| {
                    let server = item["server"]["id"].as_str();
                    server.is_some()
                        && filter
                            .instance_id
                            .as_deref()
                            .map_or(true, |want| server == Some(want))
                })
                .await
            }
        }
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<bool> {
        tracing::info!("🔵 [Scaleway API] Deleting {} {}", kind, id);
        match kind {
            ResourceKind::Vpc => self.delete_url(&self.vpc_url(&format!("vpcs/{}", id))).await,
            ResourceKind::Subnet => {
                self.delete_url(&self.vpc_url(&format!("private-networks/{}", id)))
                    .await
            }
            ResourceKind::SecurityGroup => {
                self.delete_url(&self.instance_url(&format!("security_groups/{}", id)))
                    .await
            }
            ResourceKind::SshKey => self.delete_url(&self.iam_url(&format!("ssh-keys/{}", id))).await,
            ResourceKind::FloatingIp => self.delete_url(&self.instance_url(&format!("ips/{}", id))).await,
            ResourceKind::FloatingIpAssociation => {
                let url = self.instance_url(&format!("ips/{}", id));
                let current = match self.get(&url).await {
                    Ok(v) => v,
                    Err(e) if e.is_not_found() => return Ok(false),
                    Err(e) => return Err(e),
                };
                if current["ip"]["server"].is_null() {
                    return Ok(false);
                }
                self.patch(&url, json!({ "server": Value::Null })).await?;
                Ok(true)
            }
            ResourceKind::Instance => {
                // "terminate" powers the server off and deletes it together with its volumes.
                let url = self.instance_url(&format!("servers/{}/action", id));
                match self.post(&url, json!({ "action": "terminate" })).await {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn describe_instance(&self, id: &str) -> ProviderResult<Option<inventory::DiscoveredInstance>> {
        match self.get(&self.instance_url(&format!("servers/{}", id))).await {
            Ok(resp) => Ok(Self::parse_server(&resp["server"])),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_instances(&self) -> ProviderResult<Vec<inventory::DiscoveredInstance>> {
        let url = self.scoped(
            self.instance_url(&format!("servers?tags={}=true", MANAGED_TAG)),
            "project",
        );
        Ok(self
            .list_all(&url, "servers")
            .await?
            .iter()
            .filter_map(Self::parse_server)
            .filter(|d| d.is_managed())
            .collect())
    }

    async fn set_tags(&self, instance_id: &str, tags: &BTreeMap<String, String>) -> ProviderResult<bool> {
        self.patch(
            &self.instance_url(&format!("servers/{}", instance_id)),
            json!({ "tags": tags_to_wire(tags) }),
        )
        .await?;
        Ok(true)
    }
}
