//! Vast.ai REST client
//!
//! Implements [`OfferQueryService`], [`InstanceProvider`] and [`AccountService`]
//! against `/api/v0`. Idempotent calls go through the configured
//! [`RetryPolicy`]; instance creation is attempted exactly once.

use crate::credentials::ApiCredentials;
use crate::error::{Result, VastError};
use crate::provider::{
    AccountService, AccountUser, CreateInstanceRequest, CreateResponse, InstanceProvider, Offer,
    OfferQuery, OfferQueryService, RemoteInstance,
};
use crate::query::build_search;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, info};

/// Run type requesting direct SSH with proxy fallback
const SSH_RUNTYPE: &str = "ssh_direc ssh_proxy";

#[derive(Debug, Deserialize)]
struct OffersEnvelope {
    #[serde(default)]
    offers: Vec<Offer>,
}

#[derive(Debug, Deserialize)]
struct InstancesEnvelope {
    #[serde(default)]
    instances: Vec<RemoteInstance>,
}

/// HTTP client for the Vast.ai API
pub struct VastClient {
    http: Client,
    credentials: ApiCredentials,
    retry: RetryPolicy,
}

impl VastClient {
    /// Create a client with the default retry policy
    pub fn new(credentials: ApiCredentials) -> Result<Self> {
        // reqwest has no overall timeout by default; a stalled API would hang the poll loop.
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VastError::transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            credentials,
            retry: RetryPolicy::default(),
        })
    }

    /// Override the retry policy for idempotent calls
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.credentials.endpoint(path))
            .bearer_auth(self.credentials.api_key())
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(VastError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.send(builder).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Convert `-e K=V -p 8888:8888` into the API's env map
pub fn env_map(env: &str) -> Map<String, Value> {
    let mut map = Map::new();
    let mut tokens = env.split_whitespace();

    while let Some(flag) = tokens.next() {
        match flag {
            "-e" => {
                if let Some((key, value)) = tokens.next().and_then(|kv| kv.split_once('=')) {
                    map.insert(key.to_string(), json!(value));
                }
            }
            "-p" => {
                if let Some(mapping) = tokens.next() {
                    map.insert(format!("-p {}", mapping), json!("1"));
                }
            }
            _ => debug!("ignoring env token {:?}", flag),
        }
    }

    map
}

#[async_trait]
impl OfferQueryService for VastClient {
    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>> {
        let search = build_search(
            &query.query,
            query.pricing,
            &query.order,
            query.storage_gb,
            query.no_default,
        )?;
        let q = serde_json::to_string(&search)?;
        debug!(query = %q, "Searching offers");

        let envelope: OffersEnvelope = self
            .retry
            .run("search offers", || {
                self.send_json(self.request(Method::GET, "/bundles/").query(&[("q", &q)]))
            })
            .await?;

        debug!("Found {} offers", envelope.offers.len());
        Ok(envelope.offers)
    }
}

#[async_trait]
impl InstanceProvider for VastClient {
    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<CreateResponse> {
        info!(
            offer_id = request.offer_id,
            image = %request.image,
            price = ?request.price,
            disk_gb = request.disk_gb,
            "Creating instance"
        );

        let body = json!({
            "client_id": "me",
            "image": request.image,
            "env": env_map(&request.env),
            "price": request.price,
            "disk": request.disk_gb,
            "label": request.label,
            "extra": null,
            "onstart": null,
            "runtype": SSH_RUNTYPE,
            "image_login": request.login,
            "python_utf8": false,
            "lang_utf8": false,
            "use_jupyter_lab": false,
            "jupyter_dir": null,
            "create_from": null,
            "force": false
        });
        let path = format!("/asks/{}/", request.offer_id);

        RetryPolicy::once()
            .run("create instance", || {
                self.send_json(self.request(Method::PUT, &path).json(&body))
            })
            .await
    }

    async fn show_instances(&self) -> Result<Vec<RemoteInstance>> {
        let envelope: InstancesEnvelope = self
            .retry
            .run("show instances", || {
                self.send_json(
                    self.request(Method::GET, "/instances/")
                        .query(&[("owner", "me")]),
                )
            })
            .await?;
        Ok(envelope.instances)
    }

    async fn stop_instance(&self, instance_id: u64) -> Result<()> {
        let path = format!("/instances/{}/", instance_id);
        self.retry
            .run("stop instance", || {
                self.send(
                    self.request(Method::PUT, &path)
                        .json(&json!({"state": "stopped"})),
                )
            })
            .await?;
        Ok(())
    }

    async fn destroy_instance(&self, instance_id: u64) -> Result<()> {
        let path = format!("/instances/{}/", instance_id);
        self.retry
            .run("destroy instance", || {
                self.send(self.request(Method::DELETE, &path))
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AccountService for VastClient {
    async fn show_user(&self) -> Result<AccountUser> {
        self.retry
            .run("show user", || {
                self.send_json(self.request(Method::GET, "/users/current/"))
            })
            .await
    }

    async fn update_ssh_key(&self, user_id: u64, public_key: &str) -> Result<()> {
        let path = format!("/users/{}/", user_id);
        let body = json!({ "ssh_key": public_key });
        self.retry
            .run("update ssh key", || {
                self.send(self.request(Method::PUT, &path).json(&body))
            })
            .await?;
        Ok(())
    }
}
