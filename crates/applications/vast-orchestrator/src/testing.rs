//! In-memory provider used by unit tests

use crate::error::{Result, VastError};
use crate::operator::ProgressSink;
use crate::provider::{
    AccountService, AccountUser, CreateInstanceRequest, CreateResponse, InstanceProvider, Offer,
    OfferQuery, OfferQueryService, PortBinding, PortMap, RemoteInstance,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Scripted provider recording every call
pub struct FakeProvider {
    pub offers: Mutex<Vec<Offer>>,
    pub queries: Mutex<Vec<OfferQuery>>,
    pub create_response: Mutex<CreateResponse>,
    pub created: Mutex<Vec<CreateInstanceRequest>>,
    /// Each `show_instances` call pops one listing; the last one repeats
    pub listings: Mutex<VecDeque<Vec<RemoteInstance>>>,
    pub show_calls: AtomicU32,
    pub fail_show: Mutex<bool>,
    pub stopped: Mutex<Vec<u64>>,
    pub destroyed: Mutex<Vec<u64>>,
    pub user: Mutex<AccountUser>,
    pub key_updates: Mutex<Vec<(u64, String)>>,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            offers: Mutex::new(vec![]),
            queries: Mutex::new(vec![]),
            create_response: Mutex::new(CreateResponse {
                success: true,
                new_contract: Some(100),
                error: None,
            }),
            created: Mutex::new(vec![]),
            listings: Mutex::new(VecDeque::new()),
            show_calls: AtomicU32::new(0),
            fail_show: Mutex::new(false),
            stopped: Mutex::new(vec![]),
            destroyed: Mutex::new(vec![]),
            user: Mutex::new(AccountUser {
                id: 1,
                ssh_key: None,
            }),
            key_updates: Mutex::new(vec![]),
        }
    }
}

impl FakeProvider {
    pub fn with_offers(offers: Vec<Offer>) -> Self {
        let fake = Self::default();
        *fake.offers.lock().unwrap() = offers;
        fake
    }

    pub fn push_listing(&self, listing: Vec<RemoteInstance>) {
        self.listings.lock().unwrap().push_back(listing);
    }

    pub fn reject_creation(&self, error: &str) {
        *self.create_response.lock().unwrap() = CreateResponse {
            success: false,
            new_contract: None,
            error: Some(error.to_string()),
        };
    }

    /// Accept creation without returning the new contract id
    pub fn accept_without_contract(&self) {
        *self.create_response.lock().unwrap() = CreateResponse {
            success: true,
            new_contract: None,
            error: None,
        };
    }

    pub fn set_remote_key(&self, key: Option<&str>) {
        self.user.lock().unwrap().ssh_key = key.map(str::to_string);
    }

    pub fn show_calls(&self) -> u32 {
        self.show_calls.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> Vec<u64> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> Vec<u64> {
        self.destroyed.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<CreateInstanceRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn key_updates(&self) -> Vec<(u64, String)> {
        self.key_updates.lock().unwrap().clone()
    }
}

/// Keeps progress lines in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    /// Whether any line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl ProgressSink for MemorySink {
    fn line(&self, message: &str) {
        self.lines.lock().unwrap().push(message.to_string());
    }
}

pub fn offer(id: u64, price: f64) -> Offer {
    Offer {
        id,
        price,
        disk_space: 100.0,
        direct_port_count: 10,
        rentable: true,
        gpu_name: Some("RTX 3090".into()),
        num_gpus: Some(1),
        reliability: Some(0.99),
        min_bid: None,
    }
}

pub fn instance(id: u64, label: &str, actual_status: &str, status_msg: &str) -> RemoteInstance {
    RemoteInstance {
        id,
        label: Some(label.to_string()),
        actual_status: Some(actual_status.to_string()),
        status_msg: Some(status_msg.to_string()),
        ..Default::default()
    }
}

pub fn ready_instance(id: u64, label: &str) -> RemoteInstance {
    let mut ports = PortMap::new();
    ports.insert(
        "22/tcp".into(),
        vec![PortBinding {
            host_ip: Some("0.0.0.0".into()),
            host_port: "40022".into(),
        }],
    );
    ports.insert(
        "8888/tcp".into(),
        vec![PortBinding {
            host_ip: Some("0.0.0.0".into()),
            host_port: "40888".into(),
        }],
    );
    RemoteInstance {
        ports,
        public_ipaddr: Some("203.0.113.7".into()),
        dph_total: Some(0.35),
        ..instance(id, label, "running", "success, running pytorch/pytorch")
    }
}

#[async_trait]
impl OfferQueryService for FakeProvider {
    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>> {
        self.queries.lock().unwrap().push(query.clone());
        Ok(self.offers.lock().unwrap().clone())
    }
}

#[async_trait]
impl InstanceProvider for FakeProvider {
    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<CreateResponse> {
        self.created.lock().unwrap().push(request.clone());
        Ok(self.create_response.lock().unwrap().clone())
    }

    async fn show_instances(&self) -> Result<Vec<RemoteInstance>> {
        self.show_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_show.lock().unwrap() {
            return Err(VastError::transport("connection refused"));
        }
        let mut listings = self.listings.lock().unwrap();
        if listings.len() > 1 {
            Ok(listings.pop_front().unwrap_or_default())
        } else {
            Ok(listings.front().cloned().unwrap_or_default())
        }
    }

    async fn stop_instance(&self, instance_id: u64) -> Result<()> {
        self.stopped.lock().unwrap().push(instance_id);
        Ok(())
    }

    async fn destroy_instance(&self, instance_id: u64) -> Result<()> {
        self.destroyed.lock().unwrap().push(instance_id);
        Ok(())
    }
}

#[async_trait]
impl AccountService for FakeProvider {
    async fn show_user(&self) -> Result<AccountUser> {
        Ok(self.user.lock().unwrap().clone())
    }

    async fn update_ssh_key(&self, user_id: u64, public_key: &str) -> Result<()> {
        self.key_updates
            .lock()
            .unwrap()
            .push((user_id, public_key.to_string()));
        Ok(())
    }
}
