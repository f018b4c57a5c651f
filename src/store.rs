//! Read contract against the backing document store
//!
//! Watchers never write; they re-read documents in response to change
//! notifications. The [`Store`] trait captures exactly the lookups the
//! watcher layer performs. `Ok(None)` means not-found, which watchers treat
//! according to their own contract (fatal for single-document watchers, a
//! removal signal for the rest).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::StoreError;
use crate::life::Life;

/// Settings key of the environment configuration document
pub const ENVIRON_SETTINGS_KEY: &str = "e";

/// Settings key of a service's configuration document
pub fn service_settings_key(service: &str) -> String {
    format!("s#{service}")
}

/// A document carrying a monotonic revision number
pub trait Revisioned {
    fn revno(&self) -> i64;
}

/// A machine document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineDoc {
    pub id: i64,
    pub life: Life,
    /// Names of the principal units assigned to this machine
    #[serde(default)]
    pub principals: Vec<String>,
    pub revno: i64,
}

/// A service document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDoc {
    pub name: String,
    pub life: Life,
    pub revno: i64,
}

/// A unit document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDoc {
    pub name: String,
    pub service: String,
    pub life: Life,
    /// Name of the principal unit, for subordinate units
    #[serde(default)]
    pub principal: Option<String>,
    /// Machine the unit is assigned to, for principal units
    #[serde(default)]
    pub machine_id: Option<i64>,
    #[serde(default)]
    pub subordinates: Vec<String>,
    #[serde(default)]
    pub public_address: Option<String>,
    pub revno: i64,
}

/// One endpoint of a relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub service: String,
    pub relation: String,
}

/// A relation document
///
/// The key encodes the endpoints (`"svc1:rel1 svc2:rel2"`); the id is the
/// value reported by relation watchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDoc {
    pub key: String,
    pub id: i64,
    pub life: Life,
    pub endpoints: Vec<Endpoint>,
    pub revno: i64,
}

/// A settings document: a keyed map with a monotonic version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub version: i64,
    pub map: Map<String, Value>,
}

impl Revisioned for MachineDoc {
    fn revno(&self) -> i64 {
        self.revno
    }
}

impl Revisioned for ServiceDoc {
    fn revno(&self) -> i64 {
        self.revno
    }
}

impl Revisioned for UnitDoc {
    fn revno(&self) -> i64 {
        self.revno
    }
}

impl Revisioned for RelationDoc {
    fn revno(&self) -> i64 {
        self.revno
    }
}

/// The document lookups the watcher layer performs
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn machine(&self, id: i64) -> Result<Option<MachineDoc>, StoreError>;

    async fn machines(&self) -> Result<Vec<MachineDoc>, StoreError>;

    async fn service(&self, name: &str) -> Result<Option<ServiceDoc>, StoreError>;

    async fn services(&self) -> Result<Vec<ServiceDoc>, StoreError>;

    async fn unit(&self, name: &str) -> Result<Option<UnitDoc>, StoreError>;

    /// All units belonging to the named service
    async fn service_units(&self, service: &str) -> Result<Vec<UnitDoc>, StoreError>;

    async fn relation(&self, key: &str) -> Result<Option<RelationDoc>, StoreError>;

    /// All relations with an endpoint on the named service
    async fn service_relations(&self, service: &str) -> Result<Vec<RelationDoc>, StoreError>;

    /// Keys of all scope membership documents starting with `prefix`
    async fn scope_members(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn settings(&self, key: &str) -> Result<Option<Settings>, StoreError>;
}
