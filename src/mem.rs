//! In-memory store backend
//!
//! [`MemStore`] implements [`Store`] over plain maps and pairs every
//! mutation with the matching change notification on an attached
//! [`ChangeHub`], the way the real store's transaction log would. It exists
//! so the watcher layer can be exercised without a database and is the
//! backend used throughout this crate's tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::errors::StoreError;
use crate::life::Life;
use crate::source::{ChangeHub, Collection, DocId, REMOVED};
use crate::store::{
    Endpoint, MachineDoc, RelationDoc, ServiceDoc, Settings, Store, UnitDoc,
};

#[derive(Default)]
struct Inner {
    machines: HashMap<i64, MachineDoc>,
    services: HashMap<String, ServiceDoc>,
    units: HashMap<String, UnitDoc>,
    relations: HashMap<String, RelationDoc>,
    /// Scope membership documents, key → revno
    scopes: HashMap<String, i64>,
    settings: HashMap<String, Settings>,
}

/// An in-memory [`Store`] wired to a [`ChangeHub`]
pub struct MemStore {
    hub: ChangeHub,
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new(hub: ChangeHub) -> Self {
        MemStore {
            hub,
            inner: Mutex::new(Inner::default()),
        }
    }

    // -- machines

    pub async fn add_machine(&self, id: i64) {
        let revno = {
            let mut inner = self.inner.lock().unwrap();
            inner.machines.insert(
                id,
                MachineDoc {
                    id,
                    life: Life::Alive,
                    principals: Vec::new(),
                    revno: 1,
                },
            );
            1
        };
        self.hub.publish(Collection::Machines, id, revno).await;
    }

    pub async fn set_machine_life(&self, id: i64, life: Life) {
        let revno = {
            let mut inner = self.inner.lock().unwrap();
            let doc = inner.machines.get_mut(&id).expect("machine exists");
            doc.life = life;
            doc.revno += 1;
            doc.revno
        };
        self.hub.publish(Collection::Machines, id, revno).await;
    }

    /// Bump a machine's revision without changing its content
    pub async fn touch_machine(&self, id: i64) {
        let revno = {
            let mut inner = self.inner.lock().unwrap();
            let doc = inner.machines.get_mut(&id).expect("machine exists");
            doc.revno += 1;
            doc.revno
        };
        self.hub.publish(Collection::Machines, id, revno).await;
    }

    pub async fn remove_machine(&self, id: i64) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.machines.remove(&id);
        }
        self.hub.publish(Collection::Machines, id, REMOVED).await;
    }

    // -- services

    pub async fn add_service(&self, name: &str) {
        let revno = {
            let mut inner = self.inner.lock().unwrap();
            inner.services.insert(
                name.to_string(),
                ServiceDoc {
                    name: name.to_string(),
                    life: Life::Alive,
                    revno: 1,
                },
            );
            1
        };
        self.hub.publish(Collection::Services, name, revno).await;
    }

    pub async fn set_service_life(&self, name: &str, life: Life) {
        let revno = {
            let mut inner = self.inner.lock().unwrap();
            let doc = inner.services.get_mut(name).expect("service exists");
            doc.life = life;
            doc.revno += 1;
            doc.revno
        };
        self.hub.publish(Collection::Services, name, revno).await;
    }

    pub async fn remove_service(&self, name: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.services.remove(name);
        }
        self.hub.publish(Collection::Services, name, REMOVED).await;
    }

    // -- units

    /// Add a principal unit, optionally assigned to a machine
    pub async fn add_unit(&self, service: &str, name: &str, machine: Option<i64>) {
        let mut publishes = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.units.insert(
                name.to_string(),
                UnitDoc {
                    name: name.to_string(),
                    service: service.to_string(),
                    life: Life::Alive,
                    principal: None,
                    machine_id: machine,
                    subordinates: Vec::new(),
                    public_address: None,
                    revno: 1,
                },
            );
            publishes.push((Collection::Units, DocId::from(name), 1));
            if let Some(machine) = machine {
                let doc = inner.machines.get_mut(&machine).expect("machine exists");
                doc.principals.push(name.to_string());
                doc.revno += 1;
                publishes.push((Collection::Machines, DocId::from(machine), doc.revno));
            }
        }
        self.flush(publishes).await;
    }

    /// Add a subordinate unit attached to a principal
    pub async fn add_subordinate(&self, service: &str, name: &str, principal: &str) {
        let mut publishes = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.units.insert(
                name.to_string(),
                UnitDoc {
                    name: name.to_string(),
                    service: service.to_string(),
                    life: Life::Alive,
                    principal: Some(principal.to_string()),
                    machine_id: None,
                    subordinates: Vec::new(),
                    public_address: None,
                    revno: 1,
                },
            );
            publishes.push((Collection::Units, DocId::from(name), 1));
            let doc = inner.units.get_mut(principal).expect("principal exists");
            doc.subordinates.push(name.to_string());
            doc.revno += 1;
            publishes.push((Collection::Units, DocId::from(principal), doc.revno));
        }
        self.flush(publishes).await;
    }

    pub async fn set_unit_life(&self, name: &str, life: Life) {
        let revno = {
            let mut inner = self.inner.lock().unwrap();
            let doc = inner.units.get_mut(name).expect("unit exists");
            doc.life = life;
            doc.revno += 1;
            doc.revno
        };
        self.hub.publish(Collection::Units, name, revno).await;
    }

    pub async fn set_unit_address(&self, name: &str, address: &str) {
        let revno = {
            let mut inner = self.inner.lock().unwrap();
            let doc = inner.units.get_mut(name).expect("unit exists");
            doc.public_address = Some(address.to_string());
            doc.revno += 1;
            doc.revno
        };
        self.hub.publish(Collection::Units, name, revno).await;
    }

    pub async fn assign_unit(&self, name: &str, machine: i64) {
        let mut publishes = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let doc = inner.units.get_mut(name).expect("unit exists");
            doc.machine_id = Some(machine);
            doc.revno += 1;
            publishes.push((Collection::Units, DocId::from(name), doc.revno));
            let m = inner.machines.get_mut(&machine).expect("machine exists");
            m.principals.push(name.to_string());
            m.revno += 1;
            publishes.push((Collection::Machines, DocId::from(machine), m.revno));
        }
        self.flush(publishes).await;
    }

    pub async fn unassign_unit(&self, name: &str) {
        let mut publishes = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let doc = inner.units.get_mut(name).expect("unit exists");
            let machine = doc.machine_id.take();
            doc.revno += 1;
            publishes.push((Collection::Units, DocId::from(name), doc.revno));
            if let Some(machine) = machine {
                let m = inner.machines.get_mut(&machine).expect("machine exists");
                m.principals.retain(|p| p != name);
                m.revno += 1;
                publishes.push((Collection::Machines, DocId::from(machine), m.revno));
            }
        }
        self.flush(publishes).await;
    }

    pub async fn remove_unit(&self, name: &str) {
        let mut publishes = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(doc) = inner.units.remove(name) else {
                return;
            };
            publishes.push((Collection::Units, DocId::from(name), REMOVED));
            if let Some(machine) = doc.machine_id {
                if let Some(m) = inner.machines.get_mut(&machine) {
                    m.principals.retain(|p| p != name);
                    m.revno += 1;
                    publishes.push((Collection::Machines, DocId::from(machine), m.revno));
                }
            }
            if let Some(principal) = &doc.principal {
                if let Some(p) = inner.units.get_mut(principal) {
                    p.subordinates.retain(|s| s != name);
                    p.revno += 1;
                    publishes.push((Collection::Units, DocId::from(principal.clone()), p.revno));
                }
            }
        }
        self.flush(publishes).await;
    }

    // -- relations

    /// Add a relation over the given (service, relation-name) endpoints;
    /// returns the generated key
    pub async fn add_relation(&self, id: i64, endpoints: &[(&str, &str)]) -> String {
        let key = endpoints
            .iter()
            .map(|(s, r)| format!("{s}:{r}"))
            .collect::<Vec<_>>()
            .join(" ");
        {
            let mut inner = self.inner.lock().unwrap();
            inner.relations.insert(
                key.clone(),
                RelationDoc {
                    key: key.clone(),
                    id,
                    life: Life::Alive,
                    endpoints: endpoints
                        .iter()
                        .map(|(s, r)| Endpoint {
                            service: s.to_string(),
                            relation: r.to_string(),
                        })
                        .collect(),
                    revno: 1,
                },
            );
        }
        self.hub.publish(Collection::Relations, key.as_str(), 1).await;
        key
    }

    pub async fn set_relation_life(&self, key: &str, life: Life) {
        let revno = {
            let mut inner = self.inner.lock().unwrap();
            let doc = inner.relations.get_mut(key).expect("relation exists");
            doc.life = life;
            doc.revno += 1;
            doc.revno
        };
        self.hub.publish(Collection::Relations, key, revno).await;
    }

    pub async fn remove_relation(&self, key: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.relations.remove(key);
        }
        self.hub.publish(Collection::Relations, key, REMOVED).await;
    }

    // -- relation scopes

    pub async fn enter_scope(&self, key: &str) {
        let revno = {
            let mut inner = self.inner.lock().unwrap();
            let revno = inner.scopes.get(key).copied().unwrap_or(0) + 1;
            inner.scopes.insert(key.to_string(), revno);
            revno
        };
        self.hub
            .publish(Collection::RelationScopes, key, revno)
            .await;
    }

    pub async fn leave_scope(&self, key: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.scopes.remove(key);
        }
        self.hub
            .publish(Collection::RelationScopes, key, REMOVED)
            .await;
    }

    // -- settings

    /// Create or replace a settings document, bumping its version
    pub async fn put_settings(&self, key: &str, map: Map<String, Value>) {
        let version = {
            let mut inner = self.inner.lock().unwrap();
            let version = inner.settings.get(key).map(|s| s.version).unwrap_or(0) + 1;
            inner.settings.insert(key.to_string(), Settings { version, map });
            version
        };
        self.hub.publish(Collection::Settings, key, version).await;
    }

    pub async fn remove_settings(&self, key: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.settings.remove(key);
        }
        self.hub.publish(Collection::Settings, key, REMOVED).await;
    }

    async fn flush(&self, publishes: Vec<(Collection, DocId, i64)>) {
        for (collection, id, revno) in publishes {
            self.hub.publish(collection, id, revno).await;
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn machine(&self, id: i64) -> Result<Option<MachineDoc>, StoreError> {
        Ok(self.inner.lock().unwrap().machines.get(&id).cloned())
    }

    async fn machines(&self) -> Result<Vec<MachineDoc>, StoreError> {
        Ok(self.inner.lock().unwrap().machines.values().cloned().collect())
    }

    async fn service(&self, name: &str) -> Result<Option<ServiceDoc>, StoreError> {
        Ok(self.inner.lock().unwrap().services.get(name).cloned())
    }

    async fn services(&self) -> Result<Vec<ServiceDoc>, StoreError> {
        Ok(self.inner.lock().unwrap().services.values().cloned().collect())
    }

    async fn unit(&self, name: &str) -> Result<Option<UnitDoc>, StoreError> {
        Ok(self.inner.lock().unwrap().units.get(name).cloned())
    }

    async fn service_units(&self, service: &str) -> Result<Vec<UnitDoc>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .units
            .values()
            .filter(|u| u.service == service)
            .cloned()
            .collect())
    }

    async fn relation(&self, key: &str) -> Result<Option<RelationDoc>, StoreError> {
        Ok(self.inner.lock().unwrap().relations.get(key).cloned())
    }

    async fn service_relations(&self, service: &str) -> Result<Vec<RelationDoc>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .relations
            .values()
            .filter(|r| r.endpoints.iter().any(|e| e.service == service))
            .cloned()
            .collect())
    }

    async fn scope_members(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .scopes
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn settings(&self, key: &str) -> Result<Option<Settings>, StoreError> {
        Ok(self.inner.lock().unwrap().settings.get(key).cloned())
    }
}
