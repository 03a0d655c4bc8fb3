//! In-process store for single-node deployments and tests.
//!
//! Mirrors the relational layout: one item table with a permit column,
//! a permit table keyed by an allocation counter, a group table, and an
//! address-failure table. All mutation happens under one lock, which
//! stands in for the SQL store's transactions. Notifications produced
//! during a mutation are queued and sent only after the lock is released,
//! matching the commit-time delivery of the SQL stores.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{GroupId, GroupRecord, Permit, PermitRecord, QueueWork, WorkError};
use crate::notify::{Notification, Transport};

struct ItemRow {
    seq: u64,
    name: String,
    priority: u64,
    permit: u64,
    work_type: u64,
    address: Option<String>,
    group: Option<i64>,
    payload: Vec<u8>,
    carrier: Vec<u8>,
}

struct GroupRow {
    name: String,
    started: bool,
    cancelled: bool,
}

#[derive(Default)]
struct Tables {
    seq: u64,
    next_permit: u64,
    next_group: i64,
    items: Vec<ItemRow>,
    permits: HashMap<u64, DateTime<Utc>>,
    groups: HashMap<i64, GroupRow>,
    failures: HashMap<String, WorkError>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    transport: Box<dyn Transport>,
}

impl MemoryStore {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            transport: Box::new(transport),
        }
    }

    /// Run a mutation under the table lock, then deliver any queued
    /// notifications after the lock is released.
    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables, &mut Vec<Notification>) -> Result<T>) -> Result<T> {
        let mut pending = Vec::new();
        let out = {
            let mut tables = self.tables.lock().expect("memory store lock poisoned");
            f(&mut tables, &mut pending)
        };
        if out.is_ok() {
            for n in pending {
                self.transport.notify(n);
            }
        }
        out
    }
}

fn claimable(
    groups: &HashMap<i64, GroupRow>,
    row: &ItemRow,
    name: &str,
    max_priority: u64,
    types: &[u64],
) -> bool {
    if row.permit != 0 || row.name != name || row.priority > max_priority {
        return false;
    }
    if !types.contains(&row.work_type) {
        return false;
    }
    match row.group {
        None => true,
        Some(gid) => groups.get(&gid).is_some_and(|g| g.started),
    }
}

#[async_trait]
impl super::QueueStore for MemoryStore {
    async fn push(
        &self,
        name: &str,
        group: Option<GroupId>,
        priority: u64,
        work_type: u64,
        payload: &[u8],
        carrier: &[u8],
    ) -> Result<()> {
        self.with_tables(|t, pending| {
            t.seq += 1;
            t.items.push(ItemRow {
                seq: t.seq,
                name: name.to_string(),
                priority,
                permit: 0,
                work_type,
                address: None,
                group: group.map(|g| g.0),
                payload: payload.to_vec(),
                carrier: carrier.to_vec(),
            });
            pending.push(Notification::work_ready());
            Ok(())
        })
    }

    async fn push_addressed(
        &self,
        name: &str,
        group: Option<GroupId>,
        priority: u64,
        work_type: u64,
        address: &str,
        payload: &[u8],
        carrier: &[u8],
    ) -> Result<()> {
        if address.trim().is_empty() {
            return Err(Error::EmptyAddress);
        }
        self.with_tables(|t, pending| {
            // The SQL stores detect this through the unique index on the
            // address column.
            if t.items.iter().any(|r| r.address.as_deref() == Some(address)) {
                return Err(Error::DuplicateAddress);
            }
            t.seq += 1;
            t.items.push(ItemRow {
                seq: t.seq,
                name: name.to_string(),
                priority,
                permit: 0,
                work_type,
                address: Some(address.to_string()),
                group: group.map(|g| g.0),
                payload: payload.to_vec(),
                carrier: carrier.to_vec(),
            });
            pending.push(Notification::work_ready());
            Ok(())
        })
    }

    async fn pop(&self, name: &str, max_priority: u64, types: &[u64]) -> Result<Option<QueueWork>> {
        let types = if types.is_empty() {
            vec![crate::model::TYPE_NONE]
        } else {
            types.to_vec()
        };
        self.with_tables(|t, _| {
            let groups = &t.groups;
            let candidate = t
                .items
                .iter()
                .filter(|r| claimable(groups, r, name, max_priority, &types))
                .min_by_key(|r| (r.priority, r.seq))
                .map(|r| r.seq);

            let Some(seq) = candidate else {
                return Ok(None);
            };

            t.next_permit += 1;
            let permit = t.next_permit;
            t.permits.insert(permit, Utc::now());

            let row = t
                .items
                .iter_mut()
                .find(|r| r.seq == seq)
                .expect("claimed row vanished under the lock");
            row.permit = permit;

            Ok(Some(QueueWork {
                permit: Permit(permit),
                address: row.address.clone(),
                work_type: row.work_type,
                payload: row.payload.clone(),
                carrier: row.carrier.clone(),
            }))
        })
    }

    async fn delete(&self, permit: Permit) -> Result<()> {
        self.with_tables(|t, _| {
            t.items.retain(|r| r.permit != permit.0);
            t.permits.remove(&permit.0);
            Ok(())
        })
    }

    async fn permits(&self, name: &str) -> Result<Vec<PermitRecord>> {
        self.with_tables(|t, _| {
            Ok(t.items
                .iter()
                .filter(|r| r.name == name && r.permit != 0)
                .filter_map(|r| {
                    t.permits.get(&r.permit).map(|created| PermitRecord {
                        id: Permit(r.permit),
                        created_at: *created,
                    })
                })
                .collect())
        })
    }

    async fn permit_delete(&self, permit: Permit) -> Result<()> {
        self.with_tables(|t, pending| {
            t.permits.remove(&permit.0);
            for row in t.items.iter_mut().filter(|r| r.permit == permit.0) {
                row.permit = 0;
            }
            // The reopened work may be claimable again.
            pending.push(Notification::work_ready());
            Ok(())
        })
    }

    async fn peek(&self, types: &[u64]) -> Result<Vec<QueueWork>> {
        self.with_tables(|t, _| {
            Ok(t.items
                .iter()
                .filter(|r| types.contains(&r.work_type))
                .map(|r| QueueWork {
                    permit: Permit(r.permit),
                    address: r.address.clone(),
                    work_type: r.work_type,
                    payload: r.payload.clone(),
                    carrier: r.carrier.clone(),
                })
                .collect())
        })
    }

    async fn address_complete(&self, address: &str) -> Result<(bool, Option<WorkError>)> {
        if address.trim().is_empty() {
            return Err(Error::EmptyAddress);
        }
        self.with_tables(|t, _| {
            let live = t.items.iter().any(|r| r.address.as_deref() == Some(address));
            if live {
                return Ok((false, None));
            }
            Ok((true, t.failures.get(address).cloned()))
        })
    }

    async fn address_in_progress(&self, address: &str) -> Result<bool> {
        if address.trim().is_empty() {
            return Err(Error::EmptyAddress);
        }
        self.with_tables(|t, _| Ok(t.items.iter().any(|r| r.address.as_deref() == Some(address))))
    }

    async fn record_address_failure(
        &self,
        address: &str,
        failure: Option<WorkError>,
    ) -> Result<()> {
        self.with_tables(|t, _| {
            match failure {
                Some(we) => t.failures.insert(address.to_string(), we),
                None => t.failures.remove(address),
            };
            Ok(())
        })
    }

    async fn notify_extend(&self, permit: Permit) -> Result<()> {
        self.transport.notify(Notification::permit_extended(permit.0));
        Ok(())
    }
}

#[async_trait]
impl super::GroupStore for MemoryStore {
    async fn group_create(&self, name: &str) -> Result<GroupRecord> {
        self.with_tables(|t, _| {
            if t.groups.values().any(|g| g.name == name) {
                return Err(Error::Store(format!("group name already exists: {name}")));
            }
            t.next_group += 1;
            let id = t.next_group;
            t.groups.insert(
                id,
                GroupRow {
                    name: name.to_string(),
                    started: false,
                    cancelled: false,
                },
            );
            Ok(GroupRecord {
                id: GroupId(id),
                name: name.to_string(),
                started: false,
                cancelled: false,
            })
        })
    }

    async fn group_start(&self, id: GroupId) -> Result<()> {
        self.with_tables(|t, pending| {
            let group = t
                .groups
                .get_mut(&id.0)
                .ok_or_else(|| Error::NotFound(format!("group {id}")))?;
            group.started = true;
            // Members become claimable.
            pending.push(Notification::work_ready());
            Ok(())
        })
    }

    async fn group_complete(&self, id: GroupId) -> Result<(bool, bool)> {
        self.with_tables(|t, _| {
            let remaining = t.items.iter().filter(|r| r.group == Some(id.0)).count();
            if remaining > 0 {
                return Ok((false, false));
            }
            let group = t
                .groups
                .remove(&id.0)
                .ok_or_else(|| Error::NotFound(format!("group {id}")))?;
            Ok((true, group.cancelled))
        })
    }

    async fn group_cancel(&self, id: GroupId) -> Result<()> {
        self.with_tables(|t, _| {
            let group = t
                .groups
                .get_mut(&id.0)
                .ok_or_else(|| Error::NotFound(format!("group {id}")))?;
            group.cancelled = true;
            Ok(())
        })
    }

    async fn group_clear(&self, id: GroupId) -> Result<()> {
        self.with_tables(|t, _| {
            t.items.retain(|r| r.group != Some(id.0));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LocalTransport;
    use crate::store::{GroupStore, QueueStore};

    const TYPE_TEST: u64 = 1;
    const TYPE_OTHER: u64 = 2;

    fn store() -> MemoryStore {
        MemoryStore::new(LocalTransport::new())
    }

    #[tokio::test]
    async fn pop_honors_priority_then_insertion_order() {
        let s = store();
        s.push("test", None, 2, TYPE_TEST, b"low", b"").await.unwrap();
        s.push("test", None, 1, TYPE_TEST, b"hi-1", b"").await.unwrap();
        s.push("test", None, 1, TYPE_TEST, b"hi-2", b"").await.unwrap();

        let w = s.pop("test", 10, &[TYPE_TEST]).await.unwrap().unwrap();
        assert_eq!(w.payload, b"hi-1");
        let w = s.pop("test", 10, &[TYPE_TEST]).await.unwrap().unwrap();
        assert_eq!(w.payload, b"hi-2");
        let w = s.pop("test", 10, &[TYPE_TEST]).await.unwrap().unwrap();
        assert_eq!(w.payload, b"low");
        assert!(s.pop("test", 10, &[TYPE_TEST]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_respects_ceiling_and_types() {
        let s = store();
        s.push("test", None, 5, TYPE_TEST, b"deep", b"").await.unwrap();
        s.push("test", None, 0, TYPE_OTHER, b"other", b"").await.unwrap();

        // Priority 5 exceeds the ceiling; TYPE_OTHER not in the set.
        assert!(s.pop("test", 3, &[TYPE_TEST]).await.unwrap().is_none());

        let w = s.pop("test", 5, &[TYPE_TEST]).await.unwrap().unwrap();
        assert_eq!(w.payload, b"deep");
    }

    #[tokio::test]
    async fn duplicate_address_rejected_until_deleted() {
        let s = store();
        s.push_addressed("test", None, 0, TYPE_TEST, "abc", b"one", b"")
            .await
            .unwrap();
        let err = s
            .push_addressed("test", None, 0, TYPE_TEST, "abc", b"two", b"")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateAddress));

        let w = s.pop("test", 0, &[TYPE_TEST]).await.unwrap().unwrap();
        s.delete(w.permit).await.unwrap();

        // Address is free again.
        s.push_addressed("test", None, 0, TYPE_TEST, "abc", b"three", b"")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claimed_work_is_not_claimable_again() {
        let s = store();
        s.push("test", None, 0, TYPE_TEST, b"solo", b"").await.unwrap();
        let first = s.pop("test", 0, &[TYPE_TEST]).await.unwrap();
        assert!(first.is_some());
        assert!(s.pop("test", 0, &[TYPE_TEST]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let s = store();
        s.push("test", None, 0, TYPE_TEST, b"x", b"").await.unwrap();
        let w = s.pop("test", 0, &[TYPE_TEST]).await.unwrap().unwrap();
        s.delete(w.permit).await.unwrap();
        s.delete(w.permit).await.unwrap();
    }

    #[tokio::test]
    async fn grouped_work_gated_until_start() {
        let s = store();
        let g = s.group_create("sync-1").await.unwrap();
        s.push("test", Some(g.id), 0, TYPE_TEST, b"member", b"")
            .await
            .unwrap();

        assert!(s.pop("test", 0, &[TYPE_TEST]).await.unwrap().is_none());

        s.group_start(g.id).await.unwrap();
        let w = s.pop("test", 0, &[TYPE_TEST]).await.unwrap().unwrap();
        assert_eq!(w.payload, b"member");
    }

    #[tokio::test]
    async fn group_complete_reports_cancellation() {
        let s = store();
        let g = s.group_create("sync-2").await.unwrap();
        s.push("test", Some(g.id), 0, TYPE_TEST, b"a", b"").await.unwrap();
        s.push("test", Some(g.id), 0, TYPE_TEST, b"b", b"").await.unwrap();

        let (done, _) = s.group_complete(g.id).await.unwrap();
        assert!(!done);

        s.group_cancel(g.id).await.unwrap();
        s.group_clear(g.id).await.unwrap();

        let (done, cancelled) = s.group_complete(g.id).await.unwrap();
        assert!(done);
        assert!(cancelled);
    }

    #[tokio::test]
    async fn address_failure_recorded_and_cleared() {
        let s = store();
        s.record_address_failure("abc", Some(WorkError::new(404, "missing")))
            .await
            .unwrap();
        let (done, failure) = s.address_complete("abc").await.unwrap();
        assert!(done);
        assert_eq!(failure.unwrap().code, 404);

        s.record_address_failure("abc", None).await.unwrap();
        let (done, failure) = s.address_complete("abc").await.unwrap();
        assert!(done);
        assert!(failure.is_none());
    }

    #[tokio::test]
    async fn permit_delete_reopens_work() {
        let s = store();
        s.push("test", None, 0, TYPE_TEST, b"orphan", b"").await.unwrap();
        let w = s.pop("test", 0, &[TYPE_TEST]).await.unwrap().unwrap();

        s.permit_delete(w.permit).await.unwrap();

        let again = s.pop("test", 0, &[TYPE_TEST]).await.unwrap().unwrap();
        assert_eq!(again.payload, b"orphan");
        assert_ne!(again.permit, w.permit);
    }

    #[tokio::test]
    async fn empty_address_is_rejected() {
        let s = store();
        assert!(matches!(
            s.address_complete("   ").await.unwrap_err(),
            Error::EmptyAddress
        ));
        assert!(matches!(
            s.push_addressed("test", None, 0, TYPE_TEST, "", b"", b"")
                .await
                .unwrap_err(),
            Error::EmptyAddress
        ));
    }
}
