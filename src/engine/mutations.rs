use std::collections::HashMap;
use std::sync::atomic::Ordering;

use tokio::sync::oneshot;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_allocation, live_allocations_for_resource, validate_allocation, validate_span, Proposal};
use super::store::Store;
use super::{Engine, EngineError, WalCommand};

/// How an allocation edit treats the allocation's span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanUpdate {
    Keep,
    /// Mirror the event's span again.
    FollowEvent,
    Custom(Span),
}

/// One row of a batch allocation: (id, event_id, resource_id, custom span).
pub type AllocationRequest = (Ulid, Ulid, Ulid, Option<Span>);

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_opt_len(value: &Option<String>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) => check_len(v, max, what),
        None => Ok(()),
    }
}

fn record_rejection(err: &EngineError) {
    metrics::counter!(crate::observability::ALLOCATIONS_REJECTED_TOTAL, "reason" => err.kind()).increment(1);
}

/// Insert `alloc` into `placed` keeping ascending id order.
fn insert_sorted(placed: &mut Vec<Allocation>, alloc: Allocation) {
    let pos = placed.binary_search_by_key(&alloc.id, |a| a.id).unwrap_or_else(|e| e);
    placed.insert(pos, alloc);
}

impl Engine {
    // ── Events ───────────────────────────────────────────────

    pub async fn create_event(
        &self,
        id: Ulid,
        title: String,
        description: Option<String>,
        span: Span,
    ) -> Result<(), EngineError> {
        check_len(&title, MAX_TITLE_LEN, "event title too long")?;
        check_opt_len(&description, MAX_DESCRIPTION_LEN, "event description too long")?;
        validate_span(&span)?;
        if self.store.event_count() >= MAX_EVENTS {
            return Err(EngineError::LimitExceeded("too many events"));
        }

        let _guards = self.lock_all(&[id]).await;
        if self.store.contains_event(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_and_apply(&Change::EventCreated { id, title, description, span }).await
    }

    /// Edit an event. When the span changes, every allocation that follows
    /// the event moves with it and is revalidated on its resource; custom
    /// allocations must still fit. Any rejection leaves everything unchanged.
    pub async fn update_event(
        &self,
        id: Ulid,
        title: String,
        description: Option<String>,
        span: Span,
    ) -> Result<(), EngineError> {
        check_len(&title, MAX_TITLE_LEN, "event title too long")?;
        check_opt_len(&description, MAX_DESCRIPTION_LEN, "event description too long")?;
        validate_span(&span)?;

        let _guards = self.lock_event_and_resources(id).await;
        let event = self.store.get_event(id).ok_or(EngineError::NotFound(id))?;

        let mut moves = Vec::new();
        if event.span != span {
            let own = self.store.allocations_for_event(id);

            let mut by_resource: HashMap<Ulid, Vec<&Allocation>> = HashMap::new();
            for a in &own {
                by_resource.entry(a.resource_id).or_default().push(a);
            }

            for (resource_id, mine) in &by_resource {
                let mut placed: Vec<Allocation> = live_allocations_for_resource(&self.store, *resource_id)
                    .into_iter()
                    .filter(|a| a.event_id != id)
                    .collect();

                for a in mine {
                    let new_span = if a.custom_span {
                        if !span.contains_span(&a.span) {
                            let err = EngineError::OutsideEvent { allocation: a.span, event: span };
                            record_rejection(&err);
                            return Err(err);
                        }
                        a.span
                    } else {
                        span
                    };
                    if let Err(err) = check_allocation(&placed, *resource_id, id, &new_span, None) {
                        record_rejection(&err);
                        return Err(err);
                    }
                    let mut moved = (*a).clone();
                    moved.span = new_span;
                    if moved.span != a.span {
                        moves.push(moved.clone());
                    }
                    insert_sorted(&mut placed, moved);
                }
            }
        }

        if !moves.is_empty() {
            debug!(event = %id, moved = moves.len(), "rescheduling event allocations");
        }
        let moved = moves.iter().map(|a| (a.id, a.span)).collect();
        self.persist_and_apply(&Change::EventUpdated {
            id,
            title,
            description,
            span,
            moved,
        })
        .await
    }

    /// Delete an event and every allocation it holds.
    pub async fn delete_event(&self, id: Ulid) -> Result<(), EngineError> {
        let guards = self.lock_event_and_resources(id).await;
        if !self.store.contains_event(&id) {
            return Err(EngineError::NotFound(id));
        }
        let cascade = self.store.allocations_for_event(id);
        for a in &cascade {
            self.persist_and_apply(&Change::AllocationDeleted { id: a.id }).await?;
        }
        debug!(event = %id, cascaded = cascade.len(), "deleted event");
        self.persist_and_apply(&Change::EventDeleted { id }).await?;
        drop(guards);
        self.forget_lock(id);
        Ok(())
    }

    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(
        &self,
        id: Ulid,
        name: String,
        kind: Option<String>,
        capacity: Option<u32>,
    ) -> Result<(), EngineError> {
        check_len(&name, MAX_NAME_LEN, "resource name too long")?;
        check_opt_len(&kind, MAX_KIND_LEN, "resource kind too long")?;
        if self.store.resource_count() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let _guards = self.lock_all(&[id]).await;
        if self.store.contains_resource(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_and_apply(&Change::ResourceCreated { id, name, kind, capacity }).await
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: String,
        kind: Option<String>,
        capacity: Option<u32>,
    ) -> Result<(), EngineError> {
        check_len(&name, MAX_NAME_LEN, "resource name too long")?;
        check_opt_len(&kind, MAX_KIND_LEN, "resource kind too long")?;

        let _guards = self.lock_all(&[id]).await;
        if !self.store.contains_resource(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(&Change::ResourceUpdated { id, name, kind, capacity }).await
    }

    /// Delete a resource and every allocation on it.
    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let guards = self.lock_all(&[id]).await;
        if !self.store.contains_resource(&id) {
            return Err(EngineError::NotFound(id));
        }
        let cascade = self.store.allocations_for_resource(id);
        for a in &cascade {
            self.persist_and_apply(&Change::AllocationDeleted { id: a.id }).await?;
        }
        debug!(resource = %id, cascaded = cascade.len(), "deleted resource");
        self.persist_and_apply(&Change::ResourceDeleted { id }).await?;
        drop(guards);
        self.forget_lock(id);
        Ok(())
    }

    // ── Allocations ──────────────────────────────────────────

    /// Validate and persist one allocation. `span: None` mirrors the event.
    pub async fn allocate(
        &self,
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
        span: Option<Span>,
    ) -> Result<Allocation, EngineError> {
        let result = self.allocate_inner(id, event_id, resource_id, span).await;
        if let Err(ref err) = result {
            record_rejection(err);
        }
        result
    }

    async fn allocate_inner(
        &self,
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
        span: Option<Span>,
    ) -> Result<Allocation, EngineError> {
        if let Some(ref s) = span {
            validate_span(s)?;
        }
        let _guards = self.lock_all(&[event_id, resource_id]).await;
        if self.store.get_allocation(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.store.allocation_count_for_resource(&resource_id) >= MAX_ALLOCATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many allocations on resource"));
        }

        let proposal = Proposal { resource_id, event_id, span, exclude: None };
        let effective = validate_allocation(&self.store, &proposal)?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let change = Change::AllocationCreated {
            id,
            event_id,
            resource_id,
            span: effective,
            custom_span: span.is_some(),
            seq,
        };
        self.persist_and_apply(&change).await?;
        self.store.get_allocation(&id).ok_or(EngineError::NotFound(id))
    }

    /// Allocate several at once. All-or-nothing: every row is validated
    /// against the store and against the rows before it; if any is rejected
    /// none are written.
    pub async fn batch_allocate(&self, requests: Vec<AllocationRequest>) -> Result<Vec<Allocation>, EngineError> {
        let result = self.batch_allocate_inner(requests).await;
        if let Err(ref err) = result {
            record_rejection(err);
        }
        result
    }

    async fn batch_allocate_inner(&self, requests: Vec<AllocationRequest>) -> Result<Vec<Allocation>, EngineError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for (_, _, _, span) in &requests {
            if let Some(s) = span {
                validate_span(s)?;
            }
        }

        let lock_ids: Vec<Ulid> = requests
            .iter()
            .flat_map(|(_, event_id, resource_id, _)| [*event_id, *resource_id])
            .collect();
        let _guards = self.lock_all(&lock_ids).await;

        // Phase 1: validate everything against the store and earlier rows.
        let mut accepted: HashMap<Ulid, Vec<Allocation>> = HashMap::new();
        let mut staged = Vec::with_capacity(requests.len());
        for (id, event_id, resource_id, span) in &requests {
            if self.store.get_allocation(id).is_some() || staged.iter().any(|a: &Allocation| a.id == *id) {
                return Err(EngineError::AlreadyExists(*id));
            }
            let proposal = Proposal {
                resource_id: *resource_id,
                event_id: *event_id,
                span: *span,
                exclude: None,
            };
            let effective = validate_allocation(&self.store, &proposal)?;
            let earlier = accepted.entry(*resource_id).or_default();
            check_allocation(earlier, *resource_id, *event_id, &effective, None)?;
            if self.store.allocation_count_for_resource(resource_id) + earlier.len() >= MAX_ALLOCATIONS_PER_RESOURCE {
                return Err(EngineError::LimitExceeded("too many allocations on resource"));
            }

            let alloc = Allocation {
                id: *id,
                event_id: *event_id,
                resource_id: *resource_id,
                span: effective,
                custom_span: span.is_some(),
                seq: 0,
            };
            insert_sorted(earlier, alloc.clone());
            staged.push(alloc);
        }

        // Phase 2: all validated, commit in request order.
        for alloc in &mut staged {
            alloc.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            self.persist_and_apply(&Change::AllocationCreated {
                id: alloc.id,
                event_id: alloc.event_id,
                resource_id: alloc.resource_id,
                span: alloc.span,
                custom_span: alloc.custom_span,
                seq: alloc.seq,
            })
            .await?;
        }
        Ok(staged)
    }

    /// Move an allocation to another resource and/or span. The allocation is
    /// excluded from its own comparison set.
    pub async fn update_allocation(
        &self,
        id: Ulid,
        resource_id: Option<Ulid>,
        span: SpanUpdate,
    ) -> Result<Allocation, EngineError> {
        let result = self.update_allocation_inner(id, resource_id, span).await;
        if let Err(ref err) = result {
            record_rejection(err);
        }
        result
    }

    async fn update_allocation_inner(
        &self,
        id: Ulid,
        resource_id: Option<Ulid>,
        span: SpanUpdate,
    ) -> Result<Allocation, EngineError> {
        if let SpanUpdate::Custom(ref s) = span {
            validate_span(s)?;
        }

        let (_guards, current) = loop {
            let before = self.store.get_allocation(&id).ok_or(EngineError::NotFound(id))?;
            let target = resource_id.unwrap_or(before.resource_id);
            let guards = self
                .lock_all(&[before.event_id, before.resource_id, target])
                .await;
            let current = self.store.get_allocation(&id).ok_or(EngineError::NotFound(id))?;
            if current.resource_id == before.resource_id {
                break (guards, current);
            }
        };

        let target = resource_id.unwrap_or(current.resource_id);
        let (requested, custom_span) = match span {
            SpanUpdate::Keep if current.custom_span => (Some(current.span), true),
            SpanUpdate::Keep | SpanUpdate::FollowEvent => (None, false),
            SpanUpdate::Custom(s) => (Some(s), true),
        };
        let proposal = Proposal {
            resource_id: target,
            event_id: current.event_id,
            span: requested,
            exclude: Some(id),
        };
        let effective = validate_allocation(&self.store, &proposal)?;

        self.persist_and_apply(&Change::AllocationUpdated {
            id,
            resource_id: target,
            span: effective,
            custom_span,
        })
        .await?;
        self.store.get_allocation(&id).ok_or(EngineError::NotFound(id))
    }

    pub async fn deallocate(&self, id: Ulid) -> Result<Allocation, EngineError> {
        let (_guards, current) = loop {
            let before = self.store.get_allocation(&id).ok_or(EngineError::NotFound(id))?;
            let guards = self.lock_all(&[before.resource_id]).await;
            let current = self.store.get_allocation(&id).ok_or(EngineError::NotFound(id))?;
            if current.resource_id == before.resource_id {
                break (guards, current);
            }
        };
        self.persist_and_apply(&Change::AllocationDeleted { id }).await?;
        Ok(current)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the records needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _barrier = self.wal_barrier.write().await;
        let changes = self.store.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { changes, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

