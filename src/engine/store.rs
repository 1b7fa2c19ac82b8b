use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Read side of the persistence collaborator.
///
/// Missing records come back as `None`, never as defaults. Writes go through
/// the engine, which serializes them per resource before validating, so a
/// read-then-decide on one resource cannot race with another write to it.
pub trait Store {
    /// Allocations on `resource_id`, ascending by allocation id.
    fn allocations_for_resource(&self, resource_id: Ulid) -> Vec<Allocation>;
    fn get_event(&self, id: Ulid) -> Option<Event>;
    fn get_resource(&self, id: Ulid) -> Option<Resource>;
    /// Ascending by id.
    fn list_resources(&self) -> Vec<Resource>;
    /// Ascending by id.
    fn list_events(&self) -> Vec<Event>;
}

pub struct InMemoryStore {
    events: DashMap<Ulid, Event>,
    resources: DashMap<Ulid, Resource>,
    allocations: DashMap<Ulid, Allocation>,
    by_resource: DashMap<Ulid, Vec<Ulid>>,
    by_event: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
            resources: DashMap::new(),
            allocations: DashMap::new(),
            by_resource: DashMap::new(),
            by_event: DashMap::new(),
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn contains_event(&self, id: &Ulid) -> bool {
        self.events.contains_key(id)
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_allocation(&self, id: &Ulid) -> Option<Allocation> {
        self.allocations.get(id).map(|e| e.value().clone())
    }

    pub fn allocation_count_for_resource(&self, resource_id: &Ulid) -> usize {
        self.by_resource.get(resource_id).map_or(0, |ids| ids.len())
    }

    /// Allocations held by `event_id`, ascending by allocation id.
    pub fn allocations_for_event(&self, event_id: Ulid) -> Vec<Allocation> {
        let ids = self
            .by_event
            .get(&event_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        self.collect_sorted(&ids)
    }

    /// Every allocation, ascending by id.
    pub fn list_allocations(&self) -> Vec<Allocation> {
        let mut all: Vec<Allocation> = self.allocations.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|a| a.id);
        all
    }

    /// Highest creation sequence seen so far, 0 when empty.
    pub fn max_seq(&self) -> u64 {
        self.allocations.iter().map(|e| e.value().seq).max().unwrap_or(0)
    }

    fn collect_sorted(&self, ids: &[Ulid]) -> Vec<Allocation> {
        let mut out: Vec<Allocation> = ids
            .iter()
            .filter_map(|id| self.allocations.get(id).map(|e| e.value().clone()))
            .collect();
        out.sort_by_key(|a| a.id);
        out
    }

    fn index(index: &DashMap<Ulid, Vec<Ulid>>, key: Ulid, id: Ulid) {
        index.entry(key).or_default().push(id);
    }

    fn unindex(index: &DashMap<Ulid, Vec<Ulid>>, key: &Ulid, id: &Ulid) {
        if let Some(mut ids) = index.get_mut(key) {
            ids.retain(|x| x != id);
        }
    }

    fn put_event(&self, id: Ulid, title: &str, description: &Option<String>, span: Span) {
        self.events.insert(
            id,
            Event {
                id,
                title: title.to_string(),
                description: description.clone(),
                span,
            },
        );
    }

    // ── Change application ───────────────────────────────────

    /// Apply one log record. Cascading deletes are written as their own
    /// records; an event edit carries the allocations it moves.
    pub fn apply(&self, change: &Change) {
        match change {
            Change::EventCreated { id, title, description, span } => {
                self.put_event(*id, title, description, *span);
            }
            Change::EventUpdated {
                id,
                title,
                description,
                span,
                moved,
            } => {
                for (alloc_id, new_span) in moved {
                    if let Some(mut alloc) = self.allocations.get_mut(alloc_id) {
                        alloc.span = *new_span;
                    }
                }
                self.put_event(*id, title, description, *span);
            }
            Change::EventDeleted { id } => {
                self.events.remove(id);
                self.by_event.remove(id);
            }
            Change::ResourceCreated { id, name, kind, capacity }
            | Change::ResourceUpdated { id, name, kind, capacity } => {
                self.resources.insert(
                    *id,
                    Resource {
                        id: *id,
                        name: name.clone(),
                        kind: kind.clone(),
                        capacity: *capacity,
                    },
                );
            }
            Change::ResourceDeleted { id } => {
                self.resources.remove(id);
                self.by_resource.remove(id);
            }
            Change::AllocationCreated {
                id,
                event_id,
                resource_id,
                span,
                custom_span,
                seq,
            } => {
                self.allocations.insert(
                    *id,
                    Allocation {
                        id: *id,
                        event_id: *event_id,
                        resource_id: *resource_id,
                        span: *span,
                        custom_span: *custom_span,
                        seq: *seq,
                    },
                );
                Self::index(&self.by_resource, *resource_id, *id);
                Self::index(&self.by_event, *event_id, *id);
            }
            Change::AllocationUpdated {
                id,
                resource_id,
                span,
                custom_span,
            } => {
                let previous = match self.allocations.get_mut(id) {
                    Some(mut alloc) => {
                        let previous = alloc.resource_id;
                        alloc.resource_id = *resource_id;
                        alloc.span = *span;
                        alloc.custom_span = *custom_span;
                        previous
                    }
                    None => return,
                };
                if previous != *resource_id {
                    Self::unindex(&self.by_resource, &previous, id);
                    Self::index(&self.by_resource, *resource_id, *id);
                }
            }
            Change::AllocationDeleted { id } => {
                if let Some((_, alloc)) = self.allocations.remove(id) {
                    Self::unindex(&self.by_resource, &alloc.resource_id, id);
                    Self::unindex(&self.by_event, &alloc.event_id, id);
                }
            }
        }
    }

    /// Records that rebuild the current state from nothing: resources and
    /// events first, then allocations in creation order.
    pub fn snapshot(&self) -> Vec<Change> {
        let mut changes = Vec::new();
        for r in self.list_resources() {
            changes.push(Change::ResourceCreated {
                id: r.id,
                name: r.name,
                kind: r.kind,
                capacity: r.capacity,
            });
        }
        for e in self.list_events() {
            changes.push(Change::EventCreated {
                id: e.id,
                title: e.title,
                description: e.description,
                span: e.span,
            });
        }
        let mut allocations = self.list_allocations();
        allocations.sort_by_key(|a| a.seq);
        for a in allocations {
            changes.push(Change::AllocationCreated {
                id: a.id,
                event_id: a.event_id,
                resource_id: a.resource_id,
                span: a.span,
                custom_span: a.custom_span,
                seq: a.seq,
            });
        }
        changes
    }
}

impl Store for InMemoryStore {
    fn allocations_for_resource(&self, resource_id: Ulid) -> Vec<Allocation> {
        let ids = self
            .by_resource
            .get(&resource_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        self.collect_sorted(&ids)
    }

    fn get_event(&self, id: Ulid) -> Option<Event> {
        self.events.get(&id).map(|e| e.value().clone())
    }

    fn get_resource(&self, id: Ulid) -> Option<Resource> {
        self.resources.get(&id).map(|e| e.value().clone())
    }

    fn list_resources(&self) -> Vec<Resource> {
        let mut all: Vec<Resource> = self.resources.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|r| r.id);
        all
    }

    fn list_events(&self) -> Vec<Event> {
        let mut all: Vec<Event> = self.events.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|e| e.id);
        all
    }
}
