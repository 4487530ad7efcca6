//! In-memory binding: one `DashMap` per table plus a per-workspace
//! [`Timeline`] index of live intervals. Optionally durable through the WAL:
//! every mutation is an [`Event`] that is logged first and then applied, and
//! replaying the log rebuilds the same state.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use super::*;
use crate::wal::{Wal, WalHandle};

#[derive(Debug, Clone)]
struct Stored<T> {
    record: T,
    deleted_at: Option<DateTime<Utc>>,
}

impl<T> Stored<T> {
    fn live(record: T) -> Self {
        Self { record, deleted_at: None }
    }

    fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// The tables and timeline index. Shared with in-flight commits.
#[derive(Default)]
struct Tables {
    floors: DashMap<Ulid, Stored<Floor>>,
    workspaces: DashMap<Ulid, Stored<Workspace>>,
    users: DashMap<Ulid, User>,
    assignments: DashMap<Ulid, Assignment>,
    bookings: DashMap<Ulid, Booking>,
    offerings: DashMap<Ulid, Offering>,
    /// Live intervals per workspace, kept in step with the three tables above.
    timelines: DashMap<Ulid, Timeline>,
}

pub struct MemoryStore {
    tables: Arc<Tables>,
    wal: Option<WalHandle>,
    /// Shared by writers, exclusive for compaction, so a snapshot never misses an append.
    commit_gate: Arc<RwLock<()>>,
    /// Serializes floor/workspace structure changes (force delete vs. new workspace).
    structure: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A volatile store.
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Tables::default()),
            wal: None,
            commit_gate: Arc::new(RwLock::new(())),
            structure: Mutex::new(()),
        }
    }

    /// Replay the WAL at `path` and keep appending to it. Needs a tokio runtime.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let events = Wal::replay(path)?;
        let mut store = Self::new();
        for event in &events {
            store.tables.apply(event);
        }
        store.wal = Some(WalHandle::spawn(Wal::open(path)?));
        tracing::info!(path = %path.display(), events = events.len(), "memory store restored from WAL");
        Ok(store)
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        match &self.wal {
            Some(wal) => wal.appends_since_compact().await,
            None => 0,
        }
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact(&self) -> StoreResult<()> {
        let Some(wal) = &self.wal else { return Ok(()) };
        let _gate = self.commit_gate.write().await;
        let events = self.snapshot_events();
        let count = events.len();
        wal.compact(events)
            .await
            .map_err(|e| StoreError::Fault(format!("WAL compaction failed: {e}")))?;
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for f in self.tables.floors.iter() {
            events.push(Event::FloorCreated { floor: f.record.clone() });
            if let Some(at) = f.deleted_at {
                events.push(Event::FloorRemoved { id: f.record.id, force: false, at });
            }
        }
        for u in self.tables.users.iter() {
            events.push(Event::UserCreated { user: u.clone() });
        }
        for w in self.tables.workspaces.iter() {
            events.push(workspace_saved(&w.record));
            if let Some(at) = w.deleted_at {
                events.push(Event::WorkspaceRemoved { id: w.record.id, at });
            }
        }
        for a in self.tables.assignments.iter() {
            events.push(Event::AssignmentCreated { assignment: a.clone() });
        }
        for b in self.tables.bookings.iter() {
            events.push(Event::BookingSaved { booking: b.clone() });
        }
        for o in self.tables.offerings.iter() {
            events.push(Event::OfferingSaved { offering: o.clone() });
        }
        events
    }

    /// WAL-append then apply. With a WAL the pair runs on its own task, so a
    /// caller dropped while waiting for the fsync still sees the event applied.
    async fn persist(&self, event: Event) -> StoreResult<()> {
        let Some(wal) = self.wal.clone() else {
            let _gate = self.commit_gate.read().await;
            self.tables.apply(&event);
            return Ok(());
        };
        let gate = self.commit_gate.clone().read_owned().await;
        let tables = self.tables.clone();
        let commit = tokio::spawn(async move {
            let _gate = gate;
            wal.append(event.clone())
                .await
                .map_err(|e| StoreError::Fault(format!("WAL append failed: {e}")))?;
            tables.apply(&event);
            Ok(())
        });
        commit
            .await
            .map_err(|e| StoreError::Fault(format!("WAL commit task failed: {e}")))?
    }

    fn timeline_of(&self, workspace_id: Ulid, span: &Span) -> Timeline {
        self.tables.timelines
            .get(&workspace_id)
            .map(|tl| tl.window(span))
            .unwrap_or_else(|| Timeline::new(workspace_id))
    }

    fn live_workspace(&self, id: Ulid) -> StoreResult<Workspace> {
        self.tables.workspaces
            .get(&id)
            .filter(|w| w.is_live())
            .map(|w| w.record.clone())
            .ok_or(StoreError::not_found("workspace", id))
    }

    fn live_workspaces_on(&self, floor_id: Ulid) -> Vec<Workspace> {
        let mut list: Vec<Workspace> = self
            .tables
            .workspaces
            .iter()
            .filter(|w| w.is_live() && w.record.floor_id == floor_id)
            .map(|w| w.record.clone())
            .collect();
        list.sort_by_key(|w| w.id);
        list
    }

    fn check_floor(&self, floor_id: Ulid) -> StoreResult<()> {
        if !self.tables.floors.contains_key(&floor_id) {
            return Err(StoreError::Fault(format!(
                "foreign key violation: floor {floor_id} does not exist"
            )));
        }
        Ok(())
    }

    /// Foreign-key check shared by the reservation tables.
    fn check_refs(&self, workspace_id: Ulid, user_id: Ulid) -> StoreResult<()> {
        if !self.tables.workspaces.contains_key(&workspace_id) {
            return Err(StoreError::Fault(format!(
                "foreign key violation: workspace {workspace_id} does not exist"
            )));
        }
        if !self.tables.users.contains_key(&user_id) {
            return Err(StoreError::Fault(format!(
                "foreign key violation: user {user_id} does not exist"
            )));
        }
        Ok(())
    }

    fn expand(&self, workspace_id: Ulid, user_id: Ulid) -> Option<(String, String, Ulid, String)> {
        let ws = self.tables.workspaces.get(&workspace_id)?;
        let user = self.tables.users.get(&user_id)?;
        let floor = self.tables.floors.get(&ws.record.floor_id)?;
        Some((
            ws.record.name.clone(),
            user.name.clone(),
            floor.record.id,
            floor.record.name.clone(),
        ))
    }

    fn expand_booking(&self, booking: Booking) -> Option<ExpandedBooking> {
        let (workspace_name, user_name, floor_id, floor_name) =
            self.expand(booking.workspace_id, booking.user_id)?;
        Some(ExpandedBooking { booking, workspace_name, user_name, floor_id, floor_name })
    }

    fn expand_offering(&self, offering: Offering) -> Option<ExpandedOffering> {
        let (workspace_name, user_name, floor_id, floor_name) =
            self.expand(offering.workspace_id, offering.user_id)?;
        Some(ExpandedOffering { offering, workspace_name, user_name, floor_id, floor_name })
    }

    fn existing<T>(map: &DashMap<Ulid, T>, ids: &[Ulid]) -> Vec<Ulid> {
        let mut seen = HashSet::new();
        ids.iter()
            .copied()
            .filter(|id| map.contains_key(id) && seen.insert(*id))
            .collect()
    }
}

impl Tables {
    /// Apply an event to the tables. Infallible: validation happened before it was logged.
    fn apply(&self, event: &Event) {
        match event {
            Event::FloorCreated { floor } => {
                self.floors.insert(floor.id, Stored::live(floor.clone()));
            }
            Event::FloorRemoved { id, force, at } => {
                if let Some(mut floor) = self.floors.get_mut(id) {
                    floor.deleted_at.get_or_insert(*at);
                }
                if *force {
                    for mut ws in self.workspaces.iter_mut() {
                        if ws.record.floor_id == *id && ws.is_live() {
                            ws.deleted_at = Some(*at);
                        }
                    }
                }
            }
            Event::FloorsDeleted { ids } => {
                let doomed: HashSet<&Ulid> = ids.iter().collect();
                let orphans: Vec<Ulid> = self
                    .workspaces
                    .iter()
                    .filter(|w| doomed.contains(&w.record.floor_id))
                    .map(|w| w.record.id)
                    .collect();
                self.drop_workspaces(&orphans);
                for id in ids {
                    self.floors.remove(id);
                }
            }
            Event::WorkspaceSaved { id, name, floor_id, details, properties } => {
                let record = Workspace {
                    id: *id,
                    name: name.clone(),
                    floor_id: *floor_id,
                    details: details.clone(),
                    properties: serde_json::from_str(properties).unwrap_or_default(),
                };
                let deleted_at = self.workspaces.get(id).and_then(|w| w.deleted_at);
                self.workspaces.insert(*id, Stored { record, deleted_at });
            }
            Event::WorkspacePropertiesUpdated { id, properties } => {
                if let Some(mut ws) = self.workspaces.get_mut(id) {
                    ws.record.properties = serde_json::from_str(properties).unwrap_or_default();
                }
            }
            Event::WorkspaceRemoved { id, at } => {
                if let Some(mut ws) = self.workspaces.get_mut(id) {
                    ws.deleted_at.get_or_insert(*at);
                }
            }
            Event::WorkspacesDeleted { ids } => self.drop_workspaces(ids),
            Event::UserCreated { user } => {
                self.users.insert(user.id, user.clone());
            }
            Event::AssignmentCreated { assignment } => {
                self.assignments.insert(assignment.id, assignment.clone());
                self.timeline_insert(
                    assignment.workspace_id,
                    Interval::assignment(assignment.id, assignment.span(), assignment.user_id),
                );
            }
            Event::AssignmentsDeleted { ids } => {
                for id in ids {
                    if let Some((_, a)) = self.assignments.remove(id) {
                        self.timeline_remove(a.workspace_id, a.id);
                    }
                }
            }
            Event::BookingSaved { booking } => {
                if let Some(old) = self.bookings.insert(booking.id, booking.clone()) {
                    self.timeline_remove(old.workspace_id, old.id);
                }
                if !booking.cancelled {
                    self.timeline_insert(booking.workspace_id, Interval::booking(booking.id, booking.span()));
                }
            }
            Event::BookingsDeleted { ids } => {
                for id in ids {
                    if let Some((_, b)) = self.bookings.remove(id) {
                        self.timeline_remove(b.workspace_id, b.id);
                    }
                }
            }
            Event::OfferingSaved { offering } => {
                if let Some(old) = self.offerings.insert(offering.id, offering.clone()) {
                    self.timeline_remove(old.workspace_id, old.id);
                }
                if !offering.cancelled {
                    self.timeline_insert(
                        offering.workspace_id,
                        Interval::offering(offering.id, offering.span(), offering.user_id),
                    );
                }
            }
            Event::OfferingsDeleted { ids } => {
                for id in ids {
                    if let Some((_, o)) = self.offerings.remove(id) {
                        self.timeline_remove(o.workspace_id, o.id);
                    }
                }
            }
            Event::Batch { events } => {
                for event in events {
                    self.apply(event);
                }
            }
        }
    }

    /// Hard delete workspaces and everything hanging off them.
    fn drop_workspaces(&self, ids: &[Ulid]) {
        let doomed: HashSet<&Ulid> = ids.iter().collect();
        self.bookings.retain(|_, b| !doomed.contains(&b.workspace_id));
        self.offerings.retain(|_, o| !doomed.contains(&o.workspace_id));
        self.assignments.retain(|_, a| !doomed.contains(&a.workspace_id));
        for id in ids {
            self.timelines.remove(id);
            self.workspaces.remove(id);
        }
    }

    fn timeline_insert(&self, workspace_id: Ulid, interval: Interval) {
        self.timelines
            .entry(workspace_id)
            .or_insert_with(|| Timeline::new(workspace_id))
            .insert_interval(interval);
    }

    fn timeline_remove(&self, workspace_id: Ulid, id: Ulid) {
        if let Some(mut tl) = self.timelines.get_mut(&workspace_id) {
            tl.remove_interval(id);
        }
    }
}

fn workspace_saved(ws: &Workspace) -> Event {
    Event::WorkspaceSaved {
        id: ws.id,
        name: ws.name.clone(),
        floor_id: ws.floor_id,
        details: ws.details.clone(),
        properties: serde_json::Value::Object(ws.properties.clone()).to_string(),
    }
}

fn sorted_by_time<T>(mut list: Vec<T>, key: impl Fn(&T) -> (DateTime<Utc>, Ulid)) -> Vec<T> {
    list.sort_by_key(|r| key(r));
    list
}

#[async_trait]
impl FloorProvider for MemoryStore {
    async fn get_one_floor(&self, id: Ulid) -> StoreResult<Floor> {
        self.tables.floors
            .get(&id)
            .filter(|f| f.is_live())
            .map(|f| f.record.clone())
            .ok_or(StoreError::not_found("floor", id))
    }

    async fn get_all_floors(&self) -> StoreResult<Vec<Floor>> {
        let mut floors: Vec<Floor> = self
            .tables
            .floors
            .iter()
            .filter(|f| f.is_live())
            .map(|f| f.record.clone())
            .collect();
        floors.sort_by_key(|f| f.id);
        Ok(floors)
    }

    async fn all_floor_ids(&self) -> StoreResult<Vec<Ulid>> {
        let mut ids: Vec<Ulid> = self
            .tables
            .floors
            .iter()
            .filter(|f| f.is_live())
            .map(|f| f.record.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn create_floor(&self, floor: &Floor) -> StoreResult<Ulid> {
        if self.tables.floors.contains_key(&floor.id) {
            return Err(StoreError::Fault(format!("duplicate floor id {}", floor.id)));
        }
        self.persist(Event::FloorCreated { floor: floor.clone() }).await?;
        Ok(floor.id)
    }

    async fn remove_floor(&self, id: Ulid, force: bool) -> StoreResult<()> {
        let _structure = self.structure.lock().await;
        self.get_one_floor(id).await?;
        let live = self.live_workspaces_on(id).len();
        if live > 0 && !force {
            return Err(StoreError::InvalidOperation(format!(
                "floor {id} still has {live} workspaces; pass force_delete to remove them too"
            )));
        }
        self.persist(Event::FloorRemoved { id, force, at: Utc::now() }).await
    }

    async fn deleted_floors(&self) -> StoreResult<Vec<Floor>> {
        let mut floors: Vec<Floor> = self
            .tables
            .floors
            .iter()
            .filter(|f| !f.is_live())
            .map(|f| f.record.clone())
            .collect();
        floors.sort_by_key(|f| f.id);
        Ok(floors)
    }

    async fn delete_floors(&self, ids: &[Ulid]) -> StoreResult<u64> {
        let _structure = self.structure.lock().await;
        let ids = Self::existing(&self.tables.floors, ids);
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len() as u64;
        self.persist(Event::FloorsDeleted { ids }).await?;
        Ok(count)
    }
}

#[async_trait]
impl WorkspaceProvider for MemoryStore {
    async fn get_one_workspace(&self, id: Ulid) -> StoreResult<Workspace> {
        self.live_workspace(id)
    }

    async fn get_all_workspaces(&self) -> StoreResult<Vec<Workspace>> {
        let mut list: Vec<Workspace> = self
            .tables
            .workspaces
            .iter()
            .filter(|w| w.is_live())
            .map(|w| w.record.clone())
            .collect();
        list.sort_by_key(|w| w.id);
        Ok(list)
    }

    async fn workspaces_by_floor(&self, floor_id: Ulid) -> StoreResult<Vec<Workspace>> {
        Ok(self.live_workspaces_on(floor_id))
    }

    async fn count_workspaces_by_floor(&self, floor_id: Ulid) -> StoreResult<u64> {
        Ok(self
            .tables
            .workspaces
            .iter()
            .filter(|w| w.is_live() && w.record.floor_id == floor_id)
            .count() as u64)
    }

    async fn create_workspace(&self, workspace: &Workspace) -> StoreResult<Ulid> {
        let _structure = self.structure.lock().await;
        if self.tables.workspaces.contains_key(&workspace.id) {
            return Err(StoreError::Fault(format!("duplicate workspace id {}", workspace.id)));
        }
        self.check_floor(workspace.floor_id)?;
        self.persist(workspace_saved(workspace)).await?;
        Ok(workspace.id)
    }

    async fn upsert_workspace(&self, workspace: &Workspace) -> StoreResult<bool> {
        let _structure = self.structure.lock().await;
        let existing = self.tables.workspaces.get(&workspace.id).map(|w| w.is_live());
        if existing == Some(false) {
            return Err(StoreError::InvalidOperation(format!(
                "workspace {} was removed",
                workspace.id
            )));
        }
        self.check_floor(workspace.floor_id)?;
        self.persist(workspace_saved(workspace)).await?;
        Ok(existing.is_none())
    }

    async fn create_assigned_workspace(
        &self,
        workspace: &Workspace,
        assignment: &Assignment,
        baseline: Option<&Offering>,
    ) -> StoreResult<()> {
        let _structure = self.structure.lock().await;
        if self.tables.workspaces.contains_key(&workspace.id) {
            return Err(StoreError::Fault(format!("duplicate workspace id {}", workspace.id)));
        }
        self.check_floor(workspace.floor_id)?;
        if !self.tables.users.contains_key(&assignment.user_id) {
            return Err(StoreError::Fault(format!(
                "foreign key violation: user {} does not exist",
                assignment.user_id
            )));
        }
        let mut events = vec![
            workspace_saved(workspace),
            Event::AssignmentCreated { assignment: assignment.clone() },
        ];
        if let Some(offering) = baseline {
            events.push(Event::OfferingSaved { offering: offering.clone() });
        }
        self.persist(Event::Batch { events }).await
    }

    async fn update_workspace(&self, id: Ulid, workspace: &Workspace) -> StoreResult<()> {
        let _structure = self.structure.lock().await;
        self.live_workspace(id)?;
        self.check_floor(workspace.floor_id)?;
        let record = Workspace { id, ..workspace.clone() };
        self.persist(workspace_saved(&record)).await
    }

    async fn update_workspace_properties(&self, id: Ulid, properties: &Properties) -> StoreResult<()> {
        self.live_workspace(id)?;
        let properties = serde_json::Value::Object(properties.clone()).to_string();
        self.persist(Event::WorkspacePropertiesUpdated { id, properties }).await
    }

    async fn remove_workspace(&self, id: Ulid) -> StoreResult<()> {
        let _structure = self.structure.lock().await;
        self.live_workspace(id)?;
        self.persist(Event::WorkspaceRemoved { id, at: Utc::now() }).await
    }

    async fn deleted_workspaces(&self) -> StoreResult<Vec<Workspace>> {
        let mut list: Vec<Workspace> = self
            .tables
            .workspaces
            .iter()
            .filter(|w| !w.is_live())
            .map(|w| w.record.clone())
            .collect();
        list.sort_by_key(|w| w.id);
        Ok(list)
    }

    async fn delete_workspaces(&self, ids: &[Ulid]) -> StoreResult<u64> {
        let _structure = self.structure.lock().await;
        let ids = Self::existing(&self.tables.workspaces, ids);
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len() as u64;
        self.persist(Event::WorkspacesDeleted { ids }).await?;
        Ok(count)
    }

    async fn workspace_timeline(&self, workspace_id: Ulid, span: Span) -> StoreResult<Timeline> {
        if !self.tables.workspaces.contains_key(&workspace_id) {
            return Err(StoreError::not_found("workspace", workspace_id));
        }
        Ok(self.timeline_of(workspace_id, &span))
    }

    async fn floor_timelines(&self, floor_id: Ulid, span: Span) -> StoreResult<Vec<Timeline>> {
        if !self.tables.floors.contains_key(&floor_id) {
            return Err(StoreError::not_found("floor", floor_id));
        }
        Ok(self
            .live_workspaces_on(floor_id)
            .iter()
            .map(|w| self.timeline_of(w.id, &span))
            .collect())
    }
}

#[async_trait]
impl UserProvider for MemoryStore {
    async fn get_one_user(&self, id: Ulid) -> StoreResult<User> {
        self.tables.users
            .get(&id)
            .map(|u| u.clone())
            .ok_or(StoreError::not_found("user", id))
    }

    async fn get_all_users(&self) -> StoreResult<Vec<User>> {
        let mut users: Vec<User> = self.tables.users.iter().map(|u| u.clone()).collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn create_user(&self, user: &User) -> StoreResult<Ulid> {
        if self.tables.users.contains_key(&user.id) {
            return Err(StoreError::Fault(format!("duplicate user id {}", user.id)));
        }
        self.persist(Event::UserCreated { user: user.clone() }).await?;
        Ok(user.id)
    }

    async fn assigned_users_in_range(&self, span: Span) -> StoreResult<Vec<UserAssignment>> {
        Ok(self.user_assignments(|a| a.span().overlaps(&span)))
    }

    async fn assigned_users_at(&self, t: DateTime<Utc>) -> StoreResult<Vec<UserAssignment>> {
        let t = to_ms(&t);
        Ok(self.user_assignments(|a| a.span().contains_instant(t)))
    }
}

impl MemoryStore {
    fn user_assignments(&self, pred: impl Fn(&Assignment) -> bool) -> Vec<UserAssignment> {
        let list: Vec<UserAssignment> = self
            .tables
            .assignments
            .iter()
            .filter(|a| pred(a))
            .filter_map(|a| {
                let user = self.tables.users.get(&a.user_id)?.clone();
                Some(UserAssignment {
                    user,
                    assignment_id: a.id,
                    workspace_id: a.workspace_id,
                    start_time: a.start_time,
                    end_time: a.end_time,
                })
            })
            .collect();
        sorted_by_time(list, |ua| (ua.start_time, ua.assignment_id))
    }
}

#[async_trait]
impl BookingProvider for MemoryStore {
    async fn get_one_booking(&self, id: Ulid) -> StoreResult<Booking> {
        self.tables.bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(StoreError::not_found("booking", id))
    }

    async fn get_one_expanded_booking(&self, id: Ulid) -> StoreResult<ExpandedBooking> {
        let booking = self.get_one_booking(id).await?;
        self.expand_booking(booking)
            .ok_or(StoreError::not_found("booking", id))
    }

    async fn bookings(&self, filter: RecordFilter) -> StoreResult<Vec<Booking>> {
        let list = self
            .tables
            .bookings
            .iter()
            .filter(|b| filter.matches(b.workspace_id, b.user_id, &b.span()))
            .map(|b| b.clone())
            .collect();
        Ok(sorted_by_time(list, |b: &Booking| (b.start_time, b.id)))
    }

    async fn expanded_bookings(&self, filter: RecordFilter) -> StoreResult<Vec<ExpandedBooking>> {
        Ok(self
            .bookings(filter)
            .await?
            .into_iter()
            .filter_map(|b| self.expand_booking(b))
            .collect())
    }

    async fn create_booking(&self, booking: &Booking) -> StoreResult<Ulid> {
        if self.tables.bookings.contains_key(&booking.id) {
            return Err(StoreError::Fault(format!("duplicate booking id {}", booking.id)));
        }
        self.check_refs(booking.workspace_id, booking.user_id)?;
        self.persist(Event::BookingSaved { booking: booking.clone() }).await?;
        Ok(booking.id)
    }

    async fn update_booking(&self, id: Ulid, booking: &Booking) -> StoreResult<()> {
        self.get_one_booking(id).await?;
        self.check_refs(booking.workspace_id, booking.user_id)?;
        let booking = Booking { id, ..booking.clone() };
        self.persist(Event::BookingSaved { booking }).await
    }

    async fn remove_booking(&self, id: Ulid) -> StoreResult<()> {
        self.get_one_booking(id).await?;
        self.persist(Event::BookingsDeleted { ids: vec![id] }).await
    }

    async fn expired_bookings(&self, since: DateTime<Utc>) -> StoreResult<Vec<Booking>> {
        let list = self
            .tables
            .bookings
            .iter()
            .filter(|b| b.end_time < since)
            .map(|b| b.clone())
            .collect();
        Ok(sorted_by_time(list, |b: &Booking| (b.start_time, b.id)))
    }

    async fn delete_bookings(&self, ids: &[Ulid]) -> StoreResult<u64> {
        let ids = Self::existing(&self.tables.bookings, ids);
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len() as u64;
        self.persist(Event::BookingsDeleted { ids }).await?;
        Ok(count)
    }
}

#[async_trait]
impl OfferingProvider for MemoryStore {
    async fn get_one_offering(&self, id: Ulid) -> StoreResult<Offering> {
        self.tables.offerings
            .get(&id)
            .map(|o| o.clone())
            .ok_or(StoreError::not_found("offering", id))
    }

    async fn get_one_expanded_offering(&self, id: Ulid) -> StoreResult<ExpandedOffering> {
        let offering = self.get_one_offering(id).await?;
        self.expand_offering(offering)
            .ok_or(StoreError::not_found("offering", id))
    }

    async fn offerings(&self, filter: RecordFilter) -> StoreResult<Vec<Offering>> {
        let list = self
            .tables
            .offerings
            .iter()
            .filter(|o| filter.matches(o.workspace_id, o.user_id, &o.span()))
            .map(|o| o.clone())
            .collect();
        Ok(sorted_by_time(list, |o: &Offering| (o.start_time, o.id)))
    }

    async fn expanded_offerings(&self, filter: RecordFilter) -> StoreResult<Vec<ExpandedOffering>> {
        Ok(self
            .offerings(filter)
            .await?
            .into_iter()
            .filter_map(|o| self.expand_offering(o))
            .collect())
    }

    async fn offering_covering(&self, workspace_id: Ulid, span: Span) -> StoreResult<Offering> {
        let covering = self.tables.timelines.get(&workspace_id).and_then(|tl| {
            tl.overlapping(&span)
                .find(|i| matches!(i.kind, IntervalKind::Offering { .. }) && i.span.contains_span(&span))
                .map(|i| i.id)
        });
        let id = covering.ok_or(StoreError::Empty("no offering covers the window"))?;
        self.get_one_offering(id).await
    }

    async fn create_offering(&self, offering: &Offering) -> StoreResult<Ulid> {
        if self.tables.offerings.contains_key(&offering.id) {
            return Err(StoreError::Fault(format!("duplicate offering id {}", offering.id)));
        }
        self.check_refs(offering.workspace_id, offering.user_id)?;
        self.persist(Event::OfferingSaved { offering: offering.clone() }).await?;
        Ok(offering.id)
    }

    async fn update_offering(&self, id: Ulid, offering: &Offering) -> StoreResult<()> {
        self.get_one_offering(id).await?;
        self.check_refs(offering.workspace_id, offering.user_id)?;
        let offering = Offering { id, ..offering.clone() };
        self.persist(Event::OfferingSaved { offering }).await
    }

    async fn remove_offering(&self, id: Ulid) -> StoreResult<()> {
        self.get_one_offering(id).await?;
        self.persist(Event::OfferingsDeleted { ids: vec![id] }).await
    }

    async fn expired_offerings(&self, since: DateTime<Utc>) -> StoreResult<Vec<Offering>> {
        let list = self
            .tables
            .offerings
            .iter()
            .filter(|o| o.end_time < since)
            .map(|o| o.clone())
            .collect();
        Ok(sorted_by_time(list, |o: &Offering| (o.start_time, o.id)))
    }

    async fn delete_offerings(&self, ids: &[Ulid]) -> StoreResult<u64> {
        let ids = Self::existing(&self.tables.offerings, ids);
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len() as u64;
        self.persist(Event::OfferingsDeleted { ids }).await?;
        Ok(count)
    }
}

#[async_trait]
impl AssigneeProvider for MemoryStore {
    async fn create_assignment(&self, assignment: &Assignment, baseline: Option<&Offering>) -> StoreResult<Ulid> {
        if self.tables.assignments.contains_key(&assignment.id) {
            return Err(StoreError::Fault(format!("duplicate assignment id {}", assignment.id)));
        }
        self.check_refs(assignment.workspace_id, assignment.user_id)?;
        let created = Event::AssignmentCreated { assignment: assignment.clone() };
        let event = match baseline {
            Some(offering) => {
                if self.tables.offerings.contains_key(&offering.id) {
                    return Err(StoreError::Fault(format!("duplicate offering id {}", offering.id)));
                }
                Event::Batch {
                    events: vec![created, Event::OfferingSaved { offering: offering.clone() }],
                }
            }
            None => created,
        };
        self.persist(event).await?;
        Ok(assignment.id)
    }

    async fn assignments(&self, filter: RecordFilter) -> StoreResult<Vec<Assignment>> {
        let list = self
            .tables
            .assignments
            .iter()
            .filter(|a| filter.matches(a.workspace_id, a.user_id, &a.span()))
            .map(|a| a.clone())
            .collect();
        Ok(sorted_by_time(list, |a: &Assignment| (a.start_time, a.id)))
    }

    async fn is_assigned(&self, workspace_id: Ulid, span: Span) -> StoreResult<bool> {
        Ok(self
            .timeline_of(workspace_id, &span)
            .intervals
            .iter()
            .any(|i| matches!(i.kind, IntervalKind::Assignment { .. })))
    }

    async fn is_fully_assigned(&self, workspace_id: Ulid, span: Span) -> StoreResult<bool> {
        let mut assigned: Vec<Span> = self
            .timeline_of(workspace_id, &span)
            .intervals
            .iter()
            .filter(|i| matches!(i.kind, IntervalKind::Assignment { .. }))
            .map(|i| i.span)
            .collect();
        Ok(fully_covered(&mut assigned, &span))
    }

    async fn expired_assignments(&self, since: DateTime<Utc>) -> StoreResult<Vec<Assignment>> {
        let list = self
            .tables
            .assignments
            .iter()
            .filter(|a| a.end_time < since)
            .map(|a| a.clone())
            .collect();
        Ok(sorted_by_time(list, |a: &Assignment| (a.start_time, a.id)))
    }

    async fn delete_assignments(&self, ids: &[Ulid]) -> StoreResult<u64> {
        let ids = Self::existing(&self.tables.assignments, ids);
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len() as u64;
        self.persist(Event::AssignmentsDeleted { ids }).await?;
        Ok(count)
    }
}

#[async_trait]
impl Closable for MemoryStore {
    async fn close(&self) {
        tracing::info!(durable = self.is_durable(), "memory store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, h, 0, 0).unwrap()
    }

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("deskpool_test_memory");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    struct Seed {
        floor: Floor,
        workspace: Workspace,
        user: User,
    }

    async fn seed(store: &MemoryStore) -> Seed {
        let floor = Floor {
            id: Ulid::new(),
            name: "Ground".into(),
            download_url: "https://img.example/g".into(),
            address: "1 Main St".into(),
        };
        store.create_floor(&floor).await.unwrap();
        let mut properties = Properties::new();
        properties.insert("monitor".into(), serde_json::json!(2));
        let workspace = Workspace {
            id: Ulid::new(),
            name: "Desk 1".into(),
            floor_id: floor.id,
            details: "by the window".into(),
            properties,
        };
        store.create_workspace(&workspace).await.unwrap();
        let user = User {
            id: Ulid::new(),
            name: "Ada".into(),
            department: "Eng".into(),
            email: "ada@example.com".into(),
            is_admin: false,
        };
        store.create_user(&user).await.unwrap();
        Seed { floor, workspace, user }
    }

    fn booking(seed: &Seed, start: DateTime<Utc>, end: DateTime<Utc>) -> Booking {
        Booking {
            id: Ulid::new(),
            workspace_id: seed.workspace.id,
            user_id: seed.user.id,
            start_time: start,
            end_time: end,
            cancelled: false,
            created_by: seed.user.id,
        }
    }

    #[tokio::test]
    async fn cancelled_booking_leaves_timeline() {
        let store = MemoryStore::new();
        let s = seed(&store).await;
        let mut b = booking(&s, at(1, 9), at(1, 10));
        store.create_booking(&b).await.unwrap();

        let window = Span::from_times(&at(1, 0), &at(2, 0)).unwrap();
        let tl = store.workspace_timeline(s.workspace.id, window).await.unwrap();
        assert_eq!(tl.intervals.len(), 1);

        b.cancelled = true;
        store.update_booking(b.id, &b).await.unwrap();
        let tl = store.workspace_timeline(s.workspace.id, window).await.unwrap();
        assert!(tl.intervals.is_empty());
        assert!(store.get_one_booking(b.id).await.unwrap().cancelled);
    }

    #[tokio::test]
    async fn create_booking_requires_existing_refs() {
        let store = MemoryStore::new();
        let s = seed(&store).await;
        let mut b = booking(&s, at(1, 9), at(1, 10));
        b.user_id = Ulid::new();
        assert!(matches!(store.create_booking(&b).await, Err(StoreError::Fault(_))));
    }

    #[tokio::test]
    async fn remove_floor_without_force_is_invalid_while_workspaces_live() {
        let store = MemoryStore::new();
        let s = seed(&store).await;
        assert_eq!(store.count_workspaces_by_floor(s.floor.id).await.unwrap(), 1);
        let err = store.remove_floor(s.floor.id, false).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));

        store.remove_floor(s.floor.id, true).await.unwrap();
        assert!(matches!(
            store.get_one_floor(s.floor.id).await,
            Err(StoreError::NotFound { .. })
        ));
        let deleted = store.deleted_workspaces().await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].id, s.workspace.id);
        assert_eq!(store.count_workspaces_by_floor(s.floor.id).await.unwrap(), 0);
        assert_eq!(store.deleted_floors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_workspaces_cascades() {
        let store = MemoryStore::new();
        let s = seed(&store).await;
        let b = booking(&s, at(1, 9), at(1, 10));
        store.create_booking(&b).await.unwrap();
        let a = Assignment {
            id: Ulid::new(),
            workspace_id: s.workspace.id,
            user_id: s.user.id,
            start_time: at(1, 0),
            end_time: at(20, 0),
        };
        store.create_assignment(&a, None).await.unwrap();

        store.remove_workspace(s.workspace.id).await.unwrap();
        assert_eq!(store.delete_workspaces(&[s.workspace.id, s.workspace.id]).await.unwrap(), 1);
        assert!(store.bookings(RecordFilter::All).await.unwrap().is_empty());
        assert!(store.assignments(RecordFilter::All).await.unwrap().is_empty());
        assert_eq!(store.delete_workspaces(&[s.workspace.id]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn assignment_coverage_queries() {
        let store = MemoryStore::new();
        let s = seed(&store).await;
        for (start, end) in [(at(1, 0), at(5, 0)), (at(5, 0), at(10, 0))] {
            let a = Assignment {
                id: Ulid::new(),
                workspace_id: s.workspace.id,
                user_id: s.user.id,
                start_time: start,
                end_time: end,
            };
            store.create_assignment(&a, None).await.unwrap();
        }
        let inside = Span::from_times(&at(2, 0), &at(8, 0)).unwrap();
        let beyond = Span::from_times(&at(8, 0), &at(12, 0)).unwrap();
        let after = Span::from_times(&at(10, 0), &at(12, 0)).unwrap();
        assert!(store.is_fully_assigned(s.workspace.id, inside).await.unwrap());
        assert!(!store.is_fully_assigned(s.workspace.id, beyond).await.unwrap());
        assert!(store.is_assigned(s.workspace.id, beyond).await.unwrap());
        assert!(!store.is_assigned(s.workspace.id, after).await.unwrap());

        let at_now = store.assigned_users_at(at(5, 0)).await.unwrap();
        assert_eq!(at_now.len(), 1);
        assert_eq!(at_now[0].start_time, at(5, 0));
        assert_eq!(store.assigned_users_in_range(inside).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn offering_covering_returns_empty_when_none() {
        let store = MemoryStore::new();
        let s = seed(&store).await;
        let o = Offering {
            id: Ulid::new(),
            workspace_id: s.workspace.id,
            user_id: s.user.id,
            start_time: at(1, 8),
            end_time: at(1, 18),
            cancelled: false,
            created_by: s.user.id,
        };
        store.create_offering(&o).await.unwrap();
        let inner = Span::from_times(&at(1, 9), &at(1, 10)).unwrap();
        let wider = Span::from_times(&at(1, 7), &at(1, 10)).unwrap();
        assert_eq!(store.offering_covering(s.workspace.id, inner).await.unwrap().id, o.id);
        assert!(matches!(
            store.offering_covering(s.workspace.id, wider).await,
            Err(StoreError::Empty(_))
        ));
    }

    #[tokio::test]
    async fn expanded_bookings_join_names() {
        let store = MemoryStore::new();
        let s = seed(&store).await;
        let b = booking(&s, at(1, 9), at(1, 10));
        store.create_booking(&b).await.unwrap();
        let expanded = store.get_one_expanded_booking(b.id).await.unwrap();
        assert_eq!(expanded.workspace_name, "Desk 1");
        assert_eq!(expanded.user_name, "Ada");
        assert_eq!(expanded.floor_id, s.floor.id);
        assert_eq!(expanded.floor_name, "Ground");
        let by_user = store.expanded_bookings(RecordFilter::User(s.user.id)).await.unwrap();
        assert_eq!(by_user.len(), 1);
    }

    #[tokio::test]
    async fn wal_replay_restores_state() {
        let path = test_wal_path("replay_restores.wal");
        let (s, b) = {
            let store = MemoryStore::open(&path).unwrap();
            let s = seed(&store).await;
            let mut b = booking(&s, at(1, 9), at(1, 10));
            store.create_booking(&b).await.unwrap();
            b.cancelled = true;
            store.update_booking(b.id, &b).await.unwrap();
            store.remove_workspace(s.workspace.id).await.unwrap();
            (s, b)
        };

        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.get_one_floor(s.floor.id).await.unwrap(), s.floor);
        assert_eq!(store.get_one_booking(b.id).await.unwrap(), b);
        let deleted = store.deleted_workspaces().await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].properties["monitor"], serde_json::json!(2));
        let window = Span::from_times(&at(1, 0), &at(2, 0)).unwrap();
        let tl = store.workspace_timeline(s.workspace.id, window).await.unwrap();
        assert!(tl.intervals.is_empty());
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compaction.wal");
        let s = {
            let store = MemoryStore::open(&path).unwrap();
            let s = seed(&store).await;
            for h in 0..10 {
                let b = booking(&s, at(2, h), at(2, h + 1));
                store.create_booking(&b).await.unwrap();
                store.delete_bookings(&[b.id]).await.unwrap();
            }
            assert!(store.wal_appends_since_compact().await >= 20);
            store.compact().await.unwrap();
            assert_eq!(store.wal_appends_since_compact().await, 0);
            s
        };
        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.get_one_workspace(s.workspace.id).await.unwrap(), s.workspace);
        assert_eq!(store.get_one_user(s.user.id).await.unwrap(), s.user);
        assert!(store.bookings(RecordFilter::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn assigned_workspace_batch_replays_whole() {
        let path = test_wal_path("assigned_batch.wal");
        let (workspace, assignment, offering) = {
            let store = MemoryStore::open(&path).unwrap();
            let s = seed(&store).await;
            let workspace = Workspace { id: Ulid::new(), name: "Desk 2".into(), ..s.workspace.clone() };
            let assignment = Assignment {
                id: Ulid::new(),
                workspace_id: workspace.id,
                user_id: s.user.id,
                start_time: at(1, 0),
                end_time: at(10, 0),
            };
            let offering = Offering {
                id: Ulid::new(),
                workspace_id: workspace.id,
                user_id: s.user.id,
                start_time: at(1, 0),
                end_time: at(10, 0),
                cancelled: false,
                created_by: s.user.id,
            };
            store
                .create_assigned_workspace(&workspace, &assignment, Some(&offering))
                .await
                .unwrap();
            (workspace, assignment, offering)
        };

        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.get_one_workspace(workspace.id).await.unwrap(), workspace);
        assert_eq!(store.assignments(RecordFilter::Workspace(workspace.id)).await.unwrap(), vec![assignment]);
        assert_eq!(store.get_one_offering(offering.id).await.unwrap(), offering);
        let window = Span::from_times(&at(2, 0), &at(3, 0)).unwrap();
        assert_eq!(store.workspace_timeline(workspace.id, window).await.unwrap().intervals.len(), 2);
    }

    #[tokio::test]
    async fn assignment_with_duplicate_baseline_writes_nothing() {
        let store = MemoryStore::new();
        let s = seed(&store).await;
        let offering = Offering {
            id: Ulid::new(),
            workspace_id: s.workspace.id,
            user_id: s.user.id,
            start_time: at(1, 0),
            end_time: at(2, 0),
            cancelled: false,
            created_by: s.user.id,
        };
        store.create_offering(&offering).await.unwrap();
        let a = Assignment {
            id: Ulid::new(),
            workspace_id: s.workspace.id,
            user_id: s.user.id,
            start_time: at(1, 0),
            end_time: at(2, 0),
        };
        assert!(store.create_assignment(&a, Some(&offering)).await.is_err());
        assert!(store.assignments(RecordFilter::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_reports_creation_and_refuses_removed() {
        let store = MemoryStore::new();
        let s = seed(&store).await;
        let fresh = Workspace { id: Ulid::new(), name: "Desk 9".into(), ..s.workspace.clone() };
        assert!(store.upsert_workspace(&fresh).await.unwrap());
        let renamed = Workspace { name: "Desk 9b".into(), ..fresh.clone() };
        assert!(!store.upsert_workspace(&renamed).await.unwrap());
        assert_eq!(store.get_one_workspace(fresh.id).await.unwrap().name, "Desk 9b");

        store.remove_workspace(fresh.id).await.unwrap();
        assert!(matches!(
            store.upsert_workspace(&renamed).await,
            Err(StoreError::InvalidOperation(_))
        ));
        assert_eq!(store.all_floor_ids().await.unwrap(), vec![s.floor.id]);
    }

    #[tokio::test]
    async fn remove_one_reservation_frees_its_window() {
        let store = MemoryStore::new();
        let s = seed(&store).await;
        let offering = Offering {
            id: Ulid::new(),
            workspace_id: s.workspace.id,
            user_id: s.user.id,
            start_time: at(1, 8),
            end_time: at(1, 18),
            cancelled: false,
            created_by: s.user.id,
        };
        store.create_offering(&offering).await.unwrap();
        let b = booking(&s, at(1, 9), at(1, 10));
        store.create_booking(&b).await.unwrap();

        store.remove_offering(offering.id).await.unwrap();
        let day = Span::from_times(&at(1, 0), &at(2, 0)).unwrap();
        let tl = store.workspace_timeline(s.workspace.id, day).await.unwrap();
        assert_eq!(tl.intervals.len(), 1);
        assert_eq!(store.get_one_booking(b.id).await.unwrap(), b);

        store.remove_booking(b.id).await.unwrap();
        assert!(store.workspace_timeline(s.workspace.id, day).await.unwrap().intervals.is_empty());
        assert!(matches!(
            store.remove_booking(b.id).await,
            Err(StoreError::NotFound { entity: "booking", .. })
        ));
        assert!(matches!(
            store.remove_offering(offering.id).await,
            Err(StoreError::NotFound { entity: "offering", .. })
        ));
    }
}
