use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    rejection_label, BOOKINGS_CREATED_TOTAL, BOOKINGS_REJECTED_TOTAL, OFFERINGS_CREATED_TOTAL,
    OFFERINGS_REJECTED_TOTAL, REAPER_ROWS_REMOVED_TOTAL,
};

use super::conflict::{
    check_bookable, check_offerable, validate_properties, validate_text, validate_window,
};
use super::{Engine, EngineError, EngineResult};

/// Rows hard-deleted by one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub bookings: u64,
    pub offerings: u64,
    pub assignments: u64,
    pub workspaces: u64,
    pub floors: u64,
}

impl ReapReport {
    pub fn total(&self) -> u64 {
        self.bookings + self.offerings + self.assignments + self.workspaces + self.floors
    }
}

fn validate_workspace(input: &WorkspaceInput) -> EngineResult<()> {
    validate_text("name", &input.name, MAX_NAME_LEN, true)?;
    validate_text("details", &input.details, MAX_DETAILS_LEN, false)?;
    validate_properties(&input.properties)
}

/// The assignee's own offering over exactly the assignment window.
fn baseline_offering(assignment: &Assignment) -> Offering {
    Offering {
        id: Ulid::new(),
        workspace_id: assignment.workspace_id,
        user_id: assignment.user_id,
        start_time: assignment.start_time,
        end_time: assignment.end_time,
        cancelled: false,
        created_by: assignment.user_id,
    }
}

fn same_window_offering(timeline: &Timeline, user_id: Ulid, span: &Span) -> Option<Ulid> {
    timeline
        .overlapping(span)
        .find(|i| i.kind == IntervalKind::Offering { user_id } && i.span == *span)
        .map(|i| i.id)
}

impl Engine {
    // ── Floors ───────────────────────────────────────────────

    pub async fn create_floor(&self, input: NewFloor) -> EngineResult<Floor> {
        validate_text("name", &input.name, MAX_NAME_LEN, true)?;
        validate_text("address", &input.address, MAX_ADDRESS_LEN, true)?;
        let floor = Floor {
            id: Ulid::new(),
            name: input.name,
            download_url: input.download_url,
            address: input.address,
        };
        self.store.create_floor(&floor).await?;
        tracing::info!(floor_id = %floor.id, name = %floor.name, "floor created");
        Ok(floor)
    }

    /// Holds the lock of every live workspace on the floor, so a force
    /// delete never lands between another writer's check and its write.
    pub async fn remove_floor(&self, id: Ulid, opts: DeleteFloor) -> EngineResult<()> {
        loop {
            let listed = self.floor_workspace_ids(id).await?;
            let ids = listed.clone();
            let removed = self
                .locked(&ids, move |engine| async move {
                    // a workspace added since listing is not locked yet
                    if engine.floor_workspace_ids(id).await? != listed {
                        return Ok(false);
                    }
                    engine.store.remove_floor(id, opts.force_delete).await?;
                    tracing::info!(
                        floor_id = %id,
                        force = opts.force_delete,
                        workspaces = listed.len(),
                        "floor removed"
                    );
                    Ok(true)
                })
                .await?;
            if removed {
                return Ok(());
            }
        }
    }

    async fn floor_workspace_ids(&self, floor_id: Ulid) -> EngineResult<Vec<Ulid>> {
        let mut ids: Vec<Ulid> = self
            .store
            .workspaces_by_floor(floor_id)
            .await?
            .iter()
            .map(|w| w.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    // ── Workspaces ───────────────────────────────────────────

    pub async fn create_workspace(&self, input: WorkspaceInput) -> EngineResult<Workspace> {
        validate_workspace(&input)?;
        self.store.get_one_floor(input.floor_id).await?;
        let workspace = Workspace {
            id: Ulid::new(),
            name: input.name,
            floor_id: input.floor_id,
            details: input.details,
            properties: input.properties,
        };
        self.store.create_workspace(&workspace).await?;
        tracing::info!(workspace_id = %workspace.id, floor_id = %workspace.floor_id, "workspace created");
        Ok(workspace)
    }

    /// Create the workspace under a caller-chosen id, or overwrite it.
    /// Returns whether it was created.
    pub async fn upsert_workspace(&self, id: Ulid, input: WorkspaceInput) -> EngineResult<(Workspace, bool)> {
        validate_workspace(&input)?;
        self.store.get_one_floor(input.floor_id).await?;
        let workspace = Workspace {
            id,
            name: input.name,
            floor_id: input.floor_id,
            details: input.details,
            properties: input.properties,
        };
        let created = self.store.upsert_workspace(&workspace).await?;
        tracing::info!(workspace_id = %id, floor_id = %workspace.floor_id, created, "workspace upserted");
        Ok((workspace, created))
    }

    /// A new workspace and its first assignment, plus the baseline offering
    /// when asked. Nothing is written unless all of it is.
    pub async fn create_assigned_workspace(&self, input: AssignedWorkspaceInput) -> EngineResult<AssignedWorkspace> {
        validate_workspace(&input.workspace)?;
        validate_window(&input.start_time, &input.end_time)?;
        self.store.get_one_floor(input.workspace.floor_id).await?;
        self.store.get_one_user(input.user_id).await?;

        let workspace = Workspace {
            id: Ulid::new(),
            name: input.workspace.name,
            floor_id: input.workspace.floor_id,
            details: input.workspace.details,
            properties: input.workspace.properties,
        };
        let assignment = Assignment {
            id: Ulid::new(),
            workspace_id: workspace.id,
            user_id: input.user_id,
            start_time: input.start_time,
            end_time: input.end_time,
        };
        let offering = input.offer_by_default.then(|| baseline_offering(&assignment));

        self.locked(&[workspace.id], move |engine| async move {
            engine
                .store
                .create_assigned_workspace(&workspace, &assignment, offering.as_ref())
                .await?;
            if offering.is_some() {
                metrics::counter!(OFFERINGS_CREATED_TOTAL).increment(1);
            }
            tracing::info!(
                workspace_id = %workspace.id,
                assignment_id = %assignment.id,
                user_id = %assignment.user_id,
                "assigned workspace created"
            );
            Ok(AssignedWorkspace { workspace, assignment, offering })
        })
        .await
    }

    pub async fn update_workspace(&self, id: Ulid, input: WorkspaceInput) -> EngineResult<Workspace> {
        validate_workspace(&input)?;
        self.store.get_one_workspace(id).await?;
        self.store.get_one_floor(input.floor_id).await?;
        let workspace = Workspace {
            id,
            name: input.name,
            floor_id: input.floor_id,
            details: input.details,
            properties: input.properties,
        };
        self.store.update_workspace(id, &workspace).await?;
        Ok(workspace)
    }

    /// Replace only the free-form property map.
    pub async fn update_workspace_properties(&self, id: Ulid, properties: Properties) -> EngineResult<Workspace> {
        validate_properties(&properties)?;
        self.store.update_workspace_properties(id, &properties).await?;
        Ok(self.store.get_one_workspace(id).await?)
    }

    pub async fn remove_workspace(&self, id: Ulid) -> EngineResult<()> {
        self.store.get_one_workspace(id).await?;
        self.locked(&[id], move |engine| async move {
            engine.store.remove_workspace(id).await?;
            tracing::info!(workspace_id = %id, "workspace removed");
            Ok(())
        })
        .await
    }

    // ── Users & assignments (loader path) ────────────────────

    pub async fn create_user(&self, user: User) -> EngineResult<User> {
        validate_text("name", &user.name, MAX_NAME_LEN, true)?;
        validate_text("email", &user.email, MAX_NAME_LEN, false)?;
        validate_text("department", &user.department, MAX_NAME_LEN, false)?;
        self.store.create_user(&user).await?;
        Ok(user)
    }

    /// Record an assignment. With `offer_by_default` the owner's baseline
    /// offering for the same window is checked first and written in the same
    /// store commit, so a rejected baseline leaves no assignment behind.
    pub async fn create_assignment(&self, input: AssignmentInput) -> EngineResult<(Assignment, Option<Offering>)> {
        let span = validate_window(&input.start_time, &input.end_time)?;
        self.store.get_one_workspace(input.workspace_id).await?;
        self.store.get_one_user(input.user_id).await?;
        self.locked(&[input.workspace_id], move |engine| async move {
            engine.create_assignment_locked(input, span).await
        })
        .await
    }

    async fn create_assignment_locked(
        &self,
        input: AssignmentInput,
        span: Span,
    ) -> EngineResult<(Assignment, Option<Offering>)> {
        self.store.get_one_workspace(input.workspace_id).await?;
        let assignment = Assignment {
            id: Ulid::new(),
            workspace_id: input.workspace_id,
            user_id: input.user_id,
            start_time: input.start_time,
            end_time: input.end_time,
        };

        let mut baseline = None;
        let mut existing = None;
        if input.offer_by_default {
            let mut timeline = self.store.workspace_timeline(input.workspace_id, span).await?;
            match same_window_offering(&timeline, input.user_id, &span) {
                Some(id) => existing = Some(self.store.get_one_offering(id).await?),
                None => {
                    timeline.insert_interval(Interval::assignment(assignment.id, span, assignment.user_id));
                    if let Err(e) = check_offerable(&timeline, assignment.user_id, &span) {
                        metrics::counter!(OFFERINGS_REJECTED_TOTAL, "reason" => rejection_label(&e)).increment(1);
                        return Err(e);
                    }
                    baseline = Some(baseline_offering(&assignment));
                }
            }
        }

        self.store.create_assignment(&assignment, baseline.as_ref()).await?;
        if baseline.is_some() {
            metrics::counter!(OFFERINGS_CREATED_TOTAL).increment(1);
        }
        tracing::info!(
            assignment_id = %assignment.id,
            workspace_id = %assignment.workspace_id,
            user_id = %assignment.user_id,
            baseline = baseline.is_some(),
            "assignment created"
        );
        Ok((assignment, baseline.or(existing)))
    }

    /// Baseline offering covering a whole assignment. Idempotent: an existing
    /// live offering by the assignee with the identical window is returned.
    pub async fn create_default_offering(&self, assignment: &Assignment) -> EngineResult<Offering> {
        let span = validate_window(&assignment.start_time, &assignment.end_time)?;
        let assignment = assignment.clone();
        self.locked(&[assignment.workspace_id], move |engine| async move {
            let timeline = engine.store.workspace_timeline(assignment.workspace_id, span).await?;
            if let Some(id) = same_window_offering(&timeline, assignment.user_id, &span) {
                return Ok(engine.store.get_one_offering(id).await?);
            }
            check_offerable(&timeline, assignment.user_id, &span)?;
            let offering = baseline_offering(&assignment);
            engine.store.create_offering(&offering).await?;
            metrics::counter!(OFFERINGS_CREATED_TOTAL).increment(1);
            Ok(offering)
        })
        .await
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn create_booking(&self, input: ReservationInput) -> EngineResult<Booking> {
        let span = validate_window(&input.start_time, &input.end_time)?;
        self.store.get_one_workspace(input.workspace_id).await?;
        self.store.get_one_user(input.user_id).await?;
        self.locked(&[input.workspace_id], move |engine| async move {
            engine.create_booking_locked(input, span).await
        })
        .await
    }

    async fn create_booking_locked(&self, input: ReservationInput, span: Span) -> EngineResult<Booking> {
        self.store.get_one_workspace(input.workspace_id).await?;
        let timeline = self.store.workspace_timeline(input.workspace_id, span).await?;
        if let Err(e) = check_bookable(&timeline, &span) {
            metrics::counter!(BOOKINGS_REJECTED_TOTAL, "reason" => rejection_label(&e)).increment(1);
            return Err(e);
        }

        let booking = Booking {
            id: Ulid::new(),
            workspace_id: input.workspace_id,
            user_id: input.user_id,
            start_time: input.start_time,
            end_time: input.end_time,
            cancelled: false,
            created_by: input.created_by.unwrap_or(input.user_id),
        };
        self.store.create_booking(&booking).await?;
        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::debug!(booking_id = %booking.id, workspace_id = %booking.workspace_id, "booking created");
        Ok(booking)
    }

    /// Idempotent: cancelling an already cancelled booking returns it unchanged.
    pub async fn cancel_booking(&self, id: Ulid) -> EngineResult<Booking> {
        let current = self.store.get_one_booking(id).await?;
        self.locked(&[current.workspace_id], move |engine| async move {
            let mut booking = engine.store.get_one_booking(id).await?;
            if booking.cancelled {
                return Ok(booking);
            }
            booking.cancelled = true;
            engine.store.update_booking(id, &booking).await?;
            Ok(booking)
        })
        .await
    }

    /// Move a booking. Checked as if the old booking were already gone; on
    /// any failure the original stays untouched.
    pub async fn update_booking(&self, id: Ulid, input: ReservationInput) -> EngineResult<Booking> {
        let span = validate_window(&input.start_time, &input.end_time)?;
        let current = self.store.get_one_booking(id).await?;
        self.store.get_one_workspace(input.workspace_id).await?;
        self.store.get_one_user(input.user_id).await?;
        self.locked(&[current.workspace_id, input.workspace_id], move |engine| async move {
            engine.update_booking_locked(id, input, span).await
        })
        .await
    }

    async fn update_booking_locked(&self, id: Ulid, input: ReservationInput, span: Span) -> EngineResult<Booking> {
        let current = self.store.get_one_booking(id).await?;
        if current.cancelled {
            return Err(EngineError::InvalidOperation(format!("booking {id} is cancelled")));
        }
        self.store.get_one_workspace(input.workspace_id).await?;
        let mut timeline = self.store.workspace_timeline(input.workspace_id, span).await?;
        timeline.remove_interval(id);
        if let Err(e) = check_bookable(&timeline, &span) {
            metrics::counter!(BOOKINGS_REJECTED_TOTAL, "reason" => rejection_label(&e)).increment(1);
            return Err(e);
        }

        let booking = Booking {
            id,
            workspace_id: input.workspace_id,
            user_id: input.user_id,
            start_time: input.start_time,
            end_time: input.end_time,
            cancelled: false,
            created_by: input.created_by.unwrap_or(current.created_by),
        };
        self.store.update_booking(id, &booking).await?;
        Ok(booking)
    }

    // ── Offerings ────────────────────────────────────────────

    pub async fn create_offering(&self, input: ReservationInput) -> EngineResult<Offering> {
        let span = validate_window(&input.start_time, &input.end_time)?;
        self.store.get_one_workspace(input.workspace_id).await?;
        self.store.get_one_user(input.user_id).await?;
        self.locked(&[input.workspace_id], move |engine| async move {
            engine.create_offering_locked(input, span).await
        })
        .await
    }

    async fn create_offering_locked(&self, input: ReservationInput, span: Span) -> EngineResult<Offering> {
        self.store.get_one_workspace(input.workspace_id).await?;
        let timeline = self.store.workspace_timeline(input.workspace_id, span).await?;
        if let Err(e) = check_offerable(&timeline, input.user_id, &span) {
            metrics::counter!(OFFERINGS_REJECTED_TOTAL, "reason" => rejection_label(&e)).increment(1);
            return Err(e);
        }

        let offering = Offering {
            id: Ulid::new(),
            workspace_id: input.workspace_id,
            user_id: input.user_id,
            start_time: input.start_time,
            end_time: input.end_time,
            cancelled: false,
            created_by: input.created_by.unwrap_or(input.user_id),
        };
        self.store.create_offering(&offering).await?;
        metrics::counter!(OFFERINGS_CREATED_TOTAL).increment(1);
        Ok(offering)
    }

    /// Bookings already accepted against the offering stand.
    pub async fn cancel_offering(&self, id: Ulid) -> EngineResult<Offering> {
        let current = self.store.get_one_offering(id).await?;
        self.locked(&[current.workspace_id], move |engine| async move {
            let mut offering = engine.store.get_one_offering(id).await?;
            if offering.cancelled {
                return Ok(offering);
            }
            offering.cancelled = true;
            engine.store.update_offering(id, &offering).await?;
            Ok(offering)
        })
        .await
    }

    pub async fn update_offering(&self, id: Ulid, input: ReservationInput) -> EngineResult<Offering> {
        let span = validate_window(&input.start_time, &input.end_time)?;
        let current = self.store.get_one_offering(id).await?;
        self.store.get_one_workspace(input.workspace_id).await?;
        self.store.get_one_user(input.user_id).await?;
        self.locked(&[current.workspace_id, input.workspace_id], move |engine| async move {
            engine.update_offering_locked(id, input, span).await
        })
        .await
    }

    async fn update_offering_locked(&self, id: Ulid, input: ReservationInput, span: Span) -> EngineResult<Offering> {
        let current = self.store.get_one_offering(id).await?;
        if current.cancelled {
            return Err(EngineError::InvalidOperation(format!("offering {id} is cancelled")));
        }
        self.store.get_one_workspace(input.workspace_id).await?;
        let mut timeline = self.store.workspace_timeline(input.workspace_id, span).await?;
        timeline.remove_interval(id);
        if let Err(e) = check_offerable(&timeline, input.user_id, &span) {
            metrics::counter!(OFFERINGS_REJECTED_TOTAL, "reason" => rejection_label(&e)).increment(1);
            return Err(e);
        }

        let offering = Offering {
            id,
            workspace_id: input.workspace_id,
            user_id: input.user_id,
            start_time: input.start_time,
            end_time: input.end_time,
            cancelled: false,
            created_by: input.created_by.unwrap_or(current.created_by),
        };
        self.store.update_offering(id, &offering).await?;
        Ok(offering)
    }

    // ── Reaper ───────────────────────────────────────────────

    /// One expiry pass. Deletes in foreign-key order; an error aborts the
    /// pass and the next one starts over from fresh queries.
    pub async fn reap(&self, now: DateTime<Utc>) -> EngineResult<ReapReport> {
        let mut report = ReapReport::default();

        let ids: Vec<Ulid> = self.store.expired_bookings(now).await?.iter().map(|b| b.id).collect();
        report.bookings = self.store.delete_bookings(&ids).await?;
        metrics::counter!(REAPER_ROWS_REMOVED_TOTAL, "table" => "bookings").increment(report.bookings);

        let ids: Vec<Ulid> = self.store.expired_offerings(now).await?.iter().map(|o| o.id).collect();
        report.offerings = self.store.delete_offerings(&ids).await?;
        metrics::counter!(REAPER_ROWS_REMOVED_TOTAL, "table" => "offerings").increment(report.offerings);

        let ids: Vec<Ulid> = self.store.expired_assignments(now).await?.iter().map(|a| a.id).collect();
        report.assignments = self.store.delete_assignments(&ids).await?;
        metrics::counter!(REAPER_ROWS_REMOVED_TOTAL, "table" => "assignments").increment(report.assignments);

        let ids: Vec<Ulid> = self.store.deleted_workspaces().await?.iter().map(|w| w.id).collect();
        report.workspaces = self.store.delete_workspaces(&ids).await?;
        self.locks.forget(&ids);
        metrics::counter!(REAPER_ROWS_REMOVED_TOTAL, "table" => "workspaces").increment(report.workspaces);

        let ids: Vec<Ulid> = self.store.deleted_floors().await?.iter().map(|f| f.id).collect();
        report.floors = self.store.delete_floors(&ids).await?;
        metrics::counter!(REAPER_ROWS_REMOVED_TOTAL, "table" => "floors").increment(report.floors);

        Ok(report)
    }
}
