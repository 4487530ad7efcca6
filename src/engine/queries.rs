use chrono::{DateTime, Utc};
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;
use crate::store::RecordFilter;

use super::conflict::{validate_query_window, validate_window};
use super::{Engine, EngineResult};

/// Whether assignments touch / fully cover a window on one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AssignmentStatus {
    pub workspace_id: Ulid,
    pub assigned: bool,
    pub fully_assigned: bool,
}

impl Engine {
    pub async fn get_floor(&self, id: Ulid) -> EngineResult<Floor> {
        Ok(self.store.get_one_floor(id).await?)
    }

    pub async fn list_floors(&self) -> EngineResult<Vec<Floor>> {
        Ok(self.store.get_all_floors().await?)
    }

    pub async fn list_floor_ids(&self) -> EngineResult<Vec<Ulid>> {
        Ok(self.store.all_floor_ids().await?)
    }

    pub async fn get_workspace(&self, id: Ulid) -> EngineResult<Workspace> {
        Ok(self.store.get_one_workspace(id).await?)
    }

    /// All live workspaces, or only those of one live floor.
    pub async fn list_workspaces(&self, floor_id: Option<Ulid>) -> EngineResult<Vec<Workspace>> {
        match floor_id {
            Some(floor_id) => {
                self.store.get_one_floor(floor_id).await?;
                Ok(self.store.workspaces_by_floor(floor_id).await?)
            }
            None => Ok(self.store.get_all_workspaces().await?),
        }
    }

    /// Workspaces on the floor an arbitrary user could book for the whole window.
    pub async fn available_workspaces(
        &self,
        floor_id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Ulid>> {
        let span = validate_query_window(&start, &end)?;
        self.store.get_one_floor(floor_id).await?;
        Ok(self.store.available_workspaces(floor_id, span).await?)
    }

    pub async fn assignment_status(
        &self,
        workspace_id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<AssignmentStatus> {
        let span = validate_query_window(&start, &end)?;
        self.store.get_one_workspace(workspace_id).await?;
        let assigned = self.store.is_assigned(workspace_id, span).await?;
        let fully_assigned = assigned && self.store.is_fully_assigned(workspace_id, span).await?;
        Ok(AssignmentStatus { workspace_id, assigned, fully_assigned })
    }

    pub async fn get_user(&self, id: Ulid) -> EngineResult<User> {
        Ok(self.store.get_one_user(id).await?)
    }

    pub async fn list_users(&self) -> EngineResult<Vec<User>> {
        Ok(self.store.get_all_users().await?)
    }

    pub async fn assigned_users_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<UserAssignment>> {
        let span = validate_window(&start, &end)?;
        Ok(self.store.assigned_users_in_range(span).await?)
    }

    pub async fn assigned_users_at(&self, t: DateTime<Utc>) -> EngineResult<Vec<UserAssignment>> {
        Ok(self.store.assigned_users_at(t).await?)
    }

    pub async fn list_assignments(&self, filter: RecordFilter) -> EngineResult<Vec<Assignment>> {
        Ok(self.store.assignments(filter).await?)
    }

    pub async fn get_booking(&self, id: Ulid) -> EngineResult<Booking> {
        Ok(self.store.get_one_booking(id).await?)
    }

    pub async fn get_expanded_booking(&self, id: Ulid) -> EngineResult<ExpandedBooking> {
        Ok(self.store.get_one_expanded_booking(id).await?)
    }

    pub async fn list_bookings(&self, filter: RecordFilter) -> EngineResult<Vec<Booking>> {
        Ok(self.store.bookings(filter).await?)
    }

    pub async fn list_expanded_bookings(&self, filter: RecordFilter) -> EngineResult<Vec<ExpandedBooking>> {
        Ok(self.store.expanded_bookings(filter).await?)
    }

    pub async fn get_offering(&self, id: Ulid) -> EngineResult<Offering> {
        Ok(self.store.get_one_offering(id).await?)
    }

    pub async fn get_expanded_offering(&self, id: Ulid) -> EngineResult<ExpandedOffering> {
        Ok(self.store.get_one_expanded_offering(id).await?)
    }

    pub async fn list_offerings(&self, filter: RecordFilter) -> EngineResult<Vec<Offering>> {
        Ok(self.store.offerings(filter).await?)
    }

    pub async fn list_expanded_offerings(&self, filter: RecordFilter) -> EngineResult<Vec<ExpandedOffering>> {
        Ok(self.store.expanded_offerings(filter).await?)
    }

    /// The live offering on a workspace covering the whole window.
    pub async fn offering_covering(
        &self,
        workspace_id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Offering> {
        let span = validate_window(&start, &end)?;
        Ok(self.store.offering_covering(workspace_id, span).await?)
    }
}
