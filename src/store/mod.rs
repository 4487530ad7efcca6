//! Entity store: the capability traits the engine is written against, and
//! the two bindings behind them.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::engine::availability::is_available;
use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },
    #[error("empty result: {0}")]
    Empty(&'static str),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("storage fault: {0}")]
    Fault(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: Ulid) -> Self {
        StoreError::NotFound { entity, id }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::Empty("no rows returned"),
            other => StoreError::Fault(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Selects which bookings, offerings or assignments a list query returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordFilter {
    #[default]
    All,
    Workspace(Ulid),
    User(Ulid),
    /// Records whose `[start_time, end_time)` overlaps the span.
    Range(Span),
}

impl RecordFilter {
    pub fn matches(&self, workspace_id: Ulid, user_id: Ulid, span: &Span) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::Workspace(id) => *id == workspace_id,
            RecordFilter::User(id) => *id == user_id,
            RecordFilter::Range(range) => range.overlaps(span),
        }
    }
}

#[async_trait]
pub trait FloorProvider: Send + Sync {
    async fn get_one_floor(&self, id: Ulid) -> StoreResult<Floor>;
    async fn get_all_floors(&self) -> StoreResult<Vec<Floor>>;
    /// Ids of the live floors, ascending.
    async fn all_floor_ids(&self) -> StoreResult<Vec<Ulid>>;
    async fn create_floor(&self, floor: &Floor) -> StoreResult<Ulid>;
    /// Soft delete. Fails with `InvalidOperation` while live workspaces
    /// reference the floor unless `force`, which soft-deletes them too.
    async fn remove_floor(&self, id: Ulid, force: bool) -> StoreResult<()>;
    async fn deleted_floors(&self) -> StoreResult<Vec<Floor>>;
    async fn delete_floors(&self, ids: &[Ulid]) -> StoreResult<u64>;
}

#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn get_one_workspace(&self, id: Ulid) -> StoreResult<Workspace>;
    async fn get_all_workspaces(&self) -> StoreResult<Vec<Workspace>>;
    async fn workspaces_by_floor(&self, floor_id: Ulid) -> StoreResult<Vec<Workspace>>;
    async fn count_workspaces_by_floor(&self, floor_id: Ulid) -> StoreResult<u64>;
    async fn create_workspace(&self, workspace: &Workspace) -> StoreResult<Ulid>;
    /// Create or overwrite by id; true when the row was created. A removed
    /// workspace is not brought back: `InvalidOperation`.
    async fn upsert_workspace(&self, workspace: &Workspace) -> StoreResult<bool>;
    /// A workspace, its first assignment and optionally the baseline offering, all or nothing.
    async fn create_assigned_workspace(
        &self,
        workspace: &Workspace,
        assignment: &Assignment,
        baseline: Option<&Offering>,
    ) -> StoreResult<()>;
    async fn update_workspace(&self, id: Ulid, workspace: &Workspace) -> StoreResult<()>;
    async fn update_workspace_properties(&self, id: Ulid, properties: &Properties) -> StoreResult<()>;
    /// Soft delete.
    async fn remove_workspace(&self, id: Ulid) -> StoreResult<()>;
    async fn deleted_workspaces(&self) -> StoreResult<Vec<Workspace>>;
    /// Hard delete; cascades to the workspaces' bookings, offerings and assignments.
    async fn delete_workspaces(&self, ids: &[Ulid]) -> StoreResult<u64>;

    /// Live bookings, live offerings and assignments on one workspace overlapping `span`.
    async fn workspace_timeline(&self, workspace_id: Ulid, span: Span) -> StoreResult<Timeline>;
    /// One timeline per live workspace on the floor, restricted to `span`.
    async fn floor_timelines(&self, floor_id: Ulid, span: Span) -> StoreResult<Vec<Timeline>>;

    /// Workspaces on the floor reservable by an arbitrary user for all of `span`.
    async fn available_workspaces(&self, floor_id: Ulid, span: Span) -> StoreResult<Vec<Ulid>> {
        let timelines = self.floor_timelines(floor_id, span).await?;
        Ok(timelines
            .iter()
            .filter(|t| is_available(t, &span))
            .map(|t| t.workspace_id)
            .collect())
    }
}

#[async_trait]
pub trait UserProvider: Send + Sync {
    async fn get_one_user(&self, id: Ulid) -> StoreResult<User>;
    async fn get_all_users(&self) -> StoreResult<Vec<User>>;
    async fn create_user(&self, user: &User) -> StoreResult<Ulid>;
    async fn assigned_users_in_range(&self, span: Span) -> StoreResult<Vec<UserAssignment>>;
    async fn assigned_users_at(&self, t: DateTime<Utc>) -> StoreResult<Vec<UserAssignment>>;
}

#[async_trait]
pub trait BookingProvider: Send + Sync {
    async fn get_one_booking(&self, id: Ulid) -> StoreResult<Booking>;
    async fn get_one_expanded_booking(&self, id: Ulid) -> StoreResult<ExpandedBooking>;
    async fn bookings(&self, filter: RecordFilter) -> StoreResult<Vec<Booking>>;
    async fn expanded_bookings(&self, filter: RecordFilter) -> StoreResult<Vec<ExpandedBooking>>;
    async fn create_booking(&self, booking: &Booking) -> StoreResult<Ulid>;
    async fn update_booking(&self, id: Ulid, booking: &Booking) -> StoreResult<()>;
    /// Hard delete of one booking, cancelled or not.
    async fn remove_booking(&self, id: Ulid) -> StoreResult<()>;
    /// Bookings with `end_time < since`.
    async fn expired_bookings(&self, since: DateTime<Utc>) -> StoreResult<Vec<Booking>>;
    async fn delete_bookings(&self, ids: &[Ulid]) -> StoreResult<u64>;
}

#[async_trait]
pub trait OfferingProvider: Send + Sync {
    async fn get_one_offering(&self, id: Ulid) -> StoreResult<Offering>;
    async fn get_one_expanded_offering(&self, id: Ulid) -> StoreResult<ExpandedOffering>;
    async fn offerings(&self, filter: RecordFilter) -> StoreResult<Vec<Offering>>;
    async fn expanded_offerings(&self, filter: RecordFilter) -> StoreResult<Vec<ExpandedOffering>>;
    /// The live offering on the workspace whose span covers `span`.
    async fn offering_covering(&self, workspace_id: Ulid, span: Span) -> StoreResult<Offering>;
    async fn create_offering(&self, offering: &Offering) -> StoreResult<Ulid>;
    async fn update_offering(&self, id: Ulid, offering: &Offering) -> StoreResult<()>;
    /// Hard delete of one offering. Bookings it admitted are kept.
    async fn remove_offering(&self, id: Ulid) -> StoreResult<()>;
    /// Offerings with `end_time < since`.
    async fn expired_offerings(&self, since: DateTime<Utc>) -> StoreResult<Vec<Offering>>;
    async fn delete_offerings(&self, ids: &[Ulid]) -> StoreResult<u64>;
}

#[async_trait]
pub trait AssigneeProvider: Send + Sync {
    /// With `baseline`, the offering is written in the same commit.
    async fn create_assignment(&self, assignment: &Assignment, baseline: Option<&Offering>) -> StoreResult<Ulid>;
    async fn assignments(&self, filter: RecordFilter) -> StoreResult<Vec<Assignment>>;
    /// True iff an assignment on the workspace intersects `span`.
    async fn is_assigned(&self, workspace_id: Ulid, span: Span) -> StoreResult<bool>;
    /// True iff assignments on the workspace cover every instant of `span`.
    async fn is_fully_assigned(&self, workspace_id: Ulid, span: Span) -> StoreResult<bool>;
    /// Assignments with `end_time < since`.
    async fn expired_assignments(&self, since: DateTime<Utc>) -> StoreResult<Vec<Assignment>>;
    async fn delete_assignments(&self, ids: &[Ulid]) -> StoreResult<u64>;
}

#[async_trait]
pub trait Closable: Send + Sync {
    async fn close(&self);
}

/// The full capability set the engine needs from a storage binding.
pub trait Store:
    FloorProvider
    + WorkspaceProvider
    + UserProvider
    + BookingProvider
    + OfferingProvider
    + AssigneeProvider
    + Closable
{
}

impl<T> Store for T where
    T: FloorProvider
        + WorkspaceProvider
        + UserProvider
        + BookingProvider
        + OfferingProvider
        + AssigneeProvider
        + Closable
{
}

/// Merged assignment spans for coverage checks.
pub(crate) fn fully_covered(assigned: &mut Vec<Span>, span: &Span) -> bool {
    use crate::engine::availability::{merge_overlapping, subtract_intervals};
    assigned.sort_by_key(|s| s.start);
    let merged = merge_overlapping(assigned);
    subtract_intervals(&[*span], &merged).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_filter_range_is_overlap() {
        let ws = Ulid::new();
        let user = Ulid::new();
        let filter = RecordFilter::Range(Span::new(100, 200));
        assert!(filter.matches(ws, user, &Span::new(150, 250)));
        assert!(!filter.matches(ws, user, &Span::new(200, 300)));
        assert!(RecordFilter::Workspace(ws).matches(ws, Ulid::new(), &Span::new(0, 1)));
        assert!(!RecordFilter::User(user).matches(ws, Ulid::new(), &Span::new(0, 1)));
    }

    #[test]
    fn coverage_merges_back_to_back_assignments() {
        let mut assigned = vec![Span::new(200, 300), Span::new(100, 200)];
        assert!(fully_covered(&mut assigned, &Span::new(120, 280)));
        let mut gapped = vec![Span::new(100, 150), Span::new(160, 300)];
        assert!(!fully_covered(&mut gapped, &Span::new(120, 280)));
    }
}
