use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type the interval logic sees.
pub type Ms = i64;

/// Free-form workspace properties. Stored as JSON, never interpreted.
pub type Properties = serde_json::Map<String, serde_json::Value>;

pub fn to_ms(t: &DateTime<Utc>) -> Ms {
    t.timestamp_millis()
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn from_times(start: &DateTime<Utc>, end: &DateTime<Utc>) -> Option<Self> {
        Self::checked(to_ms(start), to_ms(end))
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn clamp_to(&self, window: &Span) -> Span {
        Span::new(self.start.max(window.start), self.end.min(window.end))
    }
}

/// What an interval on a workspace timeline represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalKind {
    /// A live booking. Blocks the workspace outright.
    Booking,
    /// A live offering: the assignee `user_id` releases the workspace.
    Offering { user_id: Ulid },
    /// Long-term ownership by `user_id`.
    Assignment { user_id: Ulid },
}

/// A single interval on a workspace. Bookings, offerings and assignments are all just intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    pub fn booking(id: Ulid, span: Span) -> Self {
        Self { id, span, kind: IntervalKind::Booking }
    }

    pub fn offering(id: Ulid, span: Span, user_id: Ulid) -> Self {
        Self { id, span, kind: IntervalKind::Offering { user_id } }
    }

    pub fn assignment(id: Ulid, span: Span, user_id: Ulid) -> Self {
        Self { id, span, kind: IntervalKind::Assignment { user_id } }
    }

    pub fn is_booking(&self) -> bool {
        matches!(self.kind, IntervalKind::Booking)
    }
}

/// Every live interval of one workspace, sorted by `span.start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeline {
    pub workspace_id: Ulid,
    pub intervals: Vec<Interval>,
}

impl Timeline {
    pub fn new(workspace_id: Ulid) -> Self {
        Self {
            workspace_id,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    /// Copy of this timeline restricted to intervals overlapping `query`.
    pub fn window(&self, query: &Span) -> Timeline {
        Timeline {
            workspace_id: self.workspace_id,
            intervals: self.overlapping(query).cloned().collect(),
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Floor {
    pub id: Ulid,
    pub name: String,
    pub download_url: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Ulid,
    pub name: String,
    pub floor_id: Ulid,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    #[serde(default)]
    pub department: String,
    pub email: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Ulid,
    pub workspace_id: Ulid,
    pub user_id: Ulid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl Assignment {
    pub fn span(&self) -> Span {
        Span::new(to_ms(&self.start_time), to_ms(&self.end_time))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub workspace_id: Ulid,
    pub user_id: Ulid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub cancelled: bool,
    pub created_by: Ulid,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(to_ms(&self.start_time), to_ms(&self.end_time))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offering {
    pub id: Ulid,
    pub workspace_id: Ulid,
    pub user_id: Ulid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub cancelled: bool,
    pub created_by: Ulid,
}

impl Offering {
    pub fn span(&self) -> Span {
        Span::new(to_ms(&self.start_time), to_ms(&self.end_time))
    }
}

/// Read-only join of a booking with its workspace, floor and user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandedBooking {
    #[serde(flatten)]
    pub booking: Booking,
    pub workspace_name: String,
    pub user_name: String,
    pub floor_id: Ulid,
    pub floor_name: String,
}

/// Read-only join of an offering with its workspace, floor and user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandedOffering {
    #[serde(flatten)]
    pub offering: Offering,
    pub workspace_name: String,
    pub user_name: String,
    pub floor_id: Ulid,
    pub floor_name: String,
}

/// A user together with one assignment they hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAssignment {
    #[serde(flatten)]
    pub user: User,
    pub assignment_id: Ulid,
    pub workspace_id: Ulid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFloor {
    pub name: String,
    pub address: String,
    pub download_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInput {
    pub name: String,
    pub floor_id: Ulid,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub properties: Properties,
}

/// Body of a booking or offering create/update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationInput {
    pub workspace_id: Ulid,
    pub user_id: Ulid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Defaults to `user_id`.
    #[serde(default)]
    pub created_by: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentInput {
    pub workspace_id: Ulid,
    pub user_id: Ulid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub offer_by_default: bool,
}

/// A new workspace together with its first assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedWorkspaceInput {
    #[serde(flatten)]
    pub workspace: WorkspaceInput,
    pub user_id: Ulid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub offer_by_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignedWorkspace {
    pub workspace: Workspace,
    pub assignment: Assignment,
    pub offering: Option<Offering>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFloor {
    #[serde(default)]
    pub force_delete: bool,
}

/// The event types. This is the WAL record format. `Batch` is the only
/// nesting: its events are logged as one frame and applied together.
///
/// Workspace properties travel as JSON text: bincode cannot decode
/// self-describing values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FloorCreated {
        floor: Floor,
    },
    FloorRemoved {
        id: Ulid,
        force: bool,
        at: DateTime<Utc>,
    },
    FloorsDeleted {
        ids: Vec<Ulid>,
    },
    WorkspaceSaved {
        id: Ulid,
        name: String,
        floor_id: Ulid,
        details: String,
        properties: String,
    },
    WorkspacePropertiesUpdated {
        id: Ulid,
        properties: String,
    },
    WorkspaceRemoved {
        id: Ulid,
        at: DateTime<Utc>,
    },
    WorkspacesDeleted {
        ids: Vec<Ulid>,
    },
    UserCreated {
        user: User,
    },
    AssignmentCreated {
        assignment: Assignment,
    },
    AssignmentsDeleted {
        ids: Vec<Ulid>,
    },
    BookingSaved {
        booking: Booking,
    },
    BookingsDeleted {
        ids: Vec<Ulid>,
    },
    OfferingSaved {
        offering: Offering,
    },
    OfferingsDeleted {
        ids: Vec<Ulid>,
    },
    Batch {
        events: Vec<Event>,
    },
}
