//! Relational binding over a `sqlx` Postgres pool.
//!
//! Ids are stored as ULID text so lexical order matches creation order.
//! Floors and workspaces carry `deleted_at`; everything below a workspace
//! cascades on hard delete.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgExecutor, PgPool};
use ulid::Ulid;

use super::*;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS floors (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        download_url TEXT NOT NULL,
        address TEXT NOT NULL,
        deleted_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS workspaces (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        floor_id TEXT NOT NULL REFERENCES floors(id) ON DELETE CASCADE,
        details TEXT NOT NULL DEFAULT '',
        properties JSONB NOT NULL DEFAULT '{}'::jsonb,
        deleted_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS workspaces_floor_idx ON workspaces (floor_id)",
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        department TEXT NOT NULL DEFAULT '',
        email TEXT NOT NULL,
        is_admin BOOLEAN NOT NULL DEFAULT FALSE
    )",
    "CREATE TABLE IF NOT EXISTS assignments (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ NOT NULL,
        CHECK (start_time < end_time)
    )",
    "CREATE INDEX IF NOT EXISTS assignments_workspace_idx ON assignments (workspace_id, start_time)",
    "CREATE TABLE IF NOT EXISTS bookings (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ NOT NULL,
        cancelled BOOLEAN NOT NULL DEFAULT FALSE,
        created_by TEXT NOT NULL,
        CHECK (start_time < end_time)
    )",
    "CREATE INDEX IF NOT EXISTS bookings_workspace_idx ON bookings (workspace_id, start_time)",
    "CREATE INDEX IF NOT EXISTS bookings_user_idx ON bookings (user_id)",
    "CREATE INDEX IF NOT EXISTS bookings_end_idx ON bookings (end_time)",
    "CREATE TABLE IF NOT EXISTS offerings (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ NOT NULL,
        cancelled BOOLEAN NOT NULL DEFAULT FALSE,
        created_by TEXT NOT NULL,
        CHECK (start_time < end_time)
    )",
    "CREATE INDEX IF NOT EXISTS offerings_workspace_idx ON offerings (workspace_id, start_time)",
    "CREATE INDEX IF NOT EXISTS offerings_user_idx ON offerings (user_id)",
    "CREATE INDEX IF NOT EXISTS offerings_end_idx ON offerings (end_time)",
];

/// Bookings and offerings share one table shape.
#[derive(Clone, Copy)]
enum Reservations {
    Bookings,
    Offerings,
}

impl Reservations {
    fn table(self) -> &'static str {
        match self {
            Reservations::Bookings => "bookings",
            Reservations::Offerings => "offerings",
        }
    }

    fn entity(self) -> &'static str {
        match self {
            Reservations::Bookings => "booking",
            Reservations::Offerings => "offering",
        }
    }
}

// ── Rows ─────────────────────────────────────────────────────────

fn parse_id(raw: &str) -> StoreResult<Ulid> {
    Ulid::from_string(raw).map_err(|e| StoreError::Fault(format!("malformed id {raw:?}: {e}")))
}

fn from_ms(ms: Ms) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Fault(format!("timestamp out of range: {ms}")))
}

#[derive(Debug, FromRow)]
struct FloorRow {
    id: String,
    name: String,
    download_url: String,
    address: String,
}

impl TryFrom<FloorRow> for Floor {
    type Error = StoreError;

    fn try_from(row: FloorRow) -> StoreResult<Self> {
        Ok(Floor {
            id: parse_id(&row.id)?,
            name: row.name,
            download_url: row.download_url,
            address: row.address,
        })
    }
}

#[derive(Debug, FromRow)]
struct WorkspaceRow {
    id: String,
    name: String,
    floor_id: String,
    details: String,
    properties: Json<Properties>,
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = StoreError;

    fn try_from(row: WorkspaceRow) -> StoreResult<Self> {
        Ok(Workspace {
            id: parse_id(&row.id)?,
            name: row.name,
            floor_id: parse_id(&row.floor_id)?,
            details: row.details,
            properties: row.properties.0,
        })
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    name: String,
    department: String,
    email: String,
    is_admin: bool,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> StoreResult<Self> {
        Ok(User {
            id: parse_id(&row.id)?,
            name: row.name,
            department: row.department,
            email: row.email,
            is_admin: row.is_admin,
        })
    }
}

#[derive(Debug, FromRow)]
struct AssignmentRow {
    id: String,
    workspace_id: String,
    user_id: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl TryFrom<AssignmentRow> for Assignment {
    type Error = StoreError;

    fn try_from(row: AssignmentRow) -> StoreResult<Self> {
        Ok(Assignment {
            id: parse_id(&row.id)?,
            workspace_id: parse_id(&row.workspace_id)?,
            user_id: parse_id(&row.user_id)?,
            start_time: row.start_time,
            end_time: row.end_time,
        })
    }
}

#[derive(Debug, FromRow)]
struct ReservationRow {
    id: String,
    workspace_id: String,
    user_id: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    cancelled: bool,
    created_by: String,
}

impl TryFrom<ReservationRow> for Booking {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> StoreResult<Self> {
        Ok(Booking {
            id: parse_id(&row.id)?,
            workspace_id: parse_id(&row.workspace_id)?,
            user_id: parse_id(&row.user_id)?,
            start_time: row.start_time,
            end_time: row.end_time,
            cancelled: row.cancelled,
            created_by: parse_id(&row.created_by)?,
        })
    }
}

impl TryFrom<ReservationRow> for Offering {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> StoreResult<Self> {
        Ok(Offering {
            id: parse_id(&row.id)?,
            workspace_id: parse_id(&row.workspace_id)?,
            user_id: parse_id(&row.user_id)?,
            start_time: row.start_time,
            end_time: row.end_time,
            cancelled: row.cancelled,
            created_by: parse_id(&row.created_by)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct ExpandedRow {
    #[sqlx(flatten)]
    record: ReservationRow,
    workspace_name: String,
    user_name: String,
    floor_id: String,
    floor_name: String,
}

impl TryFrom<ExpandedRow> for ExpandedBooking {
    type Error = StoreError;

    fn try_from(row: ExpandedRow) -> StoreResult<Self> {
        Ok(ExpandedBooking {
            booking: row.record.try_into()?,
            workspace_name: row.workspace_name,
            user_name: row.user_name,
            floor_id: parse_id(&row.floor_id)?,
            floor_name: row.floor_name,
        })
    }
}

impl TryFrom<ExpandedRow> for ExpandedOffering {
    type Error = StoreError;

    fn try_from(row: ExpandedRow) -> StoreResult<Self> {
        Ok(ExpandedOffering {
            offering: row.record.try_into()?,
            workspace_name: row.workspace_name,
            user_name: row.user_name,
            floor_id: parse_id(&row.floor_id)?,
            floor_name: row.floor_name,
        })
    }
}

#[derive(Debug, FromRow)]
struct UserAssignmentRow {
    #[sqlx(flatten)]
    user: UserRow,
    assignment_id: String,
    workspace_id: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl TryFrom<UserAssignmentRow> for UserAssignment {
    type Error = StoreError;

    fn try_from(row: UserAssignmentRow) -> StoreResult<Self> {
        Ok(UserAssignment {
            user: row.user.try_into()?,
            assignment_id: parse_id(&row.assignment_id)?,
            workspace_id: parse_id(&row.workspace_id)?,
            start_time: row.start_time,
            end_time: row.end_time,
        })
    }
}

#[derive(Debug, FromRow)]
struct TimelineRow {
    workspace_id: String,
    id: String,
    kind: String,
    user_id: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl TimelineRow {
    fn into_interval(self) -> StoreResult<(Ulid, Interval)> {
        let id = parse_id(&self.id)?;
        let span = Span::new(to_ms(&self.start_time), to_ms(&self.end_time));
        let user_id = parse_id(&self.user_id)?;
        let interval = match self.kind.as_str() {
            "booking" => Interval::booking(id, span),
            "offering" => Interval::offering(id, span, user_id),
            "assignment" => Interval::assignment(id, span, user_id),
            other => return Err(StoreError::Fault(format!("unknown interval kind {other:?}"))),
        };
        Ok((parse_id(&self.workspace_id)?, interval))
    }
}

fn convert<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn ids_of(ids: &[Ulid]) -> Vec<String> {
    ids.iter().map(Ulid::to_string).collect()
}

// ── Filters ──────────────────────────────────────────────────────

/// `RecordFilter` as four nullable binds (`$1..$4`) against a table alias.
struct FilterBinds {
    workspace_id: Option<String>,
    user_id: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl FilterBinds {
    fn new(filter: RecordFilter) -> StoreResult<Self> {
        let mut binds = FilterBinds { workspace_id: None, user_id: None, start: None, end: None };
        match filter {
            RecordFilter::All => {}
            RecordFilter::Workspace(id) => binds.workspace_id = Some(id.to_string()),
            RecordFilter::User(id) => binds.user_id = Some(id.to_string()),
            RecordFilter::Range(span) => {
                binds.start = Some(from_ms(span.start)?);
                binds.end = Some(from_ms(span.end)?);
            }
        }
        Ok(binds)
    }

    fn clause(alias: &str) -> String {
        format!(
            "($1::text IS NULL OR {alias}.workspace_id = $1) \
             AND ($2::text IS NULL OR {alias}.user_id = $2) \
             AND ($3::timestamptz IS NULL OR ({alias}.start_time < $4 AND {alias}.end_time > $3))"
        )
    }
}

const RESERVATION_COLUMNS: &str =
    "r.id, r.workspace_id, r.user_id, r.start_time, r.end_time, r.cancelled, r.created_by";

// ── Inserts shared by single writes and transactions ────────────

async fn insert_reservation<'e>(conn: impl PgExecutor<'e>, kind: Reservations, row: ReservationRow) -> StoreResult<()> {
    let sql = format!(
        "INSERT INTO {} (id, workspace_id, user_id, start_time, end_time, cancelled, created_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
        kind.table()
    );
    sqlx::query(&sql)
        .bind(row.id)
        .bind(row.workspace_id)
        .bind(row.user_id)
        .bind(row.start_time)
        .bind(row.end_time)
        .bind(row.cancelled)
        .bind(row.created_by)
        .execute(conn)
        .await?;
    Ok(())
}

async fn insert_assignment<'e>(conn: impl PgExecutor<'e>, assignment: &Assignment) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO assignments (id, workspace_id, user_id, start_time, end_time) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(assignment.id.to_string())
    .bind(assignment.workspace_id.to_string())
    .bind(assignment.user_id.to_string())
    .bind(assignment.start_time)
    .bind(assignment.end_time)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_workspace<'e>(conn: impl PgExecutor<'e>, workspace: &Workspace) -> StoreResult<()> {
    sqlx::query("INSERT INTO workspaces (id, name, floor_id, details, properties) VALUES ($1, $2, $3, $4, $5)")
        .bind(workspace.id.to_string())
        .bind(&workspace.name)
        .bind(workspace.floor_id.to_string())
        .bind(&workspace.details)
        .bind(Json(&workspace.properties))
        .execute(conn)
        .await?;
    Ok(())
}

// ── Store ────────────────────────────────────────────────────────

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and create the schema if it is missing.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(max_connections, "connected to postgres");
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn reservation(&self, kind: Reservations, id: Ulid) -> StoreResult<ReservationRow> {
        let sql = format!("SELECT {RESERVATION_COLUMNS} FROM {} r WHERE r.id = $1", kind.table());
        sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::not_found(kind.entity(), id))
    }

    async fn reservations(&self, kind: Reservations, filter: RecordFilter) -> StoreResult<Vec<ReservationRow>> {
        let binds = FilterBinds::new(filter)?;
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM {} r WHERE {} ORDER BY r.start_time, r.id",
            kind.table(),
            FilterBinds::clause("r"),
        );
        Ok(sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(binds.workspace_id)
            .bind(binds.user_id)
            .bind(binds.start)
            .bind(binds.end)
            .fetch_all(&self.pool)
            .await?)
    }

    fn expanded_sql(kind: Reservations, predicate: &str) -> String {
        format!(
            "SELECT {RESERVATION_COLUMNS}, w.name AS workspace_name, u.name AS user_name, \
                    f.id AS floor_id, f.name AS floor_name \
             FROM {} r \
             JOIN workspaces w ON w.id = r.workspace_id \
             JOIN floors f ON f.id = w.floor_id \
             JOIN users u ON u.id = r.user_id \
             WHERE {predicate} \
             ORDER BY r.start_time, r.id",
            kind.table()
        )
    }

    async fn expanded(&self, kind: Reservations, id: Ulid) -> StoreResult<ExpandedRow> {
        let sql = Self::expanded_sql(kind, "r.id = $1");
        sqlx::query_as::<_, ExpandedRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::not_found(kind.entity(), id))
    }

    async fn expanded_list(&self, kind: Reservations, filter: RecordFilter) -> StoreResult<Vec<ExpandedRow>> {
        let binds = FilterBinds::new(filter)?;
        let sql = Self::expanded_sql(kind, &FilterBinds::clause("r"));
        Ok(sqlx::query_as::<_, ExpandedRow>(&sql)
            .bind(binds.workspace_id)
            .bind(binds.user_id)
            .bind(binds.start)
            .bind(binds.end)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn update_reservation(&self, kind: Reservations, id: Ulid, row: ReservationRow) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET workspace_id = $2, user_id = $3, start_time = $4, end_time = $5, \
             cancelled = $6, created_by = $7 WHERE id = $1",
            kind.table()
        );
        let done = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(row.workspace_id)
            .bind(row.user_id)
            .bind(row.start_time)
            .bind(row.end_time)
            .bind(row.cancelled)
            .bind(row.created_by)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found(kind.entity(), id));
        }
        Ok(())
    }

    async fn delete_by_ids(&self, table: &str, ids: &[Ulid]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {table} WHERE id = ANY($1)");
        let done = sqlx::query(&sql).bind(ids_of(ids)).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn remove_by_id(&self, kind: Reservations, id: Ulid) -> StoreResult<()> {
        match self.delete_by_ids(kind.table(), &[id]).await? {
            0 => Err(StoreError::not_found(kind.entity(), id)),
            _ => Ok(()),
        }
    }

    async fn expired(&self, kind: Reservations, since: DateTime<Utc>) -> StoreResult<Vec<ReservationRow>> {
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM {} r WHERE r.end_time < $1 ORDER BY r.start_time, r.id",
            kind.table()
        );
        Ok(sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Live intervals of the workspaces matching `scope` (`$1`) overlapping `[$2, $3)`.
    async fn timeline_rows(&self, scope: &str, key: String, span: Span) -> StoreResult<Vec<TimelineRow>> {
        let sql = format!(
            "SELECT r.workspace_id, r.id, 'booking' AS kind, r.user_id, r.start_time, r.end_time \
               FROM bookings r JOIN workspaces w ON w.id = r.workspace_id \
              WHERE {scope} AND NOT r.cancelled AND r.start_time < $3 AND r.end_time > $2 \
             UNION ALL \
             SELECT r.workspace_id, r.id, 'offering' AS kind, r.user_id, r.start_time, r.end_time \
               FROM offerings r JOIN workspaces w ON w.id = r.workspace_id \
              WHERE {scope} AND NOT r.cancelled AND r.start_time < $3 AND r.end_time > $2 \
             UNION ALL \
             SELECT r.workspace_id, r.id, 'assignment' AS kind, r.user_id, r.start_time, r.end_time \
               FROM assignments r JOIN workspaces w ON w.id = r.workspace_id \
              WHERE {scope} AND r.start_time < $3 AND r.end_time > $2"
        );
        Ok(sqlx::query_as::<_, TimelineRow>(&sql)
            .bind(key)
            .bind(from_ms(span.start)?)
            .bind(from_ms(span.end)?)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn user_assignments(&self, predicate: &str, a: DateTime<Utc>, b: DateTime<Utc>) -> StoreResult<Vec<UserAssignment>> {
        let sql = format!(
            "SELECT u.id, u.name, u.department, u.email, u.is_admin, \
                    a.id AS assignment_id, a.workspace_id, a.start_time, a.end_time \
               FROM assignments a JOIN users u ON u.id = a.user_id \
              WHERE {predicate} \
              ORDER BY a.start_time, a.id"
        );
        let rows = sqlx::query_as::<_, UserAssignmentRow>(&sql)
            .bind(a)
            .bind(b)
            .fetch_all(&self.pool)
            .await?;
        convert(rows)
    }
}

fn reservation_row(
    id: Ulid,
    workspace_id: Ulid,
    user_id: Ulid,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    cancelled: bool,
    created_by: Ulid,
) -> ReservationRow {
    ReservationRow {
        id: id.to_string(),
        workspace_id: workspace_id.to_string(),
        user_id: user_id.to_string(),
        start_time,
        end_time,
        cancelled,
        created_by: created_by.to_string(),
    }
}

impl From<&Booking> for ReservationRow {
    fn from(b: &Booking) -> Self {
        reservation_row(b.id, b.workspace_id, b.user_id, b.start_time, b.end_time, b.cancelled, b.created_by)
    }
}

impl From<&Offering> for ReservationRow {
    fn from(o: &Offering) -> Self {
        reservation_row(o.id, o.workspace_id, o.user_id, o.start_time, o.end_time, o.cancelled, o.created_by)
    }
}

const FLOOR_COLUMNS: &str = "id, name, download_url, address";
const WORKSPACE_COLUMNS: &str = "id, name, floor_id, details, properties";

#[async_trait]
impl FloorProvider for PgStore {
    async fn get_one_floor(&self, id: Ulid) -> StoreResult<Floor> {
        let sql = format!("SELECT {FLOOR_COLUMNS} FROM floors WHERE id = $1 AND deleted_at IS NULL");
        sqlx::query_as::<_, FloorRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::not_found("floor", id))?
            .try_into()
    }

    async fn get_all_floors(&self) -> StoreResult<Vec<Floor>> {
        let sql = format!("SELECT {FLOOR_COLUMNS} FROM floors WHERE deleted_at IS NULL ORDER BY id");
        convert(sqlx::query_as::<_, FloorRow>(&sql).fetch_all(&self.pool).await?)
    }

    async fn all_floor_ids(&self) -> StoreResult<Vec<Ulid>> {
        let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM floors WHERE deleted_at IS NULL ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        ids.into_iter().map(|(id,)| parse_id(&id)).collect()
    }

    async fn create_floor(&self, floor: &Floor) -> StoreResult<Ulid> {
        sqlx::query("INSERT INTO floors (id, name, download_url, address) VALUES ($1, $2, $3, $4)")
            .bind(floor.id.to_string())
            .bind(&floor.name)
            .bind(&floor.download_url)
            .bind(&floor.address)
            .execute(&self.pool)
            .await?;
        Ok(floor.id)
    }

    async fn remove_floor(&self, id: Ulid, force: bool) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let live_floor: Option<(String,)> =
            sqlx::query_as("SELECT id FROM floors WHERE id = $1 AND deleted_at IS NULL FOR UPDATE")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        if live_floor.is_none() {
            return Err(StoreError::not_found("floor", id));
        }
        let (live,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workspaces WHERE floor_id = $1 AND deleted_at IS NULL")
                .bind(id.to_string())
                .fetch_one(&mut *tx)
                .await?;
        if live > 0 && !force {
            return Err(StoreError::InvalidOperation(format!(
                "floor {id} still has {live} workspaces; pass force_delete to remove them too"
            )));
        }
        if force {
            sqlx::query("UPDATE workspaces SET deleted_at = now() WHERE floor_id = $1 AND deleted_at IS NULL")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE floors SET deleted_at = now() WHERE id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn deleted_floors(&self) -> StoreResult<Vec<Floor>> {
        let sql = format!("SELECT {FLOOR_COLUMNS} FROM floors WHERE deleted_at IS NOT NULL ORDER BY id");
        convert(sqlx::query_as::<_, FloorRow>(&sql).fetch_all(&self.pool).await?)
    }

    async fn delete_floors(&self, ids: &[Ulid]) -> StoreResult<u64> {
        self.delete_by_ids("floors", ids).await
    }
}

#[async_trait]
impl WorkspaceProvider for PgStore {
    async fn get_one_workspace(&self, id: Ulid) -> StoreResult<Workspace> {
        let sql = format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = $1 AND deleted_at IS NULL");
        sqlx::query_as::<_, WorkspaceRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::not_found("workspace", id))?
            .try_into()
    }

    async fn get_all_workspaces(&self) -> StoreResult<Vec<Workspace>> {
        let sql = format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE deleted_at IS NULL ORDER BY id");
        convert(sqlx::query_as::<_, WorkspaceRow>(&sql).fetch_all(&self.pool).await?)
    }

    async fn workspaces_by_floor(&self, floor_id: Ulid) -> StoreResult<Vec<Workspace>> {
        let sql = format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE floor_id = $1 AND deleted_at IS NULL ORDER BY id"
        );
        convert(
            sqlx::query_as::<_, WorkspaceRow>(&sql)
                .bind(floor_id.to_string())
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn count_workspaces_by_floor(&self, floor_id: Ulid) -> StoreResult<u64> {
        let (n,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workspaces WHERE floor_id = $1 AND deleted_at IS NULL")
                .bind(floor_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(n.max(0) as u64)
    }

    async fn create_workspace(&self, workspace: &Workspace) -> StoreResult<Ulid> {
        insert_workspace(&self.pool, workspace).await?;
        Ok(workspace.id)
    }

    async fn upsert_workspace(&self, workspace: &Workspace) -> StoreResult<bool> {
        // xmax = 0 only on a freshly inserted row
        let row: Option<(bool,)> = sqlx::query_as(
            "INSERT INTO workspaces (id, name, floor_id, details, properties) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE \
                SET name = EXCLUDED.name, floor_id = EXCLUDED.floor_id, \
                    details = EXCLUDED.details, properties = EXCLUDED.properties \
              WHERE workspaces.deleted_at IS NULL \
             RETURNING (xmax = 0)",
        )
        .bind(workspace.id.to_string())
        .bind(&workspace.name)
        .bind(workspace.floor_id.to_string())
        .bind(&workspace.details)
        .bind(Json(&workspace.properties))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((created,)) => Ok(created),
            None => Err(StoreError::InvalidOperation(format!("workspace {} was removed", workspace.id))),
        }
    }

    async fn create_assigned_workspace(
        &self,
        workspace: &Workspace,
        assignment: &Assignment,
        baseline: Option<&Offering>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_workspace(&mut *tx, workspace).await?;
        insert_assignment(&mut *tx, assignment).await?;
        if let Some(offering) = baseline {
            insert_reservation(&mut *tx, Reservations::Offerings, offering.into()).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_workspace(&self, id: Ulid, workspace: &Workspace) -> StoreResult<()> {
        let done = sqlx::query(
            "UPDATE workspaces SET name = $2, floor_id = $3, details = $4, properties = $5 \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id.to_string())
        .bind(&workspace.name)
        .bind(workspace.floor_id.to_string())
        .bind(&workspace.details)
        .bind(Json(&workspace.properties))
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("workspace", id));
        }
        Ok(())
    }

    async fn update_workspace_properties(&self, id: Ulid, properties: &Properties) -> StoreResult<()> {
        let done = sqlx::query("UPDATE workspaces SET properties = $2 WHERE id = $1 AND deleted_at IS NULL")
            .bind(id.to_string())
            .bind(Json(properties))
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("workspace", id));
        }
        Ok(())
    }

    async fn remove_workspace(&self, id: Ulid) -> StoreResult<()> {
        let done = sqlx::query("UPDATE workspaces SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("workspace", id));
        }
        Ok(())
    }

    async fn deleted_workspaces(&self) -> StoreResult<Vec<Workspace>> {
        let sql = format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE deleted_at IS NOT NULL ORDER BY id");
        convert(sqlx::query_as::<_, WorkspaceRow>(&sql).fetch_all(&self.pool).await?)
    }

    async fn delete_workspaces(&self, ids: &[Ulid]) -> StoreResult<u64> {
        self.delete_by_ids("workspaces", ids).await
    }

    async fn workspace_timeline(&self, workspace_id: Ulid, span: Span) -> StoreResult<Timeline> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM workspaces WHERE id = $1")
            .bind(workspace_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::not_found("workspace", workspace_id));
        }
        let mut timeline = Timeline::new(workspace_id);
        for row in self.timeline_rows("w.id = $1", workspace_id.to_string(), span).await? {
            let (_, interval) = row.into_interval()?;
            timeline.insert_interval(interval);
        }
        Ok(timeline)
    }

    async fn floor_timelines(&self, floor_id: Ulid, span: Span) -> StoreResult<Vec<Timeline>> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM floors WHERE id = $1")
            .bind(floor_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::not_found("floor", floor_id));
        }
        let mut timelines: BTreeMap<Ulid, Timeline> = self
            .workspaces_by_floor(floor_id)
            .await?
            .into_iter()
            .map(|w| (w.id, Timeline::new(w.id)))
            .collect();
        let rows = self
            .timeline_rows("w.floor_id = $1 AND w.deleted_at IS NULL", floor_id.to_string(), span)
            .await?;
        for row in rows {
            let (workspace_id, interval) = row.into_interval()?;
            if let Some(timeline) = timelines.get_mut(&workspace_id) {
                timeline.insert_interval(interval);
            }
        }
        Ok(timelines.into_values().collect())
    }
}

#[async_trait]
impl UserProvider for PgStore {
    async fn get_one_user(&self, id: Ulid) -> StoreResult<User> {
        sqlx::query_as::<_, UserRow>("SELECT id, name, department, email, is_admin FROM users WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::not_found("user", id))?
            .try_into()
    }

    async fn get_all_users(&self) -> StoreResult<Vec<User>> {
        convert(
            sqlx::query_as::<_, UserRow>("SELECT id, name, department, email, is_admin FROM users ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn create_user(&self, user: &User) -> StoreResult<Ulid> {
        sqlx::query("INSERT INTO users (id, name, department, email, is_admin) VALUES ($1, $2, $3, $4, $5)")
            .bind(user.id.to_string())
            .bind(&user.name)
            .bind(&user.department)
            .bind(&user.email)
            .bind(user.is_admin)
            .execute(&self.pool)
            .await?;
        Ok(user.id)
    }

    async fn assigned_users_in_range(&self, span: Span) -> StoreResult<Vec<UserAssignment>> {
        self.user_assignments("a.start_time < $2 AND a.end_time > $1", from_ms(span.start)?, from_ms(span.end)?)
            .await
    }

    async fn assigned_users_at(&self, t: DateTime<Utc>) -> StoreResult<Vec<UserAssignment>> {
        self.user_assignments("a.start_time <= $1 AND a.end_time > $2", t, t).await
    }
}

#[async_trait]
impl BookingProvider for PgStore {
    async fn get_one_booking(&self, id: Ulid) -> StoreResult<Booking> {
        self.reservation(Reservations::Bookings, id).await?.try_into()
    }

    async fn get_one_expanded_booking(&self, id: Ulid) -> StoreResult<ExpandedBooking> {
        self.expanded(Reservations::Bookings, id).await?.try_into()
    }

    async fn bookings(&self, filter: RecordFilter) -> StoreResult<Vec<Booking>> {
        convert(self.reservations(Reservations::Bookings, filter).await?)
    }

    async fn expanded_bookings(&self, filter: RecordFilter) -> StoreResult<Vec<ExpandedBooking>> {
        convert(self.expanded_list(Reservations::Bookings, filter).await?)
    }

    async fn create_booking(&self, booking: &Booking) -> StoreResult<Ulid> {
        insert_reservation(&self.pool, Reservations::Bookings, booking.into()).await?;
        Ok(booking.id)
    }

    async fn update_booking(&self, id: Ulid, booking: &Booking) -> StoreResult<()> {
        self.update_reservation(Reservations::Bookings, id, booking.into()).await
    }

    async fn remove_booking(&self, id: Ulid) -> StoreResult<()> {
        self.remove_by_id(Reservations::Bookings, id).await
    }

    async fn expired_bookings(&self, since: DateTime<Utc>) -> StoreResult<Vec<Booking>> {
        convert(self.expired(Reservations::Bookings, since).await?)
    }

    async fn delete_bookings(&self, ids: &[Ulid]) -> StoreResult<u64> {
        self.delete_by_ids("bookings", ids).await
    }
}

#[async_trait]
impl OfferingProvider for PgStore {
    async fn get_one_offering(&self, id: Ulid) -> StoreResult<Offering> {
        self.reservation(Reservations::Offerings, id).await?.try_into()
    }

    async fn get_one_expanded_offering(&self, id: Ulid) -> StoreResult<ExpandedOffering> {
        self.expanded(Reservations::Offerings, id).await?.try_into()
    }

    async fn offerings(&self, filter: RecordFilter) -> StoreResult<Vec<Offering>> {
        convert(self.reservations(Reservations::Offerings, filter).await?)
    }

    async fn expanded_offerings(&self, filter: RecordFilter) -> StoreResult<Vec<ExpandedOffering>> {
        convert(self.expanded_list(Reservations::Offerings, filter).await?)
    }

    async fn offering_covering(&self, workspace_id: Ulid, span: Span) -> StoreResult<Offering> {
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM offerings r \
             WHERE r.workspace_id = $1 AND NOT r.cancelled AND r.start_time <= $2 AND r.end_time >= $3 \
             ORDER BY r.start_time, r.id LIMIT 1"
        );
        sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(workspace_id.to_string())
            .bind(from_ms(span.start)?)
            .bind(from_ms(span.end)?)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::Empty("no offering covers the window"))?
            .try_into()
    }

    async fn create_offering(&self, offering: &Offering) -> StoreResult<Ulid> {
        insert_reservation(&self.pool, Reservations::Offerings, offering.into()).await?;
        Ok(offering.id)
    }

    async fn update_offering(&self, id: Ulid, offering: &Offering) -> StoreResult<()> {
        self.update_reservation(Reservations::Offerings, id, offering.into()).await
    }

    async fn remove_offering(&self, id: Ulid) -> StoreResult<()> {
        self.remove_by_id(Reservations::Offerings, id).await
    }

    async fn expired_offerings(&self, since: DateTime<Utc>) -> StoreResult<Vec<Offering>> {
        convert(self.expired(Reservations::Offerings, since).await?)
    }

    async fn delete_offerings(&self, ids: &[Ulid]) -> StoreResult<u64> {
        self.delete_by_ids("offerings", ids).await
    }
}

const ASSIGNMENT_COLUMNS: &str = "id, workspace_id, user_id, start_time, end_time";

#[async_trait]
impl AssigneeProvider for PgStore {
    async fn create_assignment(&self, assignment: &Assignment, baseline: Option<&Offering>) -> StoreResult<Ulid> {
        let Some(offering) = baseline else {
            insert_assignment(&self.pool, assignment).await?;
            return Ok(assignment.id);
        };
        let mut tx = self.pool.begin().await?;
        insert_assignment(&mut *tx, assignment).await?;
        insert_reservation(&mut *tx, Reservations::Offerings, offering.into()).await?;
        tx.commit().await?;
        Ok(assignment.id)
    }

    async fn assignments(&self, filter: RecordFilter) -> StoreResult<Vec<Assignment>> {
        let binds = FilterBinds::new(filter)?;
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments r WHERE {} ORDER BY r.start_time, r.id",
            FilterBinds::clause("r")
        );
        convert(
            sqlx::query_as::<_, AssignmentRow>(&sql)
                .bind(binds.workspace_id)
                .bind(binds.user_id)
                .bind(binds.start)
                .bind(binds.end)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn is_assigned(&self, workspace_id: Ulid, span: Span) -> StoreResult<bool> {
        let (assigned,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM assignments \
             WHERE workspace_id = $1 AND start_time < $3 AND end_time > $2)",
        )
        .bind(workspace_id.to_string())
        .bind(from_ms(span.start)?)
        .bind(from_ms(span.end)?)
        .fetch_one(&self.pool)
        .await?;
        Ok(assigned)
    }

    async fn is_fully_assigned(&self, workspace_id: Ulid, span: Span) -> StoreResult<bool> {
        let rows: Vec<(DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT start_time, end_time FROM assignments \
             WHERE workspace_id = $1 AND start_time < $3 AND end_time > $2",
        )
        .bind(workspace_id.to_string())
        .bind(from_ms(span.start)?)
        .bind(from_ms(span.end)?)
        .fetch_all(&self.pool)
        .await?;
        let mut held: Vec<Span> = rows
            .iter()
            .map(|(s, e)| Span::new(to_ms(s), to_ms(e)))
            .collect();
        Ok(fully_covered(&mut held, &span))
    }

    async fn expired_assignments(&self, since: DateTime<Utc>) -> StoreResult<Vec<Assignment>> {
        let sql = format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE end_time < $1 ORDER BY start_time, id");
        convert(
            sqlx::query_as::<_, AssignmentRow>(&sql)
                .bind(since)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn delete_assignments(&self, ids: &[Ulid]) -> StoreResult<u64> {
        self.delete_by_ids("assignments", ids).await
    }
}

#[async_trait]
impl Closable for PgStore {
    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("postgres pool closed");
    }
}
