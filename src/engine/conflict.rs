use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::fully_covered;

use super::availability::{booking_conflict, uncovered_spans};
use super::EngineError;

/// Parse a `[start, end)` pair into a span, enforcing start < end and sanity bounds.
/// Both ends must sit on a whole millisecond: the oracle works in milliseconds
/// and the stored record has to be the span it checked.
pub(crate) fn validate_window(start: &DateTime<Utc>, end: &DateTime<Utc>) -> Result<Span, EngineError> {
    for (field, t) in [("start_time", start), ("end_time", end)] {
        if t.timestamp_subsec_nanos() % 1_000_000 != 0 {
            return Err(EngineError::Validation(format!(
                "{field} has sub-millisecond precision"
            )));
        }
    }
    let span = Span::from_times(start, end)
        .ok_or_else(|| EngineError::Validation("start_time must be before end_time".into()))?;
    validate_span(&span)?;
    Ok(span)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_query_window(start: &DateTime<Utc>, end: &DateTime<Utc>) -> Result<Span, EngineError> {
    let span = Span::from_times(start, end)
        .ok_or_else(|| EngineError::Validation("start must be before end".into()))?;
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(span)
}

pub(crate) fn validate_text(field: &str, value: &str, max: usize, required: bool) -> Result<(), EngineError> {
    if required && value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} must not be empty")));
    }
    if value.len() > max {
        return Err(EngineError::Validation(format!("{field} longer than {max} bytes")));
    }
    Ok(())
}

pub(crate) fn validate_properties(properties: &Properties) -> Result<(), EngineError> {
    let size = serde_json::to_vec(properties)
        .map_err(|e| EngineError::Validation(format!("properties: {e}")))?
        .len();
    if size > MAX_PROPERTIES_BYTES {
        return Err(EngineError::LimitExceeded("properties too large"));
    }
    Ok(())
}

/// A booking over `span` must not overlap another live booking and must be
/// released by an assignee wherever the workspace is assigned.
pub(crate) fn check_bookable(timeline: &Timeline, span: &Span) -> Result<(), EngineError> {
    if let Some(existing) = booking_conflict(timeline, span) {
        return Err(EngineError::BookingConflict {
            workspace_id: timeline.workspace_id,
            booking_id: existing.id,
            span: existing.span,
        });
    }
    if let Some(gap) = uncovered_spans(timeline, span).first() {
        return Err(EngineError::NotOffered {
            workspace_id: timeline.workspace_id,
            span: *gap,
        });
    }
    Ok(())
}

/// An offering needs a covering assignment held by the same user and must
/// not overlap that user's other live offerings on the workspace.
pub(crate) fn check_offerable(timeline: &Timeline, user_id: Ulid, span: &Span) -> Result<(), EngineError> {
    let mut held: Vec<Span> = timeline
        .overlapping(span)
        .filter(|i| i.kind == IntervalKind::Assignment { user_id })
        .map(|i| i.span)
        .collect();
    if !fully_covered(&mut held, span) {
        return Err(EngineError::NotAssigned {
            workspace_id: timeline.workspace_id,
            user_id,
        });
    }
    if let Some(other) = timeline
        .overlapping(span)
        .find(|i| i.kind == IntervalKind::Offering { user_id })
    {
        return Err(EngineError::OfferingOverlap(other.id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const H: Ms = 3_600_000;
    const BASE: Ms = 1_740_819_600_000; // 2025-03-01T09:00:00Z

    #[test]
    fn reversed_window_is_validation_error() {
        let a = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        assert!(matches!(validate_window(&a, &b), Err(EngineError::Validation(_))));
        assert!(matches!(validate_window(&a, &a), Err(EngineError::Validation(_))));
        assert_eq!(validate_window(&b, &a).unwrap(), Span::new(BASE, BASE + H));
    }

    #[test]
    fn ancient_timestamps_rejected() {
        let a = Utc.with_ymd_and_hms(1990, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(1990, 1, 2, 0, 0, 0).unwrap();
        assert!(matches!(validate_window(&a, &b), Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn blank_name_rejected() {
        assert!(validate_text("name", "  ", MAX_NAME_LEN, true).is_err());
        assert!(validate_text("details", "", MAX_DETAILS_LEN, false).is_ok());
        assert!(validate_text("name", &"x".repeat(MAX_NAME_LEN + 1), MAX_NAME_LEN, true).is_err());
    }

    #[test]
    fn offering_requires_own_assignment() {
        let u1 = Ulid::new();
        let u2 = Ulid::new();
        let mut tl = Timeline::new(Ulid::new());
        tl.insert_interval(Interval::assignment(Ulid::new(), Span::new(BASE, BASE + 8 * H), u1));
        let span = Span::new(BASE + H, BASE + 2 * H);

        assert!(check_offerable(&tl, u1, &span).is_ok());
        assert!(matches!(
            check_offerable(&tl, u2, &span),
            Err(EngineError::NotAssigned { .. })
        ));
        assert!(matches!(
            check_offerable(&tl, u1, &Span::new(BASE + 7 * H, BASE + 9 * H)),
            Err(EngineError::NotAssigned { .. })
        ));

        let existing = Ulid::new();
        tl.insert_interval(Interval::offering(existing, Span::new(BASE, BASE + 2 * H), u1));
        match check_offerable(&tl, u1, &span) {
            Err(EngineError::OfferingOverlap(id)) => assert_eq!(id, existing),
            other => panic!("expected overlap, got {other:?}"),
        }
        assert!(check_offerable(&tl, u1, &Span::new(BASE + 2 * H, BASE + 3 * H)).is_ok());
    }

    #[test]
    fn bookable_reports_first_gap() {
        let u1 = Ulid::new();
        let ws = Ulid::new();
        let mut tl = Timeline::new(ws);
        tl.insert_interval(Interval::assignment(Ulid::new(), Span::new(BASE + H, BASE + 3 * H), u1));
        match check_bookable(&tl, &Span::new(BASE, BASE + 4 * H)) {
            Err(EngineError::NotOffered { workspace_id, span }) => {
                assert_eq!(workspace_id, ws);
                assert_eq!(span, Span::new(BASE + H, BASE + 3 * H));
            }
            other => panic!("expected NotOffered, got {other:?}"),
        }
    }
}
