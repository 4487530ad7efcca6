use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

// ── Availability Oracle ───────────────────────────────────────────

/// True iff an arbitrary user may book the workspace for all of `window`.
pub fn is_available(timeline: &Timeline, window: &Span) -> bool {
    booking_conflict(timeline, window).is_none() && uncovered_spans(timeline, window).is_empty()
}

/// Every sub-interval of `window` in which the workspace cannot be booked,
/// sorted and merged.
pub fn unavailable_spans(timeline: &Timeline, window: &Span) -> Vec<Span> {
    let mut blocked: Vec<Span> = timeline
        .overlapping(window)
        .filter(|i| i.is_booking())
        .map(|i| i.span.clamp_to(window))
        .collect();
    blocked.extend(uncovered_spans(timeline, window));
    blocked.sort_by_key(|s| s.start);
    merge_overlapping(&blocked)
}

/// First live booking overlapping `window`.
pub fn booking_conflict<'a>(timeline: &'a Timeline, window: &Span) -> Option<&'a Interval> {
    timeline.overlapping(window).find(|i| i.is_booking())
}

#[derive(Default, Clone, Copy)]
struct Coverage {
    assigned: u32,
    offered: u32,
}

impl Coverage {
    fn is_assignee(&self) -> bool {
        self.assigned > 0
    }

    fn is_satisfied(&self) -> bool {
        self.assigned > 0 && self.offered > 0
    }
}

#[derive(Clone, Copy)]
enum Role {
    Assigned,
    Offered,
}

/// Sub-intervals of `window` where someone holds the workspace and none of
/// the current assignees has offered it.
///
/// Sweep over assignment/offering endpoints clamped to the window. Between
/// two consecutive endpoints the predicate is constant. Ends sort before
/// starts at equal timestamps so back-to-back intervals never overlap.
pub fn uncovered_spans(timeline: &Timeline, window: &Span) -> Vec<Span> {
    let mut events: Vec<(Ms, i32, Role, Ulid)> = Vec::new();
    for interval in timeline.overlapping(window) {
        let (role, user_id) = match interval.kind {
            IntervalKind::Assignment { user_id } => (Role::Assigned, user_id),
            IntervalKind::Offering { user_id } => (Role::Offered, user_id),
            IntervalKind::Booking => continue,
        };
        let clamped = interval.span.clamp_to(window);
        events.push((clamped.start, 1, role, user_id));
        events.push((clamped.end, -1, role, user_id));
    }
    if events.is_empty() {
        return Vec::new();
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut per_user: HashMap<Ulid, Coverage> = HashMap::new();
    let mut assignees = 0u32;
    let mut satisfied = 0u32;
    let mut uncovered: Vec<Span> = Vec::new();
    let mut cursor = window.start;

    let mut i = 0;
    while i < events.len() {
        let t = events[i].0;
        if t > cursor {
            if assignees > 0 && satisfied == 0 {
                push_merged(&mut uncovered, Span::new(cursor, t));
            }
            cursor = t;
        }
        while i < events.len() && events[i].0 == t {
            let (_, delta, role, user_id) = events[i];
            let entry = per_user.entry(user_id).or_default();
            let before = *entry;
            let counter = match role {
                Role::Assigned => &mut entry.assigned,
                Role::Offered => &mut entry.offered,
            };
            *counter = counter.saturating_add_signed(delta);
            let after = *entry;

            match (before.is_assignee(), after.is_assignee()) {
                (false, true) => assignees += 1,
                (true, false) => assignees -= 1,
                _ => {}
            }
            match (before.is_satisfied(), after.is_satisfied()) {
                (false, true) => satisfied += 1,
                (true, false) => satisfied -= 1,
                _ => {}
            }
            i += 1;
        }
    }
    if cursor < window.end && assignees > 0 && satisfied == 0 {
        push_merged(&mut uncovered, Span::new(cursor, window.end));
    }
    uncovered
}

fn push_merged(out: &mut Vec<Span>, span: Span) {
    if let Some(last) = out.last_mut()
        && last.end == span.start {
            last.end = span.end;
            return;
        }
    out.push(span);
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
