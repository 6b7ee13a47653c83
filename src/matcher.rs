use crate::calendar::{week_key, WeekKey};
use crate::store::Lesson;
use chrono::NaiveDate;
use std::collections::HashMap;
use uuid::Uuid;

/// Hour value used for candidates with no stored hour-index. Far enough from
/// any real slot that an hour-bearing candidate always wins.
const MISSING_HOUR: i64 = -100;

/// Working set of existing lessons for one reconciliation run.
///
/// Lessons live in an arena and are consumed by flipping a marker, so
/// candidate lists stay stable while the matcher walks them. Grouped by
/// ISO week then subject; per-week totals feed the back-fill guard.
pub struct WeekIndex {
    arena: Vec<Lesson>,
    consumed: Vec<bool>,
    by_week_subject: HashMap<WeekKey, HashMap<String, Vec<usize>>>,
    week_counts: HashMap<WeekKey, usize>,
}

impl WeekIndex {
    pub fn build(lessons: Vec<Lesson>) -> Self {
        let mut by_week_subject: HashMap<WeekKey, HashMap<String, Vec<usize>>> = HashMap::new();
        let mut week_counts: HashMap<WeekKey, usize> = HashMap::new();
        for (i, lesson) in lessons.iter().enumerate() {
            let week = week_key(lesson.date);
            by_week_subject
                .entry(week)
                .or_default()
                .entry(lesson.subject_id.clone())
                .or_default()
                .push(i);
            *week_counts.entry(week).or_insert(0) += 1;
        }
        let consumed = vec![false; lessons.len()];
        WeekIndex {
            arena: lessons,
            consumed,
            by_week_subject,
            week_counts,
        }
    }

    /// Existing-lesson count for a week, counting consumed ones too: the
    /// back-fill guard looks at what was fetched, not at what is left.
    pub fn week_count(&self, week: WeekKey) -> usize {
        self.week_counts.get(&week).copied().unwrap_or(0)
    }

    pub fn lesson(&self, idx: usize) -> &Lesson {
        &self.arena[idx]
    }

    fn consume(&mut self, idx: usize) {
        self.consumed[idx] = true;
    }

    /// Lessons never claimed by any template slot this run.
    pub fn unconsumed(&self) -> impl Iterator<Item = &Lesson> {
        self.arena
            .iter()
            .zip(self.consumed.iter())
            .filter(|(_, consumed)| !**consumed)
            .map(|(lesson, _)| lesson)
    }

    /// Best unconsumed candidate for a subject slot, by weighted distance
    /// `|date_diff_seconds| * (|hour_diff| * 100 + 1)`. Same-date candidates
    /// all score 0, so distance ties fall back to the smaller hour gap (a
    /// lesson already in the right slot must keep it, or re-runs would keep
    /// swapping same-day duplicates) and then to the larger id so the pick
    /// is deterministic.
    fn find_closest_lesson(
        &self,
        week: WeekKey,
        subject_id: &str,
        date: NaiveDate,
        hour: i64,
    ) -> Option<usize> {
        let indices = self.by_week_subject.get(&week)?.get(subject_id)?;
        let mut best: Option<(usize, i64, i64)> = None;
        for &idx in indices {
            if self.consumed[idx] {
                continue;
            }
            let lesson = &self.arena[idx];
            let date_diff_secs = (lesson.date - date).num_days().abs() * 86_400;
            let hour_diff = (lesson.hour.unwrap_or(MISSING_HOUR) - hour).abs();
            let distance = date_diff_secs * (hour_diff * 100 + 1);
            let better = match best {
                None => true,
                Some((best_idx, best_distance, best_hour_diff)) => {
                    distance < best_distance
                        || (distance == best_distance
                            && (hour_diff < best_hour_diff
                                || (hour_diff == best_hour_diff
                                    && lesson.id > self.arena[best_idx].id)))
                }
            };
            if better {
                best = Some((idx, distance, hour_diff));
            }
        }
        best.map(|(idx, _, _)| idx)
    }
}

/// One template slot resolved against reality.
#[derive(Debug, Clone)]
pub enum SlotAction {
    Create(Lesson),
    Update(Lesson),
}

/// One calendar date to be matched against a weekday's template row.
pub struct DayPlan<'a> {
    pub date: NaiveDate,
    pub row: &'a [String],
    pub classroom_id: &'a str,
    pub period_id: &'a str,
    pub period_key: i64,
    /// Back-fill mode: emit creates for every non-empty slot without
    /// consulting or consuming existing lessons.
    pub create_only: bool,
}

/// Matches each non-empty hour slot of one date's template row to an existing
/// lesson (consuming it) or emits a create. A matched lesson already on the
/// right date and hour yields no action; otherwise it is moved in place,
/// keeping its id and everything attached to it.
pub fn match_day(index: &mut WeekIndex, plan: &DayPlan) -> Vec<SlotAction> {
    let week = week_key(plan.date);
    let mut actions = Vec::new();
    for (hour, subject_raw) in plan.row.iter().enumerate() {
        let subject_id = subject_raw.trim();
        if subject_id.is_empty() {
            continue;
        }
        let hour = hour as i64;
        let chosen = if plan.create_only {
            None
        } else {
            index.find_closest_lesson(week, subject_id, plan.date, hour)
        };
        match chosen {
            None => actions.push(SlotAction::Create(Lesson {
                id: Uuid::new_v4().to_string(),
                classroom_id: plan.classroom_id.to_string(),
                subject_id: subject_id.to_string(),
                date: plan.date,
                hour: Some(hour),
                period_id: plan.period_id.to_string(),
                period_key: plan.period_key,
            })),
            Some(idx) => {
                index.consume(idx);
                let existing = index.lesson(idx);
                if existing.date == plan.date && existing.hour == Some(hour) {
                    continue;
                }
                let mut moved = existing.clone();
                moved.date = plan.date;
                moved.hour = Some(hour);
                moved.period_id = plan.period_id.to_string();
                moved.period_key = plan.period_key;
                actions.push(SlotAction::Update(moved));
            }
        }
    }
    actions
}
