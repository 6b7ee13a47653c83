use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashMap;

/// Per-school slot counts derived from the shift table, one entry per
/// weekday (Monday-first). 0 means no shift defined for that weekday.
pub type DaySlots = [usize; 7];

/// Explicit cache for shift-derived slot counts, keyed by school. Built on
/// demand, dropped on `invalidate` when a school's shifts are rewritten.
/// Owned by the app state and passed where needed; never package-level.
#[derive(Default)]
pub struct ShiftCache {
    day_slots: HashMap<String, DaySlots>,
}

impl ShiftCache {
    pub fn day_slots(&mut self, conn: &Connection, school_id: &str) -> Result<DaySlots> {
        if let Some(slots) = self.day_slots.get(school_id) {
            return Ok(*slots);
        }
        let mut slots: DaySlots = [0; 7];
        let mut stmt = conn.prepare(
            "SELECT weekday, MAX(hour) FROM shifts WHERE school_id = ? GROUP BY weekday",
        )?;
        let rows = stmt.query_map([school_id], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (weekday, max_hour) = row?;
            if (0..7).contains(&weekday) && max_hour >= 0 {
                slots[weekday as usize] = (max_hour + 1) as usize;
            }
        }
        self.day_slots.insert(school_id.to_string(), slots);
        Ok(slots)
    }

    pub fn invalidate(&mut self, school_id: &str) {
        self.day_slots.remove(school_id);
    }

    /// Workspace switch drops everything.
    pub fn clear(&mut self) {
        self.day_slots.clear();
    }
}
