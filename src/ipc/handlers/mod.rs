pub mod core;
pub mod lessons;
pub mod maintenance;
pub mod periods;
pub mod schools;
pub mod shifts;
pub mod timetables;
